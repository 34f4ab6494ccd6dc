use crate::{
    context::Context,
    postprocess::PostprocessOptions,
    progress::ProgressReporter,
    request::Request,
    source::{MediaFormat, MediaInfo},
    ErrorKind, StoreError, Task, TaskError, TaskEvent, TaskId, TaskResult, TaskStatus,
};
use futures_util::StreamExt;
use reqwest::Url;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_TITLE_CHARS: usize = 100;

pub struct ExponentialBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt as i32);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

static BACKOFF_STRATEGY: ExponentialBackoff = ExponentialBackoff {
    base_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(10),
};

/// Drive one task from `queued` to a terminal state.
///
/// Every file the worker creates is recorded in `scratch` and deleted on
/// exit; on success only the delivered file survives.
pub(crate) async fn run(ctx: &Arc<Context>, request: Request) {
    let id = request.id;
    let mut scratch = Vec::new();

    let outcome = match ctx.config.task_timeout() {
        None => execute(ctx, &request, &request.cancel_token, &mut scratch).await,
        Some(limit) => {
            let deadline = request.cancel_token.child_token();
            let outcome = {
                let exec = execute(ctx, &request, &deadline, &mut scratch);
                tokio::pin!(exec);
                tokio::select! {
                    outcome = &mut exec => outcome,
                    _ = tokio::time::sleep(limit) => {
                        deadline.cancel();
                        exec.await
                    }
                }
            };
            match outcome {
                Err(TaskError::Cancelled)
                    if deadline.is_cancelled() && !request.cancel_token.is_cancelled() =>
                {
                    Err(TaskError::TimedOut(limit))
                }
                other => other,
            }
        }
    };

    finalize(ctx, id, &scratch, outcome).await;
}

async fn execute(
    ctx: &Context,
    request: &Request,
    cancel: &CancellationToken,
    scratch: &mut Vec<PathBuf>,
) -> Result<TaskResult, TaskError> {
    let id = request.id;
    let spec = &request.spec;

    if cancel.is_cancelled() {
        return Err(TaskError::Cancelled);
    }
    enter(ctx, id, TaskStatus::FetchingInfo, |_| {})?;

    let info = fetch_info(ctx, id, &request.url, cancel).await?;
    check_limits(ctx, &info)?;
    let format = ctx.extractor.select_format(
        &info,
        spec.effective_quality(),
        spec.wants_audio(),
        spec.target_ext(),
    )?;
    if let (Some(limit), Some(size)) = (ctx.config.max_file_size(), format.size_hint()) {
        if size > limit {
            return Err(TaskError::LimitExceeded(format!(
                "file size of {size} bytes exceeds the limit of {limit} bytes"
            )));
        }
    }
    debug!(
        id,
        format = %format.format_id,
        ext = %format.ext,
        height = ?format.height,
        "selected format"
    );

    if cancel.is_cancelled() {
        return Err(TaskError::Cancelled);
    }
    enter(ctx, id, TaskStatus::Downloading, |task| task.set_title(info.title.clone()))?;
    let part = transfer(ctx, request, &format, cancel, scratch).await?;

    if cancel.is_cancelled() {
        return Err(TaskError::Cancelled);
    }
    enter(ctx, id, TaskStatus::Processing, |_| {})?;

    let produced = match PostprocessOptions::plan(spec.wants_audio(), spec.target_ext(), &format) {
        None => part,
        Some(options) => {
            debug!(id, action = ?options.action, "post-processing");
            // An interrupted run may leave a partial output behind.
            scratch.push(options.output_path(&part));
            let output = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TaskError::Cancelled),
                output = ctx.postprocessor.postprocess(&part, &options) => output?,
            };
            if !scratch.contains(&output) {
                scratch.push(output.clone());
            }
            output
        }
    };

    if cancel.is_cancelled() {
        return Err(TaskError::Cancelled);
    }
    deliver(ctx, id, &info.title, &produced, spec.target_ext()).await
}

/// Write the phase change into the store and announce it. A task that was
/// finished behind our back (cancelled while queued) reads as cancelled.
fn enter(
    ctx: &Context,
    id: TaskId,
    next: TaskStatus,
    prepare: impl FnOnce(&mut Task),
) -> Result<(), TaskError> {
    let written = ctx.store.update(id, |task| {
        prepare(task);
        task.transition(next)
    });
    match written.and_then(|inner| inner) {
        Ok(()) => {
            debug!(id, status = %next, "task entered phase");
            ctx.emit(TaskEvent::StatusChanged { id, status: next });
            Ok(())
        }
        Err(StoreError::Finished { .. }) => Err(TaskError::Cancelled),
        Err(error) => Err(error.into()),
    }
}

async fn fetch_info(
    ctx: &Context,
    id: TaskId,
    url: &Url,
    cancel: &CancellationToken,
) -> Result<MediaInfo, TaskError> {
    let retries = ctx.config.fetch_retries();
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TaskError::Cancelled),
            result = ctx.extractor.fetch_metadata(url) => result,
        };

        match result {
            Err(error) if error.kind() == ErrorKind::TransferError && attempt < retries => {
                let delay = BACKOFF_STRATEGY.next_delay(attempt);
                attempt += 1;
                warn!(id, attempt, ?delay, %error, "metadata lookup failed, retrying");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TaskError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Ok(info) => {
                debug!(id, title = %info.title, formats = info.formats.len(), "fetched metadata");
                return Ok(info);
            }
            Err(error) => return Err(error),
        }
    }
}

fn check_limits(ctx: &Context, info: &MediaInfo) -> Result<(), TaskError> {
    if info.is_live {
        return Err(TaskError::SourceUnavailable("live streams cannot be downloaded".into()));
    }
    if let (Some(limit), Some(duration)) = (ctx.config.max_duration(), info.duration) {
        if duration > limit {
            return Err(TaskError::LimitExceeded(format!(
                "duration of {}s exceeds the limit of {}s",
                duration.as_secs(),
                limit.as_secs()
            )));
        }
    }
    Ok(())
}

async fn transfer(
    ctx: &Context,
    request: &Request,
    format: &MediaFormat,
    cancel: &CancellationToken,
    scratch: &mut Vec<PathBuf>,
) -> Result<PathBuf, TaskError> {
    let id = request.id;
    let transfer = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TaskError::Cancelled),
        transfer = ctx.extractor.open(&request.url, format) => transfer?,
    };
    let total_bytes = transfer.total_bytes;
    ctx.store.update(id, |task| task.set_total_bytes(total_bytes))?;

    let temp_dir = ctx.config.temp_dir();
    tokio::fs::create_dir_all(temp_dir).await?;
    let part = temp_dir.join(format!("task-{id}.{}", sanitize_filename::sanitize(&format.ext)));
    scratch.push(part.clone());
    let mut file = File::create(&part).await?;

    info!(id, url = %request.url, ?total_bytes, "download started");
    let mut reporter = ProgressReporter::new(
        id,
        ctx.store.clone(),
        ctx.events.clone(),
        total_bytes,
        ctx.config.progress_interval(),
    );
    let max_file_size = ctx.config.max_file_size();
    let mut stream = transfer.stream;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TaskError::Cancelled),
            chunk = stream.next() => match chunk {
                Some(Ok(chunk)) => {
                    file.write_all(&chunk).await?;
                    reporter.advance(chunk.len() as u64);
                    let received = reporter.progress().bytes_downloaded();
                    if let Some(limit) = max_file_size.filter(|&limit| received > limit) {
                        return Err(TaskError::LimitExceeded(format!(
                            "download grew past the limit of {limit} bytes"
                        )));
                    }
                }
                Some(Err(error)) => return Err(error),
                None => break,
            }
        }
    }

    // Ensure the data is written to disk
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    reporter.finish();
    debug!(
        id,
        bytes = reporter.progress().bytes_downloaded(),
        elapsed = ?reporter.progress().elapsed(),
        "transfer finished"
    );
    Ok(part)
}

async fn deliver(
    ctx: &Context,
    id: TaskId,
    title: &str,
    produced: &Path,
    fallback_ext: &str,
) -> Result<TaskResult, TaskError> {
    let download_dir = ctx.config.download_dir();
    tokio::fs::create_dir_all(download_dir).await?;

    let ext = produced
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or(fallback_ext);
    let filename = final_name(title, id, ext);
    let path = download_dir.join(&filename);
    move_file(produced, &path).await?;
    let size = tokio::fs::metadata(&path).await?.len();

    Ok(TaskResult { filename, path, size })
}

/// `<sanitized title>_<id>.<ext>`; the id keeps names unique.
fn final_name(title: &str, id: TaskId, ext: &str) -> String {
    let title: String = sanitize_filename::sanitize(title)
        .trim()
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();
    let title = title.trim();
    let title = if title.is_empty() { "download" } else { title };
    format!("{title}_{id}.{}", sanitize_filename::sanitize(ext))
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Different filesystems; fall back to copying.
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

async fn cleanup(id: TaskId, scratch: &[PathBuf]) {
    for path in scratch {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(id, path = %path.display(), "removed scratch file"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                warn!(id, path = %path.display(), %error, "failed to remove scratch file")
            }
        }
    }
}

async fn finalize(
    ctx: &Context,
    id: TaskId,
    scratch: &[PathBuf],
    outcome: Result<TaskResult, TaskError>,
) {
    cleanup(id, scratch).await;

    match outcome {
        Ok(result) => {
            let written = ctx.store.update(id, |task| task.complete(result.clone()));
            match written.and_then(|inner| inner) {
                Ok(()) => {
                    info!(
                        id,
                        path = %result.path.display(),
                        size = result.size,
                        "download completed"
                    );
                    ctx.emit(TaskEvent::Completed {
                        id,
                        path: result.path,
                        size: result.size,
                    });
                }
                Err(error) => {
                    warn!(id, %error, "could not record completion, discarding download");
                    let _ = tokio::fs::remove_file(&result.path).await;
                }
            }
        }
        Err(TaskError::Cancelled) => {
            if let Ok(Ok(())) = ctx.store.update(id, |task| task.cancel()) {
                info!(id, "download cancelled");
                ctx.emit(TaskEvent::Cancelled { id });
            }
        }
        Err(error) => {
            let kind = error.kind();
            let message = error.to_string();
            warn!(id, %kind, error = %message, "download failed");
            if let Ok(Ok(())) = ctx.store.update(id, |task| task.fail(kind, message.clone())) {
                ctx.emit(TaskEvent::Failed {
                    id,
                    kind,
                    error: message,
                });
            }
        }
    }

    ctx.forget_token(id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(BACKOFF_STRATEGY.next_delay(0), Duration::from_secs(1));
        assert_eq!(BACKOFF_STRATEGY.next_delay(1), Duration::from_secs(2));
        assert_eq!(BACKOFF_STRATEGY.next_delay(3), Duration::from_secs(8));
        assert_eq!(BACKOFF_STRATEGY.next_delay(10), Duration::from_secs(10));
    }

    #[test]
    fn final_names_are_safe_and_unique() {
        assert_eq!(
            final_name("Never Gonna Give You Up", 7, "mp4"),
            "Never Gonna Give You Up_7.mp4"
        );
        assert_eq!(final_name("a/b:c", 1, "mp3"), "abc_1.mp3");
        assert_eq!(final_name("  ", 3, "webm"), "download_3.webm");
        assert_eq!(final_name("../..", 4, "mp4"), "download_4.mp4");

        let long = "x".repeat(300);
        let name = final_name(&long, 12, "mkv");
        assert_eq!(name.len(), MAX_TITLE_CHARS + "_12.mkv".len());
    }

    #[tokio::test]
    async fn move_file_relocates_content() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.part");
        let to = dir.path().join("a.mp4");
        tokio::fs::write(&from, b"data").await.unwrap();

        move_file(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(tokio::fs::read(&to).await.unwrap(), b"data");
    }
}
