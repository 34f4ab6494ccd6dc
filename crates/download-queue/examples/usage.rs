use std::time::Duration;

use download_queue::prelude::*;
use futures_util::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    // Configure logs via RUST_LOG if provided, else show info logs globally
    // and debug logs for this crate.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,download_queue=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let Some(url) = args.next() else {
        anyhow::bail!("usage: usage <url> [mp4|webm|mkv|audio|mobile] [best|worst|1080p|720p|...]");
    };
    let format: OutputFormat = args
        .next()
        .as_deref()
        .unwrap_or("mp4")
        .parse()
        .map_err(anyhow::Error::msg)?;
    let quality: Quality = args
        .next()
        .as_deref()
        .unwrap_or("best")
        .parse()
        .map_err(anyhow::Error::msg)?;

    // MAX_CONCURRENT_DOWNLOADS, DOWNLOAD_DIR, TASK_TIMEOUT_SECS, ...
    let queue = DownloadQueue::builder().config(QueueConfig::from_env()?).build()?;

    let mut events = queue.events();
    tokio::spawn(async move {
        while let Some(ev) = events.next().await {
            if !matches!(ev, TaskEvent::Progress { .. }) {
                info!(event = %ev, "event");
            }
        }
    });

    let id = queue
        .download_builder()
        .url(url)
        .format(format)
        .quality(quality)
        .submit()?;

    // Poll like an HTTP client would.
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let task = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!(id, "interrupted, cancelling");
                queue.cancel(id)?;
            }
            _ = ticker.tick() => {
                let task = queue.get_status(id)?;
                if task.is_terminal() {
                    break task;
                }
                info!(
                    id,
                    status = %task.status(),
                    progress = %format!("{:.1}%", task.progress()),
                    speed = task.speed().map(|bps| bps as u64),
                    eta = task.eta(),
                    "polling"
                );
            }
        }
    };

    match (task.result(), task.error()) {
        (Some(result), _) => {
            info!(path = %result.path.display(), bytes = result.size, "download completed")
        }
        (_, Some(failure)) => {
            error!(kind = %failure.kind, error = %failure.message, "download failed")
        }
        _ => warn!(status = %task.status(), "download did not complete"),
    }

    // Graceful shutdown (waits for any background tasks to finish)
    queue.shutdown().await;

    Ok(())
}
