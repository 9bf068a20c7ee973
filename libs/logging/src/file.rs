//! File logger for the agent.
//!
//! Writes a single line-oriented `agent.log` in the given directory through
//! a non-blocking appender so that logging never stalls the packet paths.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::Layer;

pub const LOG_FILE_NAME: &str = "agent.log";

/// How many lines we will at most buffer in the channel with the background
/// thread that writes to disk. Only bursts need to fit; the background thread
/// drains continuously.
const MAX_BUFFERED_LINES: usize = 1024;

/// Create a new file logger layer writing to `<log_dir>/agent.log`.
///
/// The returned [`Handle`] owns the appender's worker guard; dropping it stops
/// log lines from reaching the file.
pub fn layer<T>(log_dir: &Path) -> Result<(Box<dyn Layer<T> + Send + Sync + 'static>, Handle)>
where
    T: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory `{}`", log_dir.display()))?;

    let log_file = fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(log_dir.join(LOG_FILE_NAME))
        .context("Failed to open log file")?;

    let (non_blocking, guard) = NonBlockingBuilder::default()
        .buffered_lines_limit(MAX_BUFFERED_LINES)
        .finish(log_file);

    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .boxed();

    let handle = Handle {
        _guard: Arc::new(guard),
    };

    Ok((layer, handle))
}

/// A handle to the file logger.
///
/// Houses the [`WorkerGuard`] of the underlying non-blocking appender; you
/// MUST NOT drop this handle for as long as you want messages to arrive at
/// the log file.
#[must_use]
#[derive(Clone, Debug)]
pub struct Handle {
    _guard: Arc<WorkerGuard>,
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

    use super::*;

    #[test]
    fn lines_arrive_in_agent_log() {
        let dir = tempfile::tempdir().unwrap();

        let (layer, handle) = layer(dir.path()).unwrap();

        {
            let _guard = tracing_subscriber::registry()
                .with(layer)
                .with(tracing_subscriber::EnvFilter::from("info"))
                .set_default();

            tracing::info!("log file smoke test");
        }

        drop(handle); // Flushes the background writer.

        let content = std::fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert!(content.contains("log file smoke test"));
    }
}
