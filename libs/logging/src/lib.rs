//! Subscriber assembly for the agent: a stdout layer plus an optional
//! non-blocking file layer writing `agent.log` in the state directory.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod file;

use anyhow::{Context as _, Result};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

/// Registers a global subscriber with stdout logging and `additional_layer`.
pub fn setup_global_subscriber<L>(directives: &str, additional_layer: L) -> Result<()>
where
    L: Layer<Registry> + Send + Sync,
{
    let subscriber = Registry::default()
        .with(additional_layer.with_filter(try_filter(directives)?))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_filter(try_filter(directives)?),
        );

    subscriber
        .try_init()
        .context("Could not set global default subscriber")?;
    LogTracer::init().context("Failed to init LogTracer")?;

    Ok(())
}

/// Constructs an [`EnvFilter`], silencing crates that log a lot on our behalf.
fn try_filter(directives: &str) -> Result<EnvFilter> {
    const IRRELEVANT_CRATES: &str = "hyper=warn,rustls=warn,reqwest=info";

    EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
        .with_context(|| format!("Failed to parse directives: {directives}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_parse() {
        assert!(try_filter("info").is_ok());
        assert!(try_filter("debug,gatehouse_agent=trace").is_ok());
    }
}
