use thiserror::Error;

/// Fatal error classes carried on the orchestrator's error bus.
///
/// Anything that reaches this type tears the agent down and triggers a full
/// revert of host changes; per-event errors are logged where they occur and
/// never surface here.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),

    #[error("host mutation failed: {0:#}")]
    HostMutation(anyhow::Error),

    #[error("failed to start DNS listener: {0:#}")]
    Bind(anyhow::Error),

    #[error("failed to resolve allowed endpoint: {0:#}")]
    Resolve(anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
