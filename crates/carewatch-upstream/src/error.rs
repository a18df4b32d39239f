use thiserror::Error;

/// Errors raised while establishing or running an upstream watch.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The source is misconfigured (missing or unparseable database URL).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The store refused to register the watch.
    #[error("Watch rejected for {path}: {reason}")]
    Rejected { path: String, reason: String },

    /// Transport-level failure talking to the store.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A streamed event carried a body that is not valid JSON.
    #[error("Malformed event payload: {0}")]
    Payload(#[from] serde_json::Error),
}
