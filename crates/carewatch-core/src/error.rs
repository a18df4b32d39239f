use thiserror::Error;

#[derive(Debug, Error)]
pub enum CarewatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid message format: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CarewatchError {
    /// Short error code string used in structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            CarewatchError::Config(_) => "CONFIG_ERROR",
            CarewatchError::Protocol(_) => "PROTOCOL_ERROR",
            CarewatchError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CarewatchError>;
