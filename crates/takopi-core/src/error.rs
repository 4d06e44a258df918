use thiserror::Error;

#[derive(Debug, Error)]
pub enum TakopiError {
    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Directive(String),

    #[error("engine {engine} unavailable: {reason}")]
    RunnerUnavailable { engine: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("state store error: {0}")]
    Store(String),

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl TakopiError {
    /// True when the error should abort startup rather than a single command.
    pub fn is_config(&self) -> bool {
        matches!(self, TakopiError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, TakopiError>;
