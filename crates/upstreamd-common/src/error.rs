use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("state store error: {0}")]
    Store(String),

    #[error("metrics archive error: {0}")]
    Archive(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("config render error: {0}")]
    Render(String),

    #[error("proxy reload failed: {0}")]
    Reload(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ControlError>;
