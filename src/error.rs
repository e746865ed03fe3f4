/// Error types for keygate operations
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Refresh rejected with status {status}: {body}")]
    RefreshRejected { status: u16, body: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Login rejected with status {status}: {body}")]
    LoginRejected { status: u16, body: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
