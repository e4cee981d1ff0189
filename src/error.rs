use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("invalid stream url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("url cannot carry a scan path: {0}")]
    UnsupportedUrl(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connect timed out after {0} ms")]
    ConnectTimeout(u64),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
