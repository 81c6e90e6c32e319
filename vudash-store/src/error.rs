pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input on a mutating call; rejected wholesale, never
    /// partially applied.
    #[error("{0}")]
    Validation(String),

    #[error("token `{0}` already exists")]
    Conflict(String),

    #[error("token `{0}` not found")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
