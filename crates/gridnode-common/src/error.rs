use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GridError {
    /// HTTP status code this error surfaces as on the agent's REST API.
    pub fn http_status(&self) -> u16 {
        match self {
            GridError::BadRequest(_) => 400,
            GridError::NotFound(_) => 404,
            GridError::Conflict(_) => 409,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GridError>;
