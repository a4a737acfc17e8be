//! Error types for raftroute

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // === Command Errors ===
    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Raft Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Configuration conflict: {id} at {address} collides with {existing}")]
    ConfigurationConflict {
        id: String,
        address: String,
        existing: String,
    },

    #[error("Raft error: {0}")]
    Engine(String),

    #[error("Consensus timeout")]
    ConsensusTimeout,

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// A timed-out proposal may still commit, so retrying it is the caller's call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConsensusTimeout | Error::NotLeader(_) | Error::Http(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotLeader(_) => StatusCode::METHOD_NOT_ALLOWED,
            Error::InvalidRequest(_) | Error::MalformedCommand(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
