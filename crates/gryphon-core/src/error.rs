use thiserror::Error;

use crate::script::ScriptError;
use crate::serializer::SerializationError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Session {session_id} is shutting down")]
    SessionClosed { session_id: String },
    #[error("Too many pending requests for session {session_id} (limit {limit})")]
    SessionQueueFull { session_id: String, limit: usize },
    #[error("Graph error: {0}")]
    Graph(String),
}
