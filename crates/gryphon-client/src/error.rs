use thiserror::Error;

use gryphon_core::message::StatusCode;
use gryphon_core::serializer::SerializationError;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no available host in the cluster")]
    NoHostAvailable,
    #[error("connection closed before the request completed")]
    ConnectionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("server returned {code:?}: {message}")]
    Server { code: StatusCode, message: String },
}
