// TCP server for Gryphon script execution

pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod server;
pub mod writer;

pub use error::{Result, ServerError};
pub use server::{GryphonServer, ServerBuilder, ServerHandle};
