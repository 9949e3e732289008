// Core gryphon functionality shared by the server and client crates

pub mod error;
pub mod graph;
pub mod message;
pub mod script;
pub mod serializer;
pub mod session;
pub mod settings;
pub mod value;

pub use error::{Error, Result};
pub use settings::Settings;
pub use value::Value;
