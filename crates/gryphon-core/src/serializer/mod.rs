//! Wire serialization for request and response messages.
//!
//! Two interchangeable formats are provided: [`GraphJsonSerializer`], a
//! verbose self-describing JSON form, and [`GraphBinSerializer`], a compact
//! binary form that fails closed on unregistered types. Which one a
//! connection uses is negotiated by a single format byte at connect time.

mod graphbin;
mod graphjson;

pub use graphbin::GraphBinSerializer;
pub use graphjson::GraphJsonSerializer;

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::message::{RequestMessage, ResponseMessage};
use crate::value::Value;

/// Values nested deeper than this are treated as self-referential. Both
/// formats enforce the same limit so a value accepted by one round-trips
/// through the other.
pub const MAX_SERIALIZATION_DEPTH: usize = 128;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error(
        "Error during serialization: Direct self-reference leading to cycle (through reference chain: {path})"
    )]
    Cycle { path: String },
    #[error("Error during serialization: Type is not registered: {type_name}")]
    UnregisteredType { type_name: String },
    #[error("Error during serialization: {0}")]
    Encode(String),
    #[error("Error during deserialization: {0}")]
    Decode(String),
}

/// Identifies a serializer on the wire. The byte value is sent by the client
/// immediately after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerFormat {
    GraphJson,
    GraphBin,
}

impl SerializerFormat {
    pub fn wire_id(self) -> u8 {
        match self {
            SerializerFormat::GraphJson => 0x01,
            SerializerFormat::GraphBin => 0x02,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(SerializerFormat::GraphJson),
            0x02 => Some(SerializerFormat::GraphBin),
            _ => None,
        }
    }
}

/// Bidirectional mapping between messages and their wire form. Implementations
/// must be cheap to share across connections.
pub trait MessageSerializer: Send + Sync {
    fn format(&self) -> SerializerFormat;

    fn serialize_request(&self, msg: &RequestMessage) -> Result<Bytes, SerializationError>;
    fn deserialize_request(&self, bytes: &[u8]) -> Result<RequestMessage, SerializationError>;

    fn serialize_response(&self, msg: &ResponseMessage) -> Result<Bytes, SerializationError>;
    fn deserialize_response(&self, bytes: &[u8]) -> Result<ResponseMessage, SerializationError>;
}

/// Builds the serializer for a negotiated format, sharing one type registry.
pub fn serializer_for(
    format: SerializerFormat,
    registry: Arc<TypeRegistry>,
) -> Arc<dyn MessageSerializer> {
    match format {
        SerializerFormat::GraphJson => Arc::new(GraphJsonSerializer::new()),
        SerializerFormat::GraphBin => Arc::new(GraphBinSerializer::new(registry)),
    }
}

/// Explicit registrations required by the compact format for non-primitive
/// types. Unregistered types fail closed rather than being coerced.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    names: HashSet<String>,
}

impl TypeRegistry {
    /// An empty registry: every non-primitive type is rejected.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the graph element types the server emits.
    pub fn with_graph_types() -> Self {
        let mut registry = Self::default();
        registry.register("vertex");
        registry.register("edge");
        registry
    }

    pub fn register(&mut self, type_name: impl Into<String>) {
        self.names.insert(type_name.into());
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.names.contains(type_name)
    }
}

/// Depth check shared by both formats; returns the cycle error naming the
/// offending reference chain.
pub(crate) fn check_depth(value: &Value) -> Result<(), SerializationError> {
    if let Some(path) = value.deepest_violation(MAX_SERIALIZATION_DEPTH) {
        return Err(SerializationError::Cycle { path });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RequestMessage, StatusCode};
    use uuid::Uuid;

    fn deep_list(depth: usize) -> Value {
        let mut v = Value::Int(0);
        for _ in 0..depth {
            v = Value::List(vec![v]);
        }
        v
    }

    #[test]
    fn both_formats_reject_cyclic_nesting_with_the_same_error() {
        let response = ResponseMessage::success(
            Uuid::new_v4(),
            deep_list(MAX_SERIALIZATION_DEPTH + 1),
        );
        let json = GraphJsonSerializer::new();
        let bin = GraphBinSerializer::new(Arc::new(TypeRegistry::with_graph_types()));

        let json_err = json.serialize_response(&response).unwrap_err().to_string();
        let bin_err = bin.serialize_response(&response).unwrap_err().to_string();
        assert!(json_err.starts_with(
            "Error during serialization: Direct self-reference leading to cycle"
        ));
        assert_eq!(json_err, bin_err);
    }

    #[test]
    fn formats_round_trip_a_request() {
        let request = RequestMessage::eval("x + 1").binding("x", 41i64).create();
        for serializer in [
            Box::new(GraphJsonSerializer::new()) as Box<dyn MessageSerializer>,
            Box::new(GraphBinSerializer::new(Arc::new(
                TypeRegistry::with_graph_types(),
            ))),
        ] {
            let bytes = serializer.serialize_request(&request).unwrap();
            let decoded = serializer.deserialize_request(&bytes).unwrap();
            assert_eq!(decoded.request_id, request.request_id);
            assert_eq!(decoded.args.script, request.args.script);
            assert_eq!(
                decoded.args.bindings.unwrap().get("x"),
                Some(&Value::Int(41))
            );
        }
    }

    #[test]
    fn terminal_status_survives_round_trip() {
        let response = ResponseMessage::error(
            Uuid::new_v4(),
            StatusCode::ServerTimeout,
            "took too long",
        );
        let serializer = GraphJsonSerializer::new();
        let bytes = serializer.serialize_response(&response).unwrap();
        let decoded = serializer.deserialize_response(&bytes).unwrap();
        assert_eq!(decoded.status.code, StatusCode::ServerTimeout);
        assert_eq!(decoded.status.message, "took too long");
        assert!(decoded.result.data.is_none());
    }
}
