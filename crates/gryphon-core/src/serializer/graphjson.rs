use bytes::Bytes;

use super::{MessageSerializer, SerializationError, SerializerFormat, check_depth};
use crate::message::{RequestMessage, ResponseMessage};

/// The verbose self-describing format: plain JSON with `@type`/`@value` tags
/// on every domain value, so any reader can decode a message without a
/// schema. Favoured for debugging and heterogeneous clients.
#[derive(Debug, Default, Clone)]
pub struct GraphJsonSerializer;

impl GraphJsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl MessageSerializer for GraphJsonSerializer {
    fn format(&self) -> SerializerFormat {
        SerializerFormat::GraphJson
    }

    fn serialize_request(&self, msg: &RequestMessage) -> Result<Bytes, SerializationError> {
        if let Some(bindings) = &msg.args.bindings {
            for value in bindings.values() {
                check_depth(value)?;
            }
        }
        serde_json::to_vec(msg)
            .map(Bytes::from)
            .map_err(|e| SerializationError::Encode(e.to_string()))
    }

    fn deserialize_request(&self, bytes: &[u8]) -> Result<RequestMessage, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode(e.to_string()))
    }

    fn serialize_response(&self, msg: &ResponseMessage) -> Result<Bytes, SerializationError> {
        if let Some(data) = &msg.result.data {
            check_depth(data)?;
        }
        serde_json::to_vec(msg)
            .map(Bytes::from)
            .map_err(|e| SerializationError::Encode(e.to_string()))
    }

    fn deserialize_response(&self, bytes: &[u8]) -> Result<ResponseMessage, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;
    use crate::value::Value;
    use uuid::Uuid;

    #[test]
    fn wire_form_is_self_describing() {
        let response = ResponseMessage::partial(Uuid::new_v4(), Value::List(vec![Value::Int(7)]));
        let bytes = GraphJsonSerializer::new()
            .serialize_response(&response)
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("\"@type\":\"list\""));
        assert!(text.contains("\"@type\":\"int\""));
    }

    #[test]
    fn garbage_input_yields_a_decode_error() {
        let err = GraphJsonSerializer::new()
            .deserialize_request(b"{not json")
            .unwrap_err();
        assert!(matches!(err, SerializationError::Decode(_)));
    }

    #[test]
    fn null_data_round_trips_as_empty_result() {
        let response = ResponseMessage::no_content(Uuid::new_v4());
        let serializer = GraphJsonSerializer::new();
        let decoded = serializer
            .deserialize_response(&serializer.serialize_response(&response).unwrap())
            .unwrap();
        assert_eq!(decoded.status.code, StatusCode::NoContent);
        assert!(decoded.result.data.is_none());
    }
}
