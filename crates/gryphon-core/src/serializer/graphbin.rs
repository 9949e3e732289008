use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::{MessageSerializer, SerializationError, SerializerFormat, TypeRegistry, check_depth};
use crate::message::{
    RequestArgs, RequestMessage, RequestOp, ResponseMessage, ResponseResult, ResponseStatus,
    StatusCode,
};
use crate::value::{EdgeRef, ElementId, Value, VertexRef};

const TYPE_NULL: u8 = 0x00;
const TYPE_BOOL: u8 = 0x01;
const TYPE_INT: u8 = 0x02;
const TYPE_DOUBLE: u8 = 0x03;
const TYPE_STR: u8 = 0x04;
const TYPE_UUID: u8 = 0x05;
const TYPE_LIST: u8 = 0x06;
const TYPE_MAP: u8 = 0x07;
const TYPE_VERTEX: u8 = 0x10;
const TYPE_EDGE: u8 = 0x11;
const TYPE_CUSTOM: u8 = 0x20;

const OP_EVAL: u8 = 0x01;
const OP_CLOSE: u8 = 0x02;

const FLAG_SCRIPT: u8 = 0x01;
const FLAG_BINDINGS: u8 = 0x02;
const FLAG_SESSION: u8 = 0x04;
const FLAG_BATCH: u8 = 0x08;
const FLAG_TIMEOUT: u8 = 0x10;
const FLAG_FORCE_CLOSE: u8 = 0x20;
const FLAG_LANGUAGE: u8 = 0x40;

/// The compact binary format. Non-primitive types must be registered before
/// they can be written; an unregistered type is an error, never a silent
/// coercion to something JSON-shaped.
#[derive(Debug, Clone)]
pub struct GraphBinSerializer {
    registry: Arc<TypeRegistry>,
}

impl GraphBinSerializer {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    fn put_value(&self, buf: &mut BytesMut, value: &Value) -> Result<(), SerializationError> {
        match value {
            Value::Null => buf.put_u8(TYPE_NULL),
            Value::Bool(b) => {
                buf.put_u8(TYPE_BOOL);
                buf.put_u8(u8::from(*b));
            }
            Value::Int(i) => {
                buf.put_u8(TYPE_INT);
                buf.put_i64(*i);
            }
            Value::Double(d) => {
                buf.put_u8(TYPE_DOUBLE);
                buf.put_f64(*d);
            }
            Value::Str(s) => {
                buf.put_u8(TYPE_STR);
                put_str(buf, s);
            }
            Value::Uuid(u) => {
                buf.put_u8(TYPE_UUID);
                buf.put_slice(u.as_bytes());
            }
            Value::List(items) => {
                buf.put_u8(TYPE_LIST);
                buf.put_u32(items.len() as u32);
                for item in items {
                    self.put_value(buf, item)?;
                }
            }
            Value::Map(entries) => {
                buf.put_u8(TYPE_MAP);
                buf.put_u32(entries.len() as u32);
                for (key, item) in entries {
                    put_str(buf, key);
                    self.put_value(buf, item)?;
                }
            }
            Value::Vertex(v) => {
                self.require_registered("vertex")?;
                buf.put_u8(TYPE_VERTEX);
                buf.put_u64(v.id);
                put_str(buf, &v.label);
                self.put_property_map(buf, &v.properties)?;
            }
            Value::Edge(e) => {
                self.require_registered("edge")?;
                buf.put_u8(TYPE_EDGE);
                buf.put_u64(e.id);
                put_str(buf, &e.label);
                buf.put_u64(e.out_v);
                buf.put_u64(e.in_v);
                self.put_property_map(buf, &e.properties)?;
            }
            Value::Custom { type_name, fields } => {
                self.require_registered(type_name)?;
                buf.put_u8(TYPE_CUSTOM);
                put_str(buf, type_name);
                self.put_property_map(buf, fields)?;
            }
        }
        Ok(())
    }

    fn put_property_map(
        &self,
        buf: &mut BytesMut,
        entries: &BTreeMap<String, Value>,
    ) -> Result<(), SerializationError> {
        buf.put_u32(entries.len() as u32);
        for (key, item) in entries {
            put_str(buf, key);
            self.put_value(buf, item)?;
        }
        Ok(())
    }

    fn require_registered(&self, type_name: &str) -> Result<(), SerializationError> {
        if self.registry.is_registered(type_name) {
            Ok(())
        } else {
            Err(SerializationError::UnregisteredType {
                type_name: type_name.to_string(),
            })
        }
    }

    fn get_value(&self, buf: &mut Bytes) -> Result<Value, SerializationError> {
        let tag = get_u8(buf)?;
        Ok(match tag {
            TYPE_NULL => Value::Null,
            TYPE_BOOL => Value::Bool(get_u8(buf)? != 0),
            TYPE_INT => Value::Int(get_i64(buf)?),
            TYPE_DOUBLE => {
                ensure(buf.remaining() >= 8)?;
                Value::Double(buf.get_f64())
            }
            TYPE_STR => Value::Str(get_str(buf)?),
            TYPE_UUID => {
                ensure(buf.remaining() >= 16)?;
                let mut raw = [0u8; 16];
                buf.copy_to_slice(&mut raw);
                Value::Uuid(Uuid::from_bytes(raw))
            }
            TYPE_LIST => {
                let count = get_u32(buf)? as usize;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.get_value(buf)?);
                }
                Value::List(items)
            }
            TYPE_MAP => Value::Map(self.get_property_map(buf)?),
            TYPE_VERTEX => {
                let id: ElementId = get_u64(buf)?;
                let label = get_str(buf)?;
                let properties = self.get_property_map(buf)?;
                Value::Vertex(VertexRef {
                    id,
                    label,
                    properties,
                })
            }
            TYPE_EDGE => {
                let id: ElementId = get_u64(buf)?;
                let label = get_str(buf)?;
                let out_v = get_u64(buf)?;
                let in_v = get_u64(buf)?;
                let properties = self.get_property_map(buf)?;
                Value::Edge(EdgeRef {
                    id,
                    label,
                    out_v,
                    in_v,
                    properties,
                })
            }
            TYPE_CUSTOM => {
                let type_name = get_str(buf)?;
                let fields = self.get_property_map(buf)?;
                Value::Custom { type_name, fields }
            }
            other => {
                return Err(SerializationError::Decode(format!(
                    "unknown value tag: {other:#x}"
                )));
            }
        })
    }

    fn get_property_map(
        &self,
        buf: &mut Bytes,
    ) -> Result<BTreeMap<String, Value>, SerializationError> {
        let count = get_u32(buf)? as usize;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let key = get_str(buf)?;
            let item = self.get_value(buf)?;
            entries.insert(key, item);
        }
        Ok(entries)
    }
}

impl MessageSerializer for GraphBinSerializer {
    fn format(&self) -> SerializerFormat {
        SerializerFormat::GraphBin
    }

    fn serialize_request(&self, msg: &RequestMessage) -> Result<Bytes, SerializationError> {
        let mut buf = BytesMut::new();
        buf.put_slice(msg.request_id.as_bytes());
        buf.put_u8(match msg.op {
            RequestOp::Eval => OP_EVAL,
            RequestOp::Close => OP_CLOSE,
        });

        let args = &msg.args;
        let mut flags = 0u8;
        if args.script.is_some() {
            flags |= FLAG_SCRIPT;
        }
        if args.bindings.is_some() {
            flags |= FLAG_BINDINGS;
        }
        if args.session_id.is_some() {
            flags |= FLAG_SESSION;
        }
        if args.batch_size.is_some() {
            flags |= FLAG_BATCH;
        }
        if args.eval_timeout_ms.is_some() {
            flags |= FLAG_TIMEOUT;
        }
        if args.force_close.is_some() {
            flags |= FLAG_FORCE_CLOSE;
        }
        if args.language.is_some() {
            flags |= FLAG_LANGUAGE;
        }
        buf.put_u8(flags);

        if let Some(script) = &args.script {
            put_str(&mut buf, script);
        }
        if let Some(bindings) = &args.bindings {
            for value in bindings.values() {
                check_depth(value)?;
            }
            buf.put_u32(bindings.len() as u32);
            for (key, value) in bindings {
                put_str(&mut buf, key);
                self.put_value(&mut buf, value)?;
            }
        }
        if let Some(session_id) = &args.session_id {
            put_str(&mut buf, session_id);
        }
        if let Some(batch_size) = args.batch_size {
            buf.put_u32(batch_size as u32);
        }
        if let Some(timeout) = args.eval_timeout_ms {
            buf.put_u64(timeout);
        }
        if let Some(force) = args.force_close {
            buf.put_u8(u8::from(force));
        }
        if let Some(language) = &args.language {
            put_str(&mut buf, language);
        }
        Ok(buf.freeze())
    }

    fn deserialize_request(&self, bytes: &[u8]) -> Result<RequestMessage, SerializationError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let request_id = get_uuid(&mut buf)?;
        let op = match get_u8(&mut buf)? {
            OP_EVAL => RequestOp::Eval,
            OP_CLOSE => RequestOp::Close,
            other => {
                return Err(SerializationError::Decode(format!(
                    "unknown op tag: {other:#x}"
                )));
            }
        };
        let flags = get_u8(&mut buf)?;

        let mut args = RequestArgs::default();
        if flags & FLAG_SCRIPT != 0 {
            args.script = Some(get_str(&mut buf)?);
        }
        if flags & FLAG_BINDINGS != 0 {
            let count = get_u32(&mut buf)? as usize;
            let mut bindings = HashMap::new();
            for _ in 0..count {
                let key = get_str(&mut buf)?;
                let value = self.get_value(&mut buf)?;
                bindings.insert(key, value);
            }
            args.bindings = Some(bindings);
        }
        if flags & FLAG_SESSION != 0 {
            args.session_id = Some(get_str(&mut buf)?);
        }
        if flags & FLAG_BATCH != 0 {
            args.batch_size = Some(get_u32(&mut buf)? as usize);
        }
        if flags & FLAG_TIMEOUT != 0 {
            args.eval_timeout_ms = Some(get_u64(&mut buf)?);
        }
        if flags & FLAG_FORCE_CLOSE != 0 {
            args.force_close = Some(get_u8(&mut buf)? != 0);
        }
        if flags & FLAG_LANGUAGE != 0 {
            args.language = Some(get_str(&mut buf)?);
        }
        Ok(RequestMessage {
            request_id,
            op,
            args,
        })
    }

    fn serialize_response(&self, msg: &ResponseMessage) -> Result<Bytes, SerializationError> {
        let mut buf = BytesMut::new();
        buf.put_slice(msg.request_id.as_bytes());
        buf.put_u16(msg.status.code.into());
        put_str(&mut buf, &msg.status.message);
        match &msg.result.data {
            Some(data) => {
                check_depth(data)?;
                buf.put_u8(1);
                self.put_value(&mut buf, data)?;
            }
            None => buf.put_u8(0),
        }
        self.put_property_map(&mut buf, &msg.result.meta)?;
        Ok(buf.freeze())
    }

    fn deserialize_response(&self, bytes: &[u8]) -> Result<ResponseMessage, SerializationError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let request_id = get_uuid(&mut buf)?;
        ensure(buf.remaining() >= 2)?;
        let code = StatusCode::try_from(buf.get_u16()).map_err(SerializationError::Decode)?;
        let message = get_str(&mut buf)?;
        let data = if get_u8(&mut buf)? != 0 {
            Some(self.get_value(&mut buf)?)
        } else {
            None
        };
        let meta = self.get_property_map(&mut buf)?;
        Ok(ResponseMessage {
            request_id,
            status: ResponseStatus { code, message },
            result: ResponseResult { data, meta },
        })
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn ensure(ok: bool) -> Result<(), SerializationError> {
    if ok {
        Ok(())
    } else {
        Err(SerializationError::Decode("unexpected end of input".into()))
    }
}

fn get_u8(buf: &mut Bytes) -> Result<u8, SerializationError> {
    ensure(buf.remaining() >= 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, SerializationError> {
    ensure(buf.remaining() >= 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, SerializationError> {
    ensure(buf.remaining() >= 8)?;
    Ok(buf.get_u64())
}

fn get_i64(buf: &mut Bytes) -> Result<i64, SerializationError> {
    ensure(buf.remaining() >= 8)?;
    Ok(buf.get_i64())
}

fn get_uuid(buf: &mut Bytes) -> Result<Uuid, SerializationError> {
    ensure(buf.remaining() >= 16)?;
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

fn get_str(buf: &mut Bytes) -> Result<String, SerializationError> {
    let len = get_u32(buf)? as usize;
    ensure(buf.remaining() >= len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| SerializationError::Decode(format!("invalid utf-8 string: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RequestMessage;
    use uuid::Uuid;

    fn graph_serializer() -> GraphBinSerializer {
        GraphBinSerializer::new(Arc::new(TypeRegistry::with_graph_types()))
    }

    #[test]
    fn unregistered_custom_type_fails_closed() {
        let serializer = GraphBinSerializer::new(Arc::new(TypeRegistry::new()));
        let response = ResponseMessage::success(
            Uuid::new_v4(),
            Value::Custom {
                type_name: "geo.Point".to_string(),
                fields: BTreeMap::new(),
            },
        );
        let err = serializer.serialize_response(&response).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error during serialization: Type is not registered: geo.Point"
        );
    }

    #[test]
    fn vertex_requires_registration_too() {
        let bare = GraphBinSerializer::new(Arc::new(TypeRegistry::new()));
        let response = ResponseMessage::success(
            Uuid::new_v4(),
            Value::Vertex(VertexRef {
                id: 1,
                label: "person".to_string(),
                properties: BTreeMap::new(),
            }),
        );
        assert!(bare.serialize_response(&response).is_err());
        assert!(graph_serializer().serialize_response(&response).is_ok());
    }

    #[test]
    fn registered_custom_type_round_trips() {
        let mut registry = TypeRegistry::with_graph_types();
        registry.register("geo.Point");
        let serializer = GraphBinSerializer::new(Arc::new(registry));
        let mut fields = BTreeMap::new();
        fields.insert("lat".to_string(), Value::Double(48.2));
        fields.insert("lon".to_string(), Value::Double(16.4));
        let response = ResponseMessage::success(
            Uuid::new_v4(),
            Value::Custom {
                type_name: "geo.Point".to_string(),
                fields,
            },
        );
        let bytes = serializer.serialize_response(&response).unwrap();
        let decoded = serializer.deserialize_response(&bytes).unwrap();
        assert_eq!(decoded.result.data, response.result.data);
    }

    #[test]
    fn truncated_input_is_a_decode_error_not_a_panic() {
        let serializer = graph_serializer();
        let request = RequestMessage::eval("1 + 1").create();
        let bytes = serializer.serialize_request(&request).unwrap();
        for cut in [0, 5, 16, bytes.len() - 1] {
            assert!(serializer.deserialize_request(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn edge_round_trips_with_endpoints() {
        let serializer = graph_serializer();
        let edge = Value::Edge(EdgeRef {
            id: 9,
            label: "knows".to_string(),
            out_v: 1,
            in_v: 2,
            properties: BTreeMap::from([("since".to_string(), Value::Int(2009))]),
        });
        let response = ResponseMessage::success(Uuid::new_v4(), edge.clone());
        let bytes = serializer.serialize_response(&response).unwrap();
        let decoded = serializer.deserialize_response(&bytes).unwrap();
        assert_eq!(decoded.result.data, Some(edge));
    }
}
