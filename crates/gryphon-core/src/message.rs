use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

/// Binding keys reserved for element accessors. Scripts reach these through
/// the element API, so requests may not shadow them.
pub const RESERVED_BINDING_KEYS: [&str; 4] = ["id", "label", "key", "value"];

/// Operations a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestOp {
    /// Evaluate a script, sessionless or within a named session.
    Eval,
    /// Close a named session, discarding its bindings.
    Close,
}

/// Arguments attached to a request. All fields are optional on the wire;
/// validation decides which combinations are legal for a given op.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bindings: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Per-request override of the server's script evaluation timeout, in ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_timeout_ms: Option<u64>,
    /// On `Close`: abort any queued work instead of draining it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_close: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// One request-response exchange. `request_id` is never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub request_id: Uuid,
    pub op: RequestOp,
    pub args: RequestArgs,
}

impl RequestMessage {
    pub fn build(op: RequestOp) -> RequestBuilder {
        RequestBuilder {
            msg: RequestMessage {
                request_id: Uuid::new_v4(),
                op,
                args: RequestArgs::default(),
            },
        }
    }

    pub fn eval(script: impl Into<String>) -> RequestBuilder {
        Self::build(RequestOp::Eval).script(script)
    }
}

pub struct RequestBuilder {
    msg: RequestMessage,
}

impl RequestBuilder {
    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.msg.args.script = Some(script.into());
        self
    }

    pub fn binding(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.msg
            .args
            .bindings
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn bindings(mut self, bindings: HashMap<String, Value>) -> Self {
        self.msg.args.bindings = Some(bindings);
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.msg.args.session_id = Some(session_id.into());
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.msg.args.batch_size = Some(batch_size);
        self
    }

    pub fn eval_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.msg.args.eval_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn force_close(mut self, force: bool) -> Self {
        self.msg.args.force_close = Some(force);
        self
    }

    pub fn create(self) -> RequestMessage {
        self.msg
    }
}

/// Response status taxonomy. The numeric values are the wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum StatusCode {
    Success,
    NoContent,
    PartialContent,
    Unauthorized,
    MalformedRequest,
    InvalidBindings,
    InvalidRequestArguments,
    ServerError,
    ScriptEvaluationError,
    ServerTimeout,
    ServerSerializationError,
}

impl StatusCode {
    /// Non-terminal codes may be followed by more messages for the same
    /// request id; a terminal code ends the exchange.
    pub fn is_terminal(self) -> bool {
        self != StatusCode::PartialContent
    }

    pub fn is_error(self) -> bool {
        !matches!(
            self,
            StatusCode::Success | StatusCode::NoContent | StatusCode::PartialContent
        )
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        match code {
            StatusCode::Success => 200,
            StatusCode::NoContent => 204,
            StatusCode::PartialContent => 206,
            StatusCode::Unauthorized => 401,
            StatusCode::InvalidBindings => 497,
            StatusCode::MalformedRequest => 498,
            StatusCode::InvalidRequestArguments => 499,
            StatusCode::ServerError => 500,
            StatusCode::ScriptEvaluationError => 597,
            StatusCode::ServerTimeout => 598,
            StatusCode::ServerSerializationError => 599,
        }
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, String> {
        match code {
            200 => Ok(StatusCode::Success),
            204 => Ok(StatusCode::NoContent),
            206 => Ok(StatusCode::PartialContent),
            401 => Ok(StatusCode::Unauthorized),
            497 => Ok(StatusCode::InvalidBindings),
            498 => Ok(StatusCode::MalformedRequest),
            499 => Ok(StatusCode::InvalidRequestArguments),
            500 => Ok(StatusCode::ServerError),
            597 => Ok(StatusCode::ScriptEvaluationError),
            598 => Ok(StatusCode::ServerTimeout),
            599 => Ok(StatusCode::ServerSerializationError),
            other => Err(format!("unknown status code: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseResult {
    /// `None` is a valid payload: an empty result, not an error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
}

/// One message in a response stream. A single logical execution produces one
/// or more of these sharing a `request_id`; every message before the last
/// carries `PartialContent` and the last carries a terminal code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub request_id: Uuid,
    pub status: ResponseStatus,
    #[serde(default)]
    pub result: ResponseResult,
}

impl ResponseMessage {
    pub fn new(request_id: Uuid, code: StatusCode) -> Self {
        Self {
            request_id,
            status: ResponseStatus {
                code,
                message: String::new(),
            },
            result: ResponseResult::default(),
        }
    }

    pub fn error(request_id: Uuid, code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: ResponseStatus {
                code,
                message: message.into(),
            },
            result: ResponseResult::default(),
        }
    }

    pub fn partial(request_id: Uuid, data: Value) -> Self {
        Self {
            request_id,
            status: ResponseStatus {
                code: StatusCode::PartialContent,
                message: String::new(),
            },
            result: ResponseResult {
                data: Some(data),
                meta: BTreeMap::new(),
            },
        }
    }

    pub fn success(request_id: Uuid, data: Value) -> Self {
        Self {
            request_id,
            status: ResponseStatus {
                code: StatusCode::Success,
                message: String::new(),
            },
            result: ResponseResult {
                data: Some(data),
                meta: BTreeMap::new(),
            },
        }
    }

    pub fn no_content(request_id: Uuid) -> Self {
        Self::new(request_id, StatusCode::NoContent)
    }
}

/// A request rejected before evaluation, carrying the status to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestValidationError {
    pub code: StatusCode,
    pub message: String,
}

/// Validates an incoming request without touching the script engine. Returns
/// the rejection that should be sent back, if any.
pub fn validate_request(msg: &RequestMessage) -> Result<(), RequestValidationError> {
    match msg.op {
        RequestOp::Eval => {
            if msg.args.script.as_deref().is_none_or(str::is_empty) {
                return Err(RequestValidationError {
                    code: StatusCode::InvalidRequestArguments,
                    message: "no script was supplied for evaluation".to_string(),
                });
            }
            if msg.args.batch_size == Some(0) {
                return Err(RequestValidationError {
                    code: StatusCode::InvalidRequestArguments,
                    message: "batch_size must be greater than zero".to_string(),
                });
            }
            if let Some(bindings) = &msg.args.bindings {
                validate_binding_keys(bindings.keys().map(String::as_str))?;
            }
            Ok(())
        }
        RequestOp::Close => {
            if msg.args.session_id.as_deref().is_none_or(str::is_empty) {
                return Err(RequestValidationError {
                    code: StatusCode::InvalidRequestArguments,
                    message: "close requires a session_id".to_string(),
                });
            }
            Ok(())
        }
    }
}

fn validate_binding_keys<'a>(
    keys: impl Iterator<Item = &'a str>,
) -> Result<(), RequestValidationError> {
    for key in keys {
        if key.is_empty() {
            return Err(RequestValidationError {
                code: StatusCode::InvalidBindings,
                message: "binding keys must be non-empty strings".to_string(),
            });
        }
        if RESERVED_BINDING_KEYS.contains(&key) {
            return Err(RequestValidationError {
                code: StatusCode::InvalidBindings,
                message: format!("binding key '{key}' collides with a reserved accessor name"),
            });
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
            || key.chars().next().is_some_and(|c| c.is_ascii_digit())
        {
            return Err(RequestValidationError {
                code: StatusCode::InvalidBindings,
                message: format!("binding key '{key}' is not a legal identifier"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_without_script_is_rejected() {
        let msg = RequestMessage::build(RequestOp::Eval).create();
        let err = validate_request(&msg).unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidRequestArguments);
    }

    #[test]
    fn reserved_binding_key_is_rejected() {
        let msg = RequestMessage::eval("[1,2,3]").binding("id", 123i64).create();
        let err = validate_request(&msg).unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidBindings);
        assert!(err.message.contains("reserved"));
    }

    #[test]
    fn empty_binding_key_is_rejected() {
        let msg = RequestMessage::eval("x").binding("", 1i64).create();
        let err = validate_request(&msg).unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidBindings);
    }

    #[test]
    fn numeric_binding_key_is_rejected() {
        let msg = RequestMessage::eval("x").binding("1abc", 1i64).create();
        assert!(validate_request(&msg).is_err());
    }

    #[test]
    fn legal_request_passes() {
        let msg = RequestMessage::eval("x + 1")
            .binding("x", 41i64)
            .batch_size(2)
            .create();
        assert!(validate_request(&msg).is_ok());
    }

    #[test]
    fn status_codes_round_trip_through_wire_values() {
        for code in [
            StatusCode::Success,
            StatusCode::NoContent,
            StatusCode::PartialContent,
            StatusCode::InvalidBindings,
            StatusCode::ServerTimeout,
            StatusCode::ServerSerializationError,
        ] {
            let wire: u16 = code.into();
            assert_eq!(StatusCode::try_from(wire).unwrap(), code);
        }
    }

    #[test]
    fn partial_content_is_the_only_non_terminal_code() {
        assert!(!StatusCode::PartialContent.is_terminal());
        assert!(StatusCode::Success.is_terminal());
        assert!(StatusCode::ServerError.is_terminal());
    }
}
