//! Wire format: one JSON object per line.
//!
//! Requests are `{id, command, params}`. Responses echo the id with either
//! `result` or `error: {code, message}`. Events carry no id:
//! `{event, handle, data}`.

use cuehost_session::{HostEvent, InstanceError};
use serde::Serialize;
use serde_json::{Map, Value, json};

/// Controller-chosen correlation token (string or integer), echoed verbatim.
pub type RequestId = Value;

/// Protocol error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    ParseError,
    UnknownCommand,
    UnknownHandle,
    InvalidParameter,
    FormatMismatch,
    PluginLoadFailed,
    PluginFault,
    Unsupported,
    InvalidRequest,
    InvalidState,
}

/// The `error` member of a failed response
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<InstanceError> for ProtocolError {
    fn from(error: InstanceError) -> Self {
        let code = match &error {
            InstanceError::UnknownHandle(_) => ErrorCode::UnknownHandle,
            InstanceError::LoadFailed(_) => ErrorCode::PluginLoadFailed,
            InstanceError::InvalidState { .. } | InstanceError::NotStreaming(_) => {
                ErrorCode::InvalidState
            }
            InstanceError::InvalidParameter(_) => ErrorCode::InvalidParameter,
            InstanceError::FormatMismatch(_) => ErrorCode::FormatMismatch,
            InstanceError::Fault(_) | InstanceError::Plugin(_) => ErrorCode::PluginFault,
            InstanceError::Unsupported(_) => ErrorCode::Unsupported,
            InstanceError::InvalidRequest(_) => ErrorCode::InvalidRequest,
        };
        Self::new(code, error.to_string())
    }
}

/// A request whose envelope parsed. The command name and params are
/// validated later, against the command table.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub command: String,
    pub params: Value,
}

/// Envelope failure, with the id if one could be read
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedLine {
    pub id: RequestId,
    pub error: ProtocolError,
}

/// Parse one request line.
pub fn parse_request(line: &str) -> Result<Request, RejectedLine> {
    let reject = |id: RequestId, code, message: String| RejectedLine {
        id,
        error: ProtocolError::new(code, message),
    };

    let value: Value = serde_json::from_str(line)
        .map_err(|e| reject(Value::Null, ErrorCode::ParseError, format!("Malformed JSON: {e}")))?;
    let Value::Object(mut object) = value else {
        return Err(reject(
            Value::Null,
            ErrorCode::ParseError,
            "Request must be a JSON object".to_string(),
        ));
    };

    let id = match object.remove("id") {
        Some(id @ (Value::String(_) | Value::Number(_))) => id,
        Some(_) => {
            return Err(reject(
                Value::Null,
                ErrorCode::ParseError,
                "Request id must be a string or a number".to_string(),
            ));
        }
        None => {
            return Err(reject(
                Value::Null,
                ErrorCode::ParseError,
                "Request has no id".to_string(),
            ));
        }
    };

    let command = match object.remove("command") {
        Some(Value::String(command)) => command,
        _ => {
            return Err(reject(
                id,
                ErrorCode::ParseError,
                "Request has no command name".to_string(),
            ));
        }
    };

    let params = match object.remove("params") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(params @ Value::Object(_)) => params,
        Some(_) => {
            return Err(reject(
                id,
                ErrorCode::InvalidRequest,
                format!("params of {command} must be an object"),
            ));
        }
    };

    Ok(Request {
        id,
        command,
        params,
    })
}

/// Success or failure of one request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Result(Value),
    Error(ProtocolError),
}

impl From<Result<Value, ProtocolError>> for Outcome {
    fn from(result: Result<Value, ProtocolError>) -> Self {
        match result {
            Ok(value) => Self::Result(value),
            Err(error) => Self::Error(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: RequestId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event: &'static str,
    pub handle: u64,
    pub data: Value,
}

impl From<HostEvent> for Event {
    fn from(event: HostEvent) -> Self {
        match event {
            HostEvent::Crash { handle, message } => Self {
                event: "crash",
                handle,
                data: json!({ "message": message }),
            },
            HostEvent::EditorClosed { handle } => Self {
                event: "editorClosed",
                handle,
                data: json!({}),
            },
            HostEvent::ParameterChanged {
                handle,
                param_id,
                value,
            } => Self {
                event: "parameterChanged",
                handle,
                data: json!({ "paramId": param_id, "value": value }),
            },
        }
    }
}

/// One line on stdout
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    Response(Response),
    Event(Event),
}

impl Outgoing {
    pub fn response(id: RequestId, outcome: impl Into<Outcome>) -> Self {
        Self::Response(Response {
            id,
            outcome: outcome.into(),
        })
    }

    pub fn error(id: RequestId, error: ProtocolError) -> Self {
        Self::response(id, Outcome::Error(error))
    }
}

impl From<HostEvent> for Outgoing {
    fn from(event: HostEvent) -> Self {
        Self::Event(event.into())
    }
}
