//! The JSON envelopes exchanged with streaming clients.
//!
//! Inbound: `{operation, topic, data?, entity_type?, entity_id?}`.
//! Outbound: `{status, operation, topic?, message?, error_code?, data?}` with absent
//! optional fields omitted.

use broker::Payload;
use domain::{EntityRef, Id};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Operations a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Subscribe,
    Unsubscribe,
    Publish,
}

impl Operation {
    fn parse(operation: &str) -> Option<Self> {
        match operation {
            "subscribe" => Some(Operation::Subscribe),
            "unsubscribe" => Some(Operation::Unsubscribe),
            "publish" => Some(Operation::Publish),
            _ => None,
        }
    }
}

/// A decoded and validated inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub operation: Operation,
    pub topic: String,
    pub data: Option<Payload>,
    pub entity: Option<EntityRef>,
}

#[derive(Deserialize)]
struct RawRequest {
    operation: String,
    topic: String,
    #[serde(default)]
    data: Option<Payload>,
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(default)]
    entity_id: Option<Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidJson,
    ValidationError,
    InvalidOperation,
    PermissionDenied,
    PublishFailed,
    SubscriptionError,
    /// A newer login for the same principal took over this connection.
    SessionReplaced,
    /// The connection was closed by the server, e.g. for falling behind.
    ConnectionClosed,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let code = match self {
            ErrorCode::InvalidJson => "INVALID_JSON",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::InvalidOperation => "INVALID_OPERATION",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::PublishFailed => "PUBLISH_FAILED",
            ErrorCode::SubscriptionError => "SUBSCRIPTION_ERROR",
            ErrorCode::SessionReplaced => "SESSION_REPLACED",
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{code}")
    }
}

/// A per-request failure reported to the client as an `error` envelope. The
/// connection stays usable.
#[derive(Debug, Clone, PartialEq, Eq)]
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

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ProtocolError {}

impl From<ProtocolError> for Response {
    fn from(err: ProtocolError) -> Self {
        Response::error(err.code, err.message)
    }
}

pub fn decode(text: &str) -> Result<Request, ProtocolError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|_| ProtocolError::new(ErrorCode::InvalidJson, "Invalid JSON format"))?;

    let raw: RawRequest = serde_json::from_value(value)
        .map_err(|e| ProtocolError::new(ErrorCode::ValidationError, e.to_string()))?;

    if raw.topic.trim().is_empty() {
        return Err(ProtocolError::new(
            ErrorCode::ValidationError,
            "topic must not be empty",
        ));
    }

    let entity = match (raw.entity_type, raw.entity_id) {
        (Some(entity_type), Some(entity_id)) if !entity_type.is_empty() => {
            Some(EntityRef::new(entity_type, entity_id))
        }
        (None, None) => None,
        _ => {
            return Err(ProtocolError::new(
                ErrorCode::ValidationError,
                "entity_type and entity_id must be supplied together",
            ))
        }
    };

    let operation = Operation::parse(&raw.operation).ok_or_else(|| {
        ProtocolError::new(
            ErrorCode::InvalidOperation,
            format!("Unknown operation: {}", raw.operation),
        )
    })?;

    Ok(Request {
        operation,
        topic: raw.topic,
        data: raw.data,
        entity,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// The `operation` field of an outbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseOperation {
    Connect,
    Subscribe,
    Unsubscribe,
    Publish,
    /// A message forwarded from the broker.
    Message,
    Error,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Response {
    pub status: Status,
    pub operation: ResponseOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

impl Response {
    /// Welcome envelope sent once the connection is open.
    pub fn connected(username: &str) -> Self {
        Self {
            status: Status::Success,
            operation: ResponseOperation::Connect,
            topic: None,
            message: Some(format!("Connected to streaming service as {username}")),
            error_code: None,
            data: None,
        }
    }

    pub fn success(operation: ResponseOperation, topic: &str, message: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            operation,
            topic: Some(topic.to_string()),
            message: Some(message.into()),
            error_code: None,
            data: None,
        }
    }

    pub fn message(topic: &str, data: Payload) -> Self {
        Self {
            status: Status::Success,
            operation: ResponseOperation::Message,
            topic: Some(topic.to_string()),
            message: None,
            error_code: None,
            data: Some(data),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            operation: ResponseOperation::Error,
            topic: None,
            message: Some(message.into()),
            error_code: Some(code),
            data: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
