//! ShareDB wire messages.
//!
//! Messages are JSON objects discriminated by the `a` (action) field. Only
//! the subset a single-document client needs is modelled.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use webstrates_core::Op;

/// Collection every webstrate lives in.
pub const COLLECTION: &str = "webstrates";

/// Type URI of the `json0` OT type.
pub const JSON0_URI: &str = "http://sharejs.org/types/JSONv0";

/// Collection and document id pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Collection name
    pub c: String,
    /// Document id
    pub d: String,
}

impl DocumentRef {
    /// Reference a document in the `webstrates` collection.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            c: COLLECTION.to_string(),
            d: id.into(),
        }
    }
}

/// Handshake sent by the server when the socket opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    /// Protocol major version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u64>,
    /// Client id assigned by the server, used as `src` of our operations
    #[serde(default)]
    pub id: Option<String>,
    /// Default OT type URI
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub default_type: Option<String>,
}

/// Error attached to a server reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Numeric or string error code
    #[serde(default)]
    pub code: Value,
    /// Human readable message
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_null() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} (code {})", self.message, self.code)
        }
    }
}

/// Document snapshot carried by a subscribe reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Document version
    #[serde(default)]
    pub v: u64,
    /// OT type URI, `null` when the document does not exist
    #[serde(rename = "type", default)]
    pub type_uri: Option<String>,
    /// Document contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Reply to a subscribe or unsubscribe request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeReply {
    /// Collection name
    pub c: String,
    /// Document id
    pub d: String,
    /// Snapshot (subscribe only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Snapshot>,
    /// Error if the request failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServerError>,
}

/// Payload of a create request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateData {
    /// OT type URI
    #[serde(rename = "type")]
    pub type_uri: String,
    /// Initial contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An `op` message: create, submit, acknowledgement or remote operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpMessage {
    /// Collection name
    pub c: String,
    /// Document id
    pub d: String,
    /// Version the operation applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u64>,
    /// Id of the submitting client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    /// Per-client sequence number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Edit components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<Op>,
    /// Document creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<CreateData>,
    /// Document deletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub del: Option<bool>,
    /// Error if the submission was rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServerError>,
}

impl OpMessage {
    fn empty(document: &DocumentRef, version: u64, seq: u64) -> Self {
        Self {
            c: document.c.clone(),
            d: document.d.clone(),
            v: Some(version),
            src: None,
            seq: Some(seq),
            op: None,
            create: None,
            del: None,
            error: None,
        }
    }

    /// Submit `op` against `version`.
    #[must_use]
    pub fn submit(document: &DocumentRef, version: u64, seq: u64, op: Op) -> Self {
        Self {
            op: Some(op),
            ..Self::empty(document, version, seq)
        }
    }

    /// Create the document with the `json0` type and no contents.
    #[must_use]
    pub fn create(document: &DocumentRef, version: u64, seq: u64) -> Self {
        Self {
            create: Some(CreateData {
                type_uri: JSON0_URI.to_string(),
                data: None,
            }),
            ..Self::empty(document, version, seq)
        }
    }

    /// Whether this message acknowledges (or rejects) the submission
    /// identified by `src` and `seq`.
    #[must_use]
    pub fn answers(&self, src: Option<&str>, seq: u64) -> bool {
        self.seq == Some(seq) && (self.src.is_none() || self.src.as_deref() == src)
    }
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum ClientMessage {
    /// Subscribe to a document
    #[serde(rename = "s")]
    Subscribe(DocumentRef),
    /// Unsubscribe from a document
    #[serde(rename = "u")]
    Unsubscribe(DocumentRef),
    /// Create or edit a document
    #[serde(rename = "op")]
    Op(OpMessage),
}

impl ClientMessage {
    /// Encode as JSON text.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum ServerMessage {
    /// Legacy handshake
    #[serde(rename = "init")]
    Init(HandshakeReply),
    /// Handshake reply
    #[serde(rename = "hs")]
    Handshake(HandshakeReply),
    /// Subscribe reply
    #[serde(rename = "s")]
    Subscribe(SubscribeReply),
    /// Unsubscribe reply
    #[serde(rename = "u")]
    Unsubscribe(SubscribeReply),
    /// Operation, acknowledgement or rejection
    #[serde(rename = "op")]
    Op(OpMessage),
}

impl ServerMessage {
    /// Decode from an already parsed JSON value.
    ///
    /// # Errors
    ///
    /// Returns error if the value is not a known server message.
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let action = value
            .get("a")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(MessageError::MissingAction)?;
        serde_json::from_value(value).map_err(|e| MessageError::Deserialize {
            action,
            reason: e.to_string(),
        })
    }

    /// Decode from JSON text.
    ///
    /// # Errors
    ///
    /// Returns error if the text is not JSON or not a known server message.
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| MessageError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Text is not JSON
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// Message has no `a` field
    #[error("message has no action")]
    MissingAction,
    /// Unknown action or malformed fields
    #[error("cannot decode '{action}' message: {reason}")]
    Deserialize {
        /// Action field of the message
        action: String,
        /// Decoder error
        reason: String,
    },
}
