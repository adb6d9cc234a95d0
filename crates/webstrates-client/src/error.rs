//! Session errors.

use crate::sharedb::SyncError;
use webstrates_core::{CodecError, EventError, TreeError};

/// Errors surfaced by document and connection sessions.
///
/// Returned from calls and carried by `error` events.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// HTML could not be parsed
    #[error("malformed markup: {0}")]
    MalformedMarkup(CodecError),
    /// Tree could not be rendered to HTML
    #[error("serialization failed: {0}")]
    SerializationFailure(CodecError),
    /// Snapshot is not a valid document tree
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(TreeError),
    /// Operation was rejected by the sync service
    #[error(transparent)]
    DiffRejected(SyncError),
    /// Transport failure
    #[error("transport fault: {0}")]
    TransportFault(String),
    /// Subscribing to the document failed
    #[error("subscribe failed: {0}")]
    Subscribe(SyncError),
    /// Malformed message or server error reply
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Document session has not been connected
    #[error("document is not connected")]
    NotConnected,
    /// Event registration misuse
    #[error(transparent)]
    Event(#[from] EventError),
}

impl From<CodecError> for SessionError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::MalformedMarkup { .. } => Self::MalformedMarkup(error),
            CodecError::SerializationFailure(_) => Self::SerializationFailure(error),
        }
    }
}
