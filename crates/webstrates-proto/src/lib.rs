//! # Webstrates Protocol
//!
//! Wire messages exchanged with a Webstrates server.
//!
//! ## Messages
//!
//! - `init` / `hs`: connection handshake assigning the client id
//! - `s` / `u`: subscribe to and unsubscribe from a document
//! - `op`: document creation, operation submission, acknowledgement and
//!   remote operations
//!
//! ## Control messages
//!
//! Keep-alive pings and `wa` messages share the socket with the sync stream
//! but are never interpreted as document edits.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod messages;

pub use control::{is_control, keep_alive};
pub use messages::{
    ClientMessage, CreateData, DocumentRef, HandshakeReply, MessageError, OpMessage, ServerError,
    ServerMessage, Snapshot, SubscribeReply, COLLECTION, JSON0_URI,
};
