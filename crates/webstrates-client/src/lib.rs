//! # Webstrates Client
//!
//! Sessions that keep local HTML in sync with a Webstrates document.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │              ConnectionSession                 │
//! │  ┌───────────┐  ┌────────────┐  ┌───────────┐  │
//! │  │ Lifecycle │─▶│  ShareDB   │─▶│ Document  │  │
//! │  │ + control │  │ connection │  │ sessions  │  │
//! │  └───────────┘  └────────────┘  └───────────┘  │
//! └────────────────────────────────────────────────┘
//!                        │
//!                        ▼
//!                  WebSocket transport
//! ```
//!
//! Everything runs on one thread. Drive a [`transport::EventLoop`] inside a
//! [`tokio::task::LocalSet`] and hand its events to
//! [`ConnectionSession::dispatch`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod document;
pub mod error;
pub mod events;
pub mod sharedb;
pub mod transport;

pub use connection::{ConnectionOptions, ConnectionSession};
pub use document::{DocumentSession, DocumentState, UpdateOutcome, NEW_DOCUMENT_REASON};
pub use error::SessionError;
pub use events::{ErrorReport, Payload, TreeFilter};
pub use sharedb::{
    OpSource, RemoteDocument, ShareDbConnection, ShareDbDocument, SyncConnection, SyncError,
};
pub use transport::{
    parse_ws_url, EventLoop, ListenerAction, ListenerChain, Transport, TransportError,
    TransportEvent, TransportListener, WebSocketTransport,
};
