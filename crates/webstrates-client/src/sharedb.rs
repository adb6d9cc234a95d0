//! Minimal ShareDB client.
//!
//! Implements the subset of the ShareDB protocol a Webstrates client needs:
//! handshake, subscribe, create, submit with a single in-flight operation,
//! acknowledgement, remote operations and unsubscribe. Operations are never
//! transformed; remote operations are applied to the local snapshot as they
//! arrive.

use crate::transport::{
    ListenerAction, Transport, TransportError, TransportEvent, TransportListener,
};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use webstrates_core::{apply, ApplyError, Op};
use webstrates_proto::{
    ClientMessage, DocumentRef, HandshakeReply, OpMessage, ServerMessage, SubscribeReply,
    JSON0_URI,
};

/// Where an applied operation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSource {
    /// Submitted by this client
    Local,
    /// Received from the server
    Remote,
}

/// Callback invoked once a subscribe request completes.
pub type SubscribeCallback = Box<dyn FnOnce(Result<(), SyncError>)>;

/// Listener for applied operations.
pub type OpListener = Rc<dyn Fn(&Op, OpSource)>;

/// Listener for document errors.
pub type ErrorListener = Rc<dyn Fn(&SyncError)>;

/// Source of document handles.
pub trait SyncConnection {
    /// Get the handle of a document, creating it if needed.
    fn get(&self, collection: &str, id: &str) -> Rc<dyn RemoteDocument>;
}

/// A remotely stored document.
pub trait RemoteDocument {
    /// Document id.
    fn id(&self) -> &str;

    /// Fetch the snapshot and follow subsequent operations.
    fn subscribe(&self, callback: SubscribeCallback);

    /// Register a listener fired after every applied operation.
    fn on_op(&self, listener: OpListener);

    /// Register a listener for asynchronous failures.
    fn on_error(&self, listener: ErrorListener);

    /// Current document contents.
    fn snapshot(&self) -> Option<Value>;

    /// Whether the document exists remotely.
    fn exists(&self) -> bool;

    /// Create the document with the `json0` type.
    ///
    /// # Errors
    ///
    /// Returns error if the document already exists.
    fn create(&self) -> Result<(), SyncError>;

    /// Apply `op` locally and submit it.
    ///
    /// # Errors
    ///
    /// Returns error if the document does not exist or `op` does not apply;
    /// the snapshot is left untouched in that case.
    fn submit_op(&self, op: Op) -> Result<(), SyncError>;

    /// Whether submitted operations still await acknowledgement.
    fn has_pending(&self) -> bool;

    /// Unsubscribe and release the handle.
    fn destroy(&self);
}

/// A ShareDB connection over a [`Transport`].
///
/// Register it on the transport's listener chain so it receives server
/// messages. Messages are buffered until the server handshake arrives.
pub struct ShareDbConnection {
    inner: Rc<ConnectionInner>,
}

struct ConnectionInner {
    transport: Rc<dyn Transport>,
    client_id: RefCell<Option<String>>,
    ready: Cell<bool>,
    seq: Cell<u64>,
    outbox: RefCell<Vec<String>>,
    documents: RefCell<HashMap<String, Rc<DocumentInner>>>,
    protocol_listeners: RefCell<Vec<ErrorListener>>,
}

impl ShareDbConnection {
    /// Create a connection sending through `transport`.
    #[must_use]
    pub fn new(transport: Rc<dyn Transport>) -> Self {
        Self {
            inner: Rc::new(ConnectionInner {
                transport,
                client_id: RefCell::new(None),
                ready: Cell::new(false),
                seq: Cell::new(0),
                outbox: RefCell::new(Vec::new()),
                documents: RefCell::new(HashMap::new()),
                protocol_listeners: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Client id assigned by the server.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.inner.client_id.borrow().clone()
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.get()
    }

    /// Register a listener for connection-level protocol failures.
    pub fn on_protocol_error(&self, listener: ErrorListener) {
        self.inner.protocol_listeners.borrow_mut().push(listener);
    }

    /// Handle one text message from the server.
    pub fn handle_message(&self, text: &str) {
        match ServerMessage::from_json(text) {
            Ok(message) => self.inner.handle(message),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to decode sync message");
                self.inner.report(&SyncError::Protocol(e.to_string()));
            }
        }
    }
}

impl SyncConnection for ShareDbConnection {
    fn get(&self, collection: &str, id: &str) -> Rc<dyn RemoteDocument> {
        let key = document_key(collection, id);
        let existing = self.inner.documents.borrow().get(&key).cloned();
        let document = existing.unwrap_or_else(|| {
            let document = Rc::new(DocumentInner::new(
                DocumentRef {
                    c: collection.to_string(),
                    d: id.to_string(),
                },
                Rc::downgrade(&self.inner),
            ));
            self.inner
                .documents
                .borrow_mut()
                .insert(key, Rc::clone(&document));
            document
        });
        Rc::new(ShareDbDocument { inner: document })
    }
}

impl TransportListener for ShareDbConnection {
    fn on_event(&self, event: &TransportEvent) -> ListenerAction {
        match event {
            TransportEvent::Message(text) => self.handle_message(text),
            TransportEvent::Close | TransportEvent::Error(_) => {
                if self.inner.ready.replace(false) {
                    tracing::info!("Sync connection lost");
                }
            }
            TransportEvent::Open => {}
        }
        ListenerAction::Continue
    }
}

impl ConnectionInner {
    fn next_seq(&self) -> u64 {
        let seq = self.seq.get() + 1;
        self.seq.set(seq);
        seq
    }

    fn send(&self, message: &ClientMessage) -> Result<(), SyncError> {
        let text = message
            .to_json()
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        if self.ready.get() {
            self.transport.send(text).map_err(SyncError::Transport)
        } else {
            self.outbox.borrow_mut().push(text);
            Ok(())
        }
    }

    fn report(&self, error: &SyncError) {
        let listeners = self.protocol_listeners.borrow().clone();
        for listener in listeners {
            listener(error);
        }
    }

    fn document(&self, reference: &str, collection: &str) -> Option<Rc<DocumentInner>> {
        let document = self
            .documents
            .borrow()
            .get(&document_key(collection, reference))
            .cloned();
        if document.is_none() {
            tracing::debug!(doc_id = %reference, "Message for unknown document");
        }
        document
    }

    fn handle(&self, message: ServerMessage) {
        match message {
            ServerMessage::Init(handshake) | ServerMessage::Handshake(handshake) => {
                self.handle_handshake(handshake);
            }
            ServerMessage::Subscribe(reply) => {
                if let Some(document) = self.document(&reply.d, &reply.c) {
                    document.handle_subscribe(reply);
                }
            }
            ServerMessage::Unsubscribe(reply) => {
                tracing::debug!(doc_id = %reply.d, "Unsubscribed");
            }
            ServerMessage::Op(message) => {
                if let Some(document) = self.document(&message.d, &message.c) {
                    let client_id = self.client_id.borrow().clone();
                    document.handle_op(message, client_id.as_deref());
                }
            }
        }
    }

    fn handle_handshake(&self, handshake: HandshakeReply) {
        tracing::info!(client_id = ?handshake.id, "Sync handshake completed");
        *self.client_id.borrow_mut() = handshake.id;
        self.ready.set(true);

        let queued = std::mem::take(&mut *self.outbox.borrow_mut());
        for text in queued {
            if let Err(e) = self.transport.send(text) {
                tracing::warn!(error = %e, "Failed to flush queued message");
                self.report(&SyncError::Transport(e));
                break;
            }
        }
    }
}

fn document_key(collection: &str, id: &str) -> String {
    format!("{collection}/{id}")
}

enum Pending {
    Create,
    Op(Op),
}

struct InFlight {
    seq: u64,
    pending: Pending,
}

#[derive(Default)]
struct DocumentState {
    version: u64,
    type_uri: Option<String>,
    data: Option<Value>,
    subscribed: bool,
    destroyed: bool,
    subscribe_callback: Option<SubscribeCallback>,
    inflight: Option<InFlight>,
    queue: VecDeque<Pending>,
}

#[derive(Default)]
struct Listeners {
    op: Vec<OpListener>,
    error: Vec<ErrorListener>,
}

struct DocumentInner {
    reference: DocumentRef,
    connection: Weak<ConnectionInner>,
    state: RefCell<DocumentState>,
    listeners: RefCell<Listeners>,
}

impl DocumentInner {
    fn new(reference: DocumentRef, connection: Weak<ConnectionInner>) -> Self {
        Self {
            reference,
            connection,
            state: RefCell::new(DocumentState::default()),
            listeners: RefCell::new(Listeners::default()),
        }
    }

    fn send(&self, message: &ClientMessage) -> Result<(), SyncError> {
        let connection = self.connection.upgrade().ok_or(SyncError::Destroyed)?;
        connection.send(message)
    }

    fn fire_error(&self, error: &SyncError) {
        let listeners = self.listeners.borrow().error.clone();
        if listeners.is_empty() {
            tracing::warn!(doc_id = %self.reference.d, error = %error, "Unhandled document error");
        }
        for listener in listeners {
            listener(error);
        }
    }

    fn fire_op(&self, op: &Op, source: OpSource) {
        let listeners = self.listeners.borrow().op.clone();
        for listener in listeners {
            listener(op, source);
        }
    }

    fn handle_subscribe(&self, reply: SubscribeReply) {
        let callback = self.state.borrow_mut().subscribe_callback.take();

        if let Some(error) = reply.error {
            let error = SyncError::Server(error.to_string());
            match callback {
                Some(callback) => callback(Err(error)),
                None => self.fire_error(&error),
            }
            return;
        }

        if let Some(snapshot) = reply.data {
            let mut state = self.state.borrow_mut();
            state.version = snapshot.v;
            state.type_uri = snapshot.type_uri.or_else(|| {
                snapshot.data.as_ref().map(|_| JSON0_URI.to_string())
            });
            state.data = snapshot.data;
            state.subscribed = true;
        }
        tracing::debug!(
            doc_id = %self.reference.d,
            version = self.state.borrow().version,
            "Snapshot loaded"
        );

        if let Some(callback) = callback {
            callback(Ok(()));
        }
    }

    fn handle_op(&self, message: OpMessage, client_id: Option<&str>) {
        let answers_inflight = self
            .state
            .borrow()
            .inflight
            .as_ref()
            .is_some_and(|inflight| message.answers(client_id, inflight.seq));

        if answers_inflight {
            let inflight = self.state.borrow_mut().inflight.take();
            match message.error {
                Some(error) => {
                    tracing::warn!(doc_id = %self.reference.d, error = %error, "Operation rejected");
                    let op = match inflight.map(|inflight| inflight.pending) {
                        Some(Pending::Op(op)) => op,
                        _ => Op::new(),
                    };
                    self.fire_error(&SyncError::Rejected {
                        reason: error.to_string(),
                        op,
                    });
                }
                None => {
                    let mut state = self.state.borrow_mut();
                    let version = message.v.map_or(state.version + 1, |v| v + 1);
                    state.version = version;
                    tracing::debug!(
                        doc_id = %self.reference.d,
                        seq = message.seq,
                        version = state.version,
                        "Operation acknowledged"
                    );
                }
            }
            self.flush();
            return;
        }

        if let Some(error) = message.error {
            self.fire_error(&SyncError::Server(error.to_string()));
            return;
        }

        self.apply_remote(message);
    }

    fn apply_remote(&self, message: OpMessage) {
        let mut state = self.state.borrow_mut();
        if let Some(v) = message.v {
            if v != state.version {
                tracing::warn!(
                    doc_id = %self.reference.d,
                    version = state.version,
                    remote_version = v,
                    "Remote operation version mismatch"
                );
            }
        }
        if state.inflight.is_some() || !state.queue.is_empty() {
            tracing::warn!(
                doc_id = %self.reference.d,
                "Applying remote operation without transform"
            );
        }

        if let Some(create) = message.create {
            state.type_uri = Some(create.type_uri);
            state.data = create.data;
            state.version += 1;
            return;
        }
        if message.del.unwrap_or(false) {
            state.type_uri = None;
            state.data = None;
            state.version += 1;
            return;
        }
        let Some(op) = message.op else {
            return;
        };

        let mut data = state.data.clone().unwrap_or(Value::Null);
        if let Err(e) = apply(&mut data, &op) {
            drop(state);
            tracing::warn!(doc_id = %self.reference.d, error = %e, "Remote operation does not apply");
            self.fire_error(&SyncError::Apply(e));
            return;
        }
        state.data = Some(data);
        state.version += 1;
        drop(state);

        tracing::debug!(doc_id = %self.reference.d, components = op.len(), "Remote operation applied");
        self.fire_op(&op, OpSource::Remote);
    }

    fn flush(&self) {
        let message = {
            let mut state = self.state.borrow_mut();
            if state.inflight.is_some() || state.destroyed {
                return;
            }
            let Some(connection) = self.connection.upgrade() else {
                return;
            };
            let Some(pending) = state.queue.pop_front() else {
                return;
            };
            let seq = connection.next_seq();
            let message = match &pending {
                Pending::Create => OpMessage::create(&self.reference, state.version, seq),
                Pending::Op(op) => {
                    OpMessage::submit(&self.reference, state.version, seq, op.clone())
                }
            };
            state.inflight = Some(InFlight { seq, pending });
            message
        };

        if let Err(e) = self.send(&ClientMessage::Op(message)) {
            let mut state = self.state.borrow_mut();
            if let Some(inflight) = state.inflight.take() {
                state.queue.push_front(inflight.pending);
            }
            drop(state);
            self.fire_error(&e);
        }
    }
}

/// Handle to a document of a [`ShareDbConnection`].
pub struct ShareDbDocument {
    inner: Rc<DocumentInner>,
}

impl RemoteDocument for ShareDbDocument {
    fn id(&self) -> &str {
        &self.inner.reference.d
    }

    fn subscribe(&self, callback: SubscribeCallback) {
        self.inner.state.borrow_mut().subscribe_callback = Some(callback);
        let request = ClientMessage::Subscribe(self.inner.reference.clone());
        if let Err(e) = self.inner.send(&request) {
            let callback = self.inner.state.borrow_mut().subscribe_callback.take();
            if let Some(callback) = callback {
                callback(Err(e));
            }
        }
    }

    fn on_op(&self, listener: OpListener) {
        self.inner.listeners.borrow_mut().op.push(listener);
    }

    fn on_error(&self, listener: ErrorListener) {
        self.inner.listeners.borrow_mut().error.push(listener);
    }

    fn snapshot(&self) -> Option<Value> {
        self.inner.state.borrow().data.clone()
    }

    fn exists(&self) -> bool {
        self.inner.state.borrow().type_uri.is_some()
    }

    fn create(&self) -> Result<(), SyncError> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.type_uri.is_some() {
                return Err(SyncError::AlreadyExists(self.inner.reference.d.clone()));
            }
            state.type_uri = Some(JSON0_URI.to_string());
            state.data = None;
            state.queue.push_back(Pending::Create);
        }
        tracing::info!(doc_id = %self.inner.reference.d, "Creating document");
        self.inner.flush();
        Ok(())
    }

    fn submit_op(&self, op: Op) -> Result<(), SyncError> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.type_uri.is_none() {
                return Err(SyncError::NotCreated(self.inner.reference.d.clone()));
            }
            let mut data = state.data.clone().unwrap_or(Value::Null);
            apply(&mut data, &op).map_err(|e| SyncError::Rejected {
                reason: e.to_string(),
                op: op.clone(),
            })?;
            state.data = Some(data);
            state.queue.push_back(Pending::Op(op.clone()));
        }
        tracing::debug!(
            doc_id = %self.inner.reference.d,
            components = op.len(),
            "Submitting operation"
        );
        self.inner.fire_op(&op, OpSource::Local);
        self.inner.flush();
        Ok(())
    }

    fn has_pending(&self) -> bool {
        let state = self.inner.state.borrow();
        state.inflight.is_some() || !state.queue.is_empty()
    }

    fn destroy(&self) {
        let subscribed = {
            let mut state = self.inner.state.borrow_mut();
            state.destroyed = true;
            std::mem::take(&mut state.subscribed)
        };
        *self.inner.listeners.borrow_mut() = Listeners::default();

        if subscribed {
            let request = ClientMessage::Unsubscribe(self.inner.reference.clone());
            if let Err(e) = self.inner.send(&request) {
                tracing::debug!(doc_id = %self.inner.reference.d, error = %e, "Unsubscribe failed");
            }
        }
        if let Some(connection) = self.inner.connection.upgrade() {
            connection
                .documents
                .borrow_mut()
                .remove(&document_key(&self.inner.reference.c, &self.inner.reference.d));
        }
    }
}

/// Sync protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// Operation was submitted before the document exists
    #[error("document '{0}' does not exist")]
    NotCreated(String),
    /// Create was called on an existing document
    #[error("document '{0}' already exists")]
    AlreadyExists(String),
    /// Operation does not apply or the server refused it
    #[error("operation rejected: {reason}")]
    Rejected {
        /// Why the operation was rejected
        reason: String,
        /// The rejected operation
        op: Op,
    },
    /// Remote operation does not apply to the local snapshot
    #[error("remote operation does not apply: {0}")]
    Apply(ApplyError),
    /// Server replied with an error
    #[error("server error: {0}")]
    Server(String),
    /// Malformed or unexpected message
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Transport failure
    #[error("transport error: {0}")]
    Transport(TransportError),
    /// Connection was dropped
    #[error("connection dropped")]
    Destroyed,
}
