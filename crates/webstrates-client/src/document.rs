//! Document session.
//!
//! Wraps one remote document: subscribes to it, creates it when missing,
//! reports snapshot loads and operations as rendered HTML, and turns local
//! HTML edits into `json0` operations.

use crate::error::SessionError;
use crate::events::{
    emit, emit_error, emit_tree, error_handler, html_handler, notice_handler, tree_options,
    unit_handler, ErrorReport, Payload, TreeFilter, CONNECTED, DISCONNECTED, DOCUMENT_EVENTS,
    ERROR, NEW_DOCUMENT, UPDATE, UPDATE_OP,
};
use crate::sharedb::{OpSource, RemoteDocument, SyncConnection, SyncError};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use webstrates_core::tree::tree_from_snapshot;
use webstrates_core::{
    diff, parse, skeleton_reset, EventBus, Handler, Op, SubscribeOptions, Subscription,
};
use webstrates_proto::COLLECTION;

/// Reason given when a missing document is created.
pub const NEW_DOCUMENT_REASON: &str = "Document doesn't exist on server, creating it.";

/// Lifecycle state of a [`DocumentSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    /// Created, not connected
    Idle,
    /// Waiting for the subscribe reply
    Subscribing,
    /// Subscribed to an existing document
    Populated,
    /// Subscribed to a document this session created
    NewlyCreated,
    /// Closed by the caller
    Closed,
    /// Subscribing failed
    Failed,
}

/// Result of [`DocumentSession::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The HTML matches the snapshot
    Unchanged,
    /// An operation with this many components was submitted
    Submitted(usize),
    /// The operation was rejected and the document was reset
    Reset,
}

/// A synchronized document.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct DocumentSession {
    inner: Rc<SessionInner>,
}

struct SessionInner {
    id: String,
    connection: Rc<dyn SyncConnection>,
    events: EventBus<Payload>,
    state: Cell<DocumentState>,
    document: RefCell<Option<Rc<dyn RemoteDocument>>>,
    /// Submitted operations still awaiting an answer, with their source HTML
    submitted: RefCell<Vec<(Op, String)>>,
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .finish_non_exhaustive()
    }
}

impl DocumentSession {
    /// Create an idle session for document `id`.
    #[must_use]
    pub fn new(id: impl Into<String>, connection: Rc<dyn SyncConnection>) -> Self {
        Self {
            inner: Rc::new(SessionInner {
                id: id.into(),
                connection,
                events: EventBus::with_allowed_events(DOCUMENT_EVENTS),
                state: Cell::new(DocumentState::Idle),
                document: RefCell::new(None),
                submitted: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Document id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DocumentState {
        self.inner.state.get()
    }

    /// Underlying event bus, for raw registrations.
    #[must_use]
    pub fn events(&self) -> &EventBus<Payload> {
        &self.inner.events
    }

    /// Subscribe to the remote document.
    ///
    /// Does nothing if the session already holds a document handle.
    pub fn connect(&self) {
        if self.inner.document.borrow().is_some() {
            return;
        }

        let document = self.inner.connection.get(COLLECTION, &self.inner.id);
        let weak = Rc::downgrade(&self.inner);

        let on_op = Weak::clone(&weak);
        document.on_op(Rc::new(move |_: &Op, _: OpSource| {
            if let Some(inner) = on_op.upgrade() {
                inner.emit_snapshot(UPDATE_OP);
            }
        }));

        let on_error = Weak::clone(&weak);
        document.on_error(Rc::new(move |error: &SyncError| {
            if let Some(inner) = on_error.upgrade() {
                inner.handle_sync_error(error);
            }
        }));

        *self.inner.document.borrow_mut() = Some(Rc::clone(&document));
        self.inner.state.set(DocumentState::Subscribing);
        tracing::info!(doc_id = %self.inner.id, "Subscribing to document");

        document.subscribe(Box::new(move |result: Result<(), SyncError>| {
            if let Some(inner) = weak.upgrade() {
                inner.subscribed(result);
            }
        }));
    }

    /// Replace the document contents with `html`.
    ///
    /// The HTML is parsed, diffed against the current snapshot and the
    /// difference submitted. With `preserve_entities` set only `&gt;`,
    /// `&lt;` and `&amp;` are decoded in text.
    ///
    /// # Errors
    ///
    /// Returns error if no snapshot has been loaded, the HTML does not
    /// parse, the snapshot is not a valid tree, or both the operation and
    /// the reset that follows its rejection fail. Each failure is also
    /// emitted as an `error` event.
    pub fn update(&self, html: &str, preserve_entities: bool) -> Result<UpdateOutcome, SessionError> {
        if !matches!(
            self.state(),
            DocumentState::Populated | DocumentState::NewlyCreated
        ) {
            return Err(SessionError::NotConnected);
        }
        let document = self
            .inner
            .document
            .borrow()
            .clone()
            .ok_or(SessionError::NotConnected)?;

        let tree = parse(html, preserve_entities).map_err(|e| {
            let error = SessionError::from(e);
            emit_error(
                &self.inner.events,
                ErrorReport::new("Unable to parse HTML", error.clone()).with_payload(html),
            );
            error
        })?;

        let current = tree_from_snapshot(document.snapshot().as_ref()).map_err(|e| {
            let error = SessionError::InvalidSnapshot(e);
            emit_error(
                &self.inner.events,
                ErrorReport::new("Unable to read document snapshot", error.clone()),
            );
            error
        })?;

        let op = diff(current.as_ref(), &tree);
        if op.is_empty() {
            return Ok(UpdateOutcome::Unchanged);
        }

        let components = op.len();
        if !document.has_pending() {
            self.inner.submitted.borrow_mut().clear();
        }
        let record = op.clone();
        match document.submit_op(op) {
            Ok(()) => {
                tracing::debug!(doc_id = %self.inner.id, components, "Document updated");
                self.inner
                    .submitted
                    .borrow_mut()
                    .push((record, html.to_string()));
                Ok(UpdateOutcome::Submitted(components))
            }
            Err(e) => {
                emit_error(
                    &self.inner.events,
                    ErrorReport::new("Invalid document, rebuilding", SessionError::DiffRejected(e))
                        .with_payload(html),
                );
                self.inner.reset(document.as_ref())?;
                Ok(UpdateOutcome::Reset)
            }
        }
    }

    /// Whether local edits still await acknowledgement by the server.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.inner
            .document()
            .is_some_and(|document| document.has_pending())
    }

    /// Release the remote subscription.
    ///
    /// Emits `disconnected` if the session held a document handle.
    pub fn close(&self) {
        let document = self.inner.document.borrow_mut().take();
        if let Some(document) = document {
            document.destroy();
            self.inner.state.set(DocumentState::Closed);
            tracing::info!(doc_id = %self.inner.id, "Document closed");
            emit(&self.inner.events, DISCONNECTED, Payload::Empty);
        }
    }

    /// Called once the snapshot has been loaded and the document can be
    /// updated.
    ///
    /// # Errors
    ///
    /// Returns error if registration fails.
    pub fn on_did_connect(
        &self,
        handler: impl Fn() + 'static,
    ) -> Result<Subscription<Payload>, SessionError> {
        self.register(CONNECTED, unit_handler(handler), SubscribeOptions::default())
    }

    /// Called once the session has been closed.
    ///
    /// # Errors
    ///
    /// Returns error if registration fails.
    pub fn on_did_disconnect(
        &self,
        handler: impl Fn() + 'static,
    ) -> Result<Subscription<Payload>, SessionError> {
        self.register(DISCONNECTED, unit_handler(handler), SubscribeOptions::default())
    }

    /// Called with the rendered document once the snapshot has been loaded.
    ///
    /// With a filter the handler receives the rendering of the filtered tree.
    ///
    /// # Errors
    ///
    /// Returns error if registration fails.
    pub fn on_update(
        &self,
        handler: impl Fn(&str) + 'static,
        filter: Option<TreeFilter>,
    ) -> Result<Subscription<Payload>, SessionError> {
        self.register(UPDATE, html_handler(handler), tree_options(filter))
    }

    /// Called with the rendered document after every applied operation,
    /// local or remote.
    ///
    /// # Errors
    ///
    /// Returns error if registration fails.
    pub fn on_update_op(
        &self,
        handler: impl Fn(&str) + 'static,
        filter: Option<TreeFilter>,
    ) -> Result<Subscription<Payload>, SessionError> {
        self.register(UPDATE_OP, html_handler(handler), tree_options(filter))
    }

    /// Called with a reason when the document is being created.
    ///
    /// # Errors
    ///
    /// Returns error if registration fails.
    pub fn on_new_document(
        &self,
        handler: impl Fn(&str) + 'static,
    ) -> Result<Subscription<Payload>, SessionError> {
        self.register(NEW_DOCUMENT, notice_handler(handler), SubscribeOptions::default())
    }

    /// Called for every error.
    ///
    /// # Errors
    ///
    /// Returns error if registration fails.
    pub fn on_error(
        &self,
        handler: impl Fn(&ErrorReport) + 'static,
    ) -> Result<Subscription<Payload>, SessionError> {
        self.register(ERROR, error_handler(handler), SubscribeOptions::default())
    }

    fn register(
        &self,
        event: &str,
        handler: Handler<Payload>,
        options: SubscribeOptions<Payload>,
    ) -> Result<Subscription<Payload>, SessionError> {
        Ok(self.inner.events.register(event, handler, options)?)
    }
}

impl SessionInner {
    fn document(&self) -> Option<Rc<dyn RemoteDocument>> {
        self.document.borrow().clone()
    }

    fn subscribed(&self, result: Result<(), SyncError>) {
        if let Err(e) = result {
            self.state.set(DocumentState::Failed);
            tracing::error!(doc_id = %self.id, error = %e, "Subscribe failed");
            emit_error(
                &self.events,
                ErrorReport::new("Unable to subscribe to document", SessionError::Subscribe(e)),
            );
            return;
        }

        let Some(document) = self.document() else {
            return;
        };

        if document.exists() {
            self.state.set(DocumentState::Populated);
            tracing::info!(doc_id = %self.id, "Document loaded");
        } else {
            self.state.set(DocumentState::NewlyCreated);
            emit(
                &self.events,
                NEW_DOCUMENT,
                Payload::Notice(NEW_DOCUMENT_REASON.to_string()),
            );
            if let Err(e) = document.create() {
                emit_error(
                    &self.events,
                    ErrorReport::new("Unable to create document", SessionError::Subscribe(e)),
                );
                return;
            }
            if let Err(e) = document.submit_op(skeleton_reset()) {
                emit_error(
                    &self.events,
                    ErrorReport::new("Unable to initialize document", SessionError::DiffRejected(e)),
                );
                return;
            }
        }

        emit(&self.events, CONNECTED, Payload::Empty);
        self.emit_snapshot(UPDATE);
    }

    fn emit_snapshot(&self, event: &str) {
        let Some(document) = self.document() else {
            return;
        };
        let tree = match tree_from_snapshot(document.snapshot().as_ref()) {
            Ok(Some(tree)) => tree,
            Ok(None) => {
                tracing::debug!(doc_id = %self.id, event, "Snapshot is empty");
                return;
            }
            Err(e) => {
                let payload = document.snapshot().map(|data| data.to_string());
                let mut report = ErrorReport::new(
                    "Unable to read document snapshot",
                    SessionError::InvalidSnapshot(e),
                );
                report.payload = payload;
                emit_error(&self.events, report);
                return;
            }
        };

        for failure in emit_tree(&self.events, event, tree) {
            emit_error(
                &self.events,
                ErrorReport::new("Unable to render document", SessionError::from(failure)),
            );
        }
    }

    fn handle_sync_error(&self, error: &SyncError) {
        match error {
            SyncError::Rejected { op, .. } if *op != skeleton_reset() => {
                let mut report = ErrorReport::new(
                    "Invalid document, rebuilding",
                    SessionError::DiffRejected(error.clone()),
                );
                if let Some(html) = self.take_submitted(op) {
                    report = report.with_payload(html);
                }
                emit_error(&self.events, report);
                if let Some(document) = self.document() {
                    if let Err(e) = self.reset(document.as_ref()) {
                        tracing::error!(doc_id = %self.id, error = %e, "Reset failed");
                    }
                }
            }
            SyncError::Rejected { .. } => emit_error(
                &self.events,
                ErrorReport::new("Reset rejected", SessionError::DiffRejected(error.clone())),
            ),
            SyncError::Transport(e) => emit_error(
                &self.events,
                ErrorReport::new("Unable to send", SessionError::TransportFault(e.to_string())),
            ),
            other => emit_error(
                &self.events,
                ErrorReport::new("Document error", SessionError::Protocol(other.to_string())),
            ),
        }
    }

    /// HTML that produced a submitted operation.
    fn take_submitted(&self, op: &Op) -> Option<String> {
        let mut submitted = self.submitted.borrow_mut();
        let index = submitted.iter().position(|(sent, _)| sent == op)?;
        Some(submitted.remove(index).1)
    }

    /// Replace the document with the empty skeleton.
    fn reset(&self, document: &dyn RemoteDocument) -> Result<(), SessionError> {
        tracing::warn!(doc_id = %self.id, "Resetting document to skeleton");
        document.submit_op(skeleton_reset()).map_err(|e| {
            let error = SessionError::DiffRejected(e);
            emit_error(
                &self.events,
                ErrorReport::new("Unable to reset document", error.clone()),
            );
            error
        })
    }
}
