//! Connection session.
//!
//! Owns the transport lifecycle: reports open/close/error events, filters
//! Webstrates control messages out of the sync stream, keeps the socket
//! alive, and opens document sessions on the shared ShareDB connection.

use crate::document::DocumentSession;
use crate::error::SessionError;
use crate::events::{
    emit, emit_error, error_handler, unit_handler, ErrorReport, Payload, CONNECTED,
    CONNECTION_EVENTS, DISCONNECTED, ERROR,
};
use crate::sharedb::{ShareDbConnection, SyncConnection, SyncError};
use crate::transport::{
    ListenerAction, ListenerChain, Transport, TransportEvent, TransportListener,
};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use webstrates_core::{EventBus, SubscribeOptions, Subscription};
use webstrates_proto::{is_control, keep_alive};

/// Connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Interval between keep-alive pings; zero pings back-to-back
    pub keep_alive_timeout: Duration,
    /// Whether [`ConnectionSession::open`] connects documents immediately
    pub auto_connect: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_secs(10),
            auto_connect: true,
        }
    }
}

/// A connection to a Webstrates server.
///
/// Feed transport events to [`ConnectionSession::dispatch`]. The keep-alive
/// timer is a local task, so dispatching [`TransportEvent::Open`] must
/// happen inside a [`tokio::task::LocalSet`].
#[derive(Clone)]
pub struct ConnectionSession {
    inner: Rc<ConnectionInner>,
}

struct ConnectionInner {
    transport: Rc<dyn Transport>,
    options: ConnectionOptions,
    events: EventBus<Payload>,
    listeners: ListenerChain,
    sync: Rc<ShareDbConnection>,
    keep_alive: RefCell<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("options", &self.inner.options)
            .field("ready", &self.inner.sync.is_ready())
            .finish_non_exhaustive()
    }
}

impl ConnectionSession {
    /// Create a session over `transport`.
    #[must_use]
    pub fn new(transport: Rc<dyn Transport>, options: ConnectionOptions) -> Self {
        let sync = Rc::new(ShareDbConnection::new(Rc::clone(&transport)));

        let inner = Rc::new_cyclic(|weak: &Weak<ConnectionInner>| {
            let listeners = ListenerChain::new();
            listeners.push(Rc::new(Lifecycle {
                session: Weak::clone(weak),
            }));
            listeners.push(Rc::clone(&sync) as Rc<dyn TransportListener>);

            ConnectionInner {
                transport,
                options,
                events: EventBus::with_allowed_events(CONNECTION_EVENTS),
                listeners,
                sync: Rc::clone(&sync),
                keep_alive: RefCell::new(None),
            }
        });

        let weak = Rc::downgrade(&inner);
        sync.on_protocol_error(Rc::new(move |error: &SyncError| {
            if let Some(inner) = weak.upgrade() {
                emit_error(
                    &inner.events,
                    ErrorReport::new(
                        "Unable to handle sync message",
                        SessionError::Protocol(error.to_string()),
                    ),
                );
            }
        }));

        Self { inner }
    }

    /// Connection options.
    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Underlying event bus, for raw registrations.
    #[must_use]
    pub fn events(&self) -> &EventBus<Payload> {
        &self.inner.events
    }

    /// Handle one transport event.
    pub fn dispatch(&self, event: &TransportEvent) {
        if self.inner.listeners.dispatch(event) == ListenerAction::Stop {
            tracing::trace!("Event consumed before reaching sync connection");
        }
    }

    /// Open a document using the configured `auto_connect` option.
    #[must_use]
    pub fn open(&self, id: &str) -> DocumentSession {
        self.open_document(id, self.inner.options.auto_connect)
    }

    /// Open a document.
    ///
    /// With `auto_connect` unset the caller registers handlers first and
    /// then calls [`DocumentSession::connect`].
    #[must_use]
    pub fn open_document(&self, id: &str, auto_connect: bool) -> DocumentSession {
        let connection: Rc<dyn SyncConnection> = Rc::clone(&self.inner.sync) as _;
        let document = DocumentSession::new(id, connection);
        if auto_connect {
            document.connect();
        }
        document
    }

    /// Stop the keep-alive timer and close the transport.
    ///
    /// # Errors
    ///
    /// Returns error if the transport is already closed.
    pub fn close(&self) -> Result<(), SessionError> {
        self.inner.stop_keep_alive();
        tracing::info!("Closing connection");
        self.inner
            .transport
            .close()
            .map_err(|e| SessionError::TransportFault(e.to_string()))
    }

    /// Called when the transport opens.
    ///
    /// # Errors
    ///
    /// Returns error if registration fails.
    pub fn on_did_connect(
        &self,
        handler: impl Fn() + 'static,
    ) -> Result<Subscription<Payload>, SessionError> {
        Ok(self
            .inner
            .events
            .register(CONNECTED, unit_handler(handler), SubscribeOptions::default())?)
    }

    /// Called when the transport closes.
    ///
    /// # Errors
    ///
    /// Returns error if registration fails.
    pub fn on_did_disconnect(
        &self,
        handler: impl Fn() + 'static,
    ) -> Result<Subscription<Payload>, SessionError> {
        Ok(self.inner.events.register(
            DISCONNECTED,
            unit_handler(handler),
            SubscribeOptions::default(),
        )?)
    }

    /// Called for transport faults and undecodable messages.
    ///
    /// # Errors
    ///
    /// Returns error if registration fails.
    pub fn on_error(
        &self,
        handler: impl Fn(&ErrorReport) + 'static,
    ) -> Result<Subscription<Payload>, SessionError> {
        Ok(self
            .inner
            .events
            .register(ERROR, error_handler(handler), SubscribeOptions::default())?)
    }
}

impl ConnectionInner {
    fn start_keep_alive(self: &Rc<Self>) {
        self.stop_keep_alive();

        let period = self.options.keep_alive_timeout;
        let session = Rc::downgrade(self);
        let handle = tokio::task::spawn_local(async move {
            loop {
                if period.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(period).await;
                }
                let Some(inner) = session.upgrade() else {
                    break;
                };
                if let Err(e) = inner.transport.send(keep_alive()) {
                    emit_error(
                        &inner.events,
                        ErrorReport::new(
                            "Unable to send keep-alive",
                            SessionError::TransportFault(e.to_string()),
                        ),
                    );
                }
            }
        });

        *self.keep_alive.borrow_mut() = Some(handle);
    }

    fn stop_keep_alive(&self) {
        if let Some(handle) = self.keep_alive.borrow_mut().take() {
            handle.abort();
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.stop_keep_alive();
    }
}

/// First stage of the listener chain.
struct Lifecycle {
    session: Weak<ConnectionInner>,
}

impl TransportListener for Lifecycle {
    fn on_event(&self, event: &TransportEvent) -> ListenerAction {
        let Some(inner) = self.session.upgrade() else {
            return ListenerAction::Continue;
        };

        match event {
            TransportEvent::Open => {
                tracing::info!("Connection open");
                inner.start_keep_alive();
                emit(&inner.events, CONNECTED, Payload::Empty);
                ListenerAction::Continue
            }
            TransportEvent::Message(text) => {
                let message: Value = match serde_json::from_str(text) {
                    Ok(message) => message,
                    Err(e) => {
                        emit_error(
                            &inner.events,
                            ErrorReport::new(
                                "Unable to parse message",
                                SessionError::Protocol(e.to_string()),
                            )
                            .with_payload(text.as_str()),
                        );
                        return ListenerAction::Stop;
                    }
                };

                if let Some(error) = message.get("error") {
                    emit_error(
                        &inner.events,
                        ErrorReport::new(
                            "Server reported an error",
                            SessionError::Protocol(error.to_string()),
                        )
                        .with_payload(text.as_str()),
                    );
                }

                if is_control(&message) {
                    tracing::trace!("Control message");
                    ListenerAction::Stop
                } else {
                    ListenerAction::Continue
                }
            }
            TransportEvent::Close => {
                tracing::info!("Connection closed");
                inner.stop_keep_alive();
                emit(&inner.events, DISCONNECTED, Payload::Empty);
                ListenerAction::Continue
            }
            TransportEvent::Error(reason) => {
                tracing::warn!(error = %reason, "Transport error");
                inner.stop_keep_alive();
                emit_error(
                    &inner.events,
                    ErrorReport::new(
                        "Transport error",
                        SessionError::TransportFault(reason.clone()),
                    ),
                );
                ListenerAction::Continue
            }
        }
    }
}
