//! Transport abstraction and the WebSocket implementation.
//!
//! A transport delivers ordered text messages. Inbound traffic is surfaced as
//! [`TransportEvent`]s which a driver feeds to the connection session; the
//! session hands each event to an explicit [`ListenerChain`].

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of a transport.
pub trait Transport {
    /// Queue a text message.
    ///
    /// # Errors
    ///
    /// Returns error if the transport is closed.
    fn send(&self, text: String) -> Result<(), TransportError>;

    /// Close the transport.
    ///
    /// # Errors
    ///
    /// Returns error if the transport is already closed.
    fn close(&self) -> Result<(), TransportError>;
}

/// Lifecycle and message events of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection established
    Open,
    /// Text message received
    Message(String),
    /// Connection closed
    Close,
    /// Transport failure
    Error(String),
}

/// Whether an event should travel further down the listener chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerAction {
    /// Hand the event to the next listener
    Continue,
    /// Stop delivery of this event
    Stop,
}

/// A stage of the listener chain.
pub trait TransportListener {
    /// Handle one event.
    fn on_event(&self, event: &TransportEvent) -> ListenerAction;
}

/// Ordered transport listeners.
#[derive(Default)]
pub struct ListenerChain {
    listeners: RefCell<Vec<Rc<dyn TransportListener>>>,
}

impl ListenerChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener.
    pub fn push(&self, listener: Rc<dyn TransportListener>) {
        self.listeners.borrow_mut().push(listener);
    }

    /// Number of listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.borrow().is_empty()
    }

    /// Deliver an event to each listener in order until one stops it.
    pub fn dispatch(&self, event: &TransportEvent) -> ListenerAction {
        let listeners = self.listeners.borrow().clone();
        for listener in listeners {
            if listener.on_event(event) == ListenerAction::Stop {
                return ListenerAction::Stop;
            }
        }
        ListenerAction::Continue
    }
}

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

/// WebSocket transport handle.
///
/// Sends are queued and performed by the paired [`EventLoop`].
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl WebSocketTransport {
    /// Connect to a Webstrates server.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or the handshake fails.
    pub async fn connect(url: &str) -> Result<(Self, EventLoop), TransportError> {
        let url = parse_ws_url(url)?;

        tracing::info!(url = %url, "Connecting to Webstrates server");

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(format!("{url}: {e}")))?;
        let (sink, stream) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        Ok((
            Self { outgoing: tx },
            EventLoop {
                sink,
                stream,
                outgoing: rx,
                opened: false,
                finished: false,
            },
        ))
    }
}

impl Transport for WebSocketTransport {
    fn send(&self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) -> Result<(), TransportError> {
        self.outgoing
            .send(Outgoing::Close)
            .map_err(|_| TransportError::Closed)
    }
}

/// Drives a WebSocket connection.
///
/// Writes queued messages and yields inbound [`TransportEvent`]s. The first
/// event is always [`TransportEvent::Open`].
pub struct EventLoop {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    opened: bool,
    finished: bool,
}

impl EventLoop {
    /// Wait for the next event.
    ///
    /// Returns `None` once the connection has closed or failed.
    pub async fn poll(&mut self) -> Option<TransportEvent> {
        if !self.opened {
            self.opened = true;
            return Some(TransportEvent::Open);
        }
        if self.finished {
            return None;
        }

        loop {
            tokio::select! {
                outgoing = self.outgoing.recv() => match outgoing {
                    Some(Outgoing::Text(text)) => {
                        tracing::debug!(len = text.len(), "Sending message");
                        if let Err(e) = self.sink.send(Message::text(text)).await {
                            self.finished = true;
                            return Some(TransportEvent::Error(e.to_string()));
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        if let Err(e) = self.sink.close().await {
                            tracing::debug!(error = %e, "Close handshake failed");
                        }
                        self.finished = true;
                        return Some(TransportEvent::Close);
                    }
                },
                incoming = self.stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        return Some(TransportEvent::Message(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        self.finished = true;
                        return Some(TransportEvent::Close);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.finished = true;
                        return Some(TransportEvent::Error(e.to_string()));
                    }
                },
            }
        }
    }
}

/// Validate a WebSocket URL (`ws` or `wss`).
///
/// # Errors
///
/// Returns error if the URL does not parse, has another scheme or no host.
pub fn parse_ws_url(input: &str) -> Result<Url, TransportError> {
    let url = Url::parse(input).map_err(|e| TransportError::InvalidUrl(format!("{input}: {e}")))?;

    match url.scheme() {
        "ws" | "wss" => {}
        scheme => {
            return Err(TransportError::InvalidUrl(format!(
                "{input}: unsupported scheme '{scheme}'"
            )));
        }
    }

    if url.host_str().is_none() {
        return Err(TransportError::InvalidUrl(format!("{input}: missing host")));
    }

    Ok(url)
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// URL is not a usable WebSocket URL
    #[error("invalid WebSocket URL: {0}")]
    InvalidUrl(String),
    /// Connection could not be established
    #[error("connection failed: {0}")]
    Connect(String),
    /// Transport is closed
    #[error("transport closed")]
    Closed,
}
