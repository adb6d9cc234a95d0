//! Session event names, payloads and typed handler adapters.

use crate::error::SessionError;
use std::cell::RefCell;
use std::rc::Rc;
use webstrates_core::{serialize, CodecError, EventBus, Handler, Node, SubscribeOptions, TriggerOptions};

/// A document or connection became available.
pub const CONNECTED: &str = "connected";
/// A document or connection went away.
pub const DISCONNECTED: &str = "disconnected";
/// The document snapshot was loaded.
pub const UPDATE: &str = "update";
/// An operation was applied to the document.
pub const UPDATE_OP: &str = "updateOp";
/// The document did not exist and is being created.
pub const NEW_DOCUMENT: &str = "newDocument";
/// Something went wrong.
pub const ERROR: &str = "error";

/// Events a document session emits.
pub const DOCUMENT_EVENTS: [&str; 6] = [CONNECTED, DISCONNECTED, UPDATE, UPDATE_OP, NEW_DOCUMENT, ERROR];

/// Events a connection session emits.
pub const CONNECTION_EVENTS: [&str; 3] = [CONNECTED, DISCONNECTED, ERROR];

/// Event payload.
///
/// `update` and `updateOp` are triggered with [`Payload::Tree`]; filters see
/// the tree and handlers receive [`Payload::Html`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No data
    Empty,
    /// Human readable notice
    Notice(String),
    /// Document tree
    Tree(Node),
    /// Rendered document
    Html(String),
    /// Error report
    Error(ErrorReport),
}

/// Payload of `error` events.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    /// What the session was doing
    pub message: String,
    /// Offending input (HTML or JSON), if any
    pub payload: Option<String>,
    /// Cause
    pub error: SessionError,
}

impl ErrorReport {
    /// Create a report without payload.
    #[must_use]
    pub fn new(message: impl Into<String>, error: SessionError) -> Self {
        Self {
            message: message.into(),
            payload: None,
            error,
        }
    }

    /// Attach the offending input.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// Filter applied to the document tree before it is rendered for one handler.
pub type TreeFilter = Rc<dyn Fn(&mut Node) -> Node>;

pub(crate) fn unit_handler(handler: impl Fn() + 'static) -> Handler<Payload> {
    Rc::new(move |_: Payload| handler())
}

pub(crate) fn notice_handler(handler: impl Fn(&str) + 'static) -> Handler<Payload> {
    Rc::new(move |payload: Payload| {
        if let Payload::Notice(notice) = payload {
            handler(&notice);
        }
    })
}

pub(crate) fn html_handler(handler: impl Fn(&str) + 'static) -> Handler<Payload> {
    Rc::new(move |payload: Payload| {
        if let Payload::Html(html) = payload {
            handler(&html);
        }
    })
}

pub(crate) fn error_handler(handler: impl Fn(&ErrorReport) + 'static) -> Handler<Payload> {
    Rc::new(move |payload: Payload| {
        if let Payload::Error(report) = payload {
            handler(&report);
        }
    })
}

pub(crate) fn tree_options(filter: Option<TreeFilter>) -> SubscribeOptions<Payload> {
    match filter {
        Some(filter) => SubscribeOptions::filtered(move |payload: &mut Payload| match payload {
            Payload::Tree(tree) => Payload::Tree(filter(tree)),
            other => other.clone(),
        }),
        None => SubscribeOptions::default(),
    }
}

pub(crate) fn emit(bus: &EventBus<Payload>, event: &str, payload: Payload) {
    bus.trigger(event, payload, &TriggerOptions::default());
}

pub(crate) fn emit_error(bus: &EventBus<Payload>, report: ErrorReport) {
    tracing::warn!(error = %report.error, "{}", report.message);
    emit(bus, ERROR, Payload::Error(report));
}

/// Trigger `event` with `tree`, rendering it to HTML after filtering.
///
/// Returns the serialization failures hit along the way; the affected
/// handlers are skipped.
pub(crate) fn emit_tree(bus: &EventBus<Payload>, event: &str, tree: Node) -> Vec<CodecError> {
    let failures = RefCell::new(Vec::new());
    let render = |payload: &Payload| match payload {
        Payload::Tree(tree) => match serialize(tree) {
            Ok(html) => Payload::Html(html),
            Err(e) => {
                failures.borrow_mut().push(e);
                Payload::Empty
            }
        },
        other => other.clone(),
    };
    let on_filtered = |payload: Payload| render(&payload);

    bus.trigger(
        event,
        Payload::Tree(tree),
        &TriggerOptions {
            on_filtered: Some(&on_filtered),
            on_not_filtered: Some(&render),
        },
    );
    failures.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use webstrates_core::Element;

    #[test]
    fn tree_events_render_html() {
        let bus = EventBus::with_allowed_events(DOCUMENT_EVENTS);
        let seen = Rc::new(RefCell::new(Vec::new()));

        let sink = Rc::clone(&seen);
        bus.register(
            UPDATE,
            html_handler(move |html| sink.borrow_mut().push(html.to_string())),
            tree_options(None),
        )
        .unwrap();

        let strip: TreeFilter = Rc::new(|tree: &mut Node| match tree {
            Node::Element(element) => {
                element.children.clear();
                Node::Element(element.clone())
            }
            Node::Text(text) => Node::Text(text.clone()),
        });
        let sink = Rc::clone(&seen);
        bus.register(
            UPDATE,
            html_handler(move |html| sink.borrow_mut().push(html.to_string())),
            tree_options(Some(strip)),
        )
        .unwrap();

        let tree: Node = Element::new("p").with_text("x").into();
        let failures = emit_tree(&bus, UPDATE, tree);

        assert!(failures.is_empty());
        assert_eq!(*seen.borrow(), vec!["<p>x</p>", "<p></p>"]);
    }

    #[test]
    fn render_failures_are_collected() {
        let bus = EventBus::with_allowed_events(DOCUMENT_EVENTS);
        let calls = Rc::new(RefCell::new(0));
        let count = Rc::clone(&calls);
        bus.register(
            UPDATE,
            html_handler(move |_| *count.borrow_mut() += 1),
            tree_options(None),
        )
        .unwrap();

        let broken: Node = Element::new("br").with_text("not allowed").into();
        let failures = emit_tree(&bus, UPDATE, broken);

        assert_eq!(failures.len(), 1);
        assert_eq!(*calls.borrow(), 0);
    }
}
