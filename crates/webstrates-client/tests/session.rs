use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tokio::task::LocalSet;
use tokio::time::timeout;
use webstrates_client::{
    ConnectionOptions, ConnectionSession, DocumentSession, ErrorReport, RemoteDocument,
    SessionError, SyncConnection, SyncError, Transport, TransportError, TransportEvent,
    UpdateOutcome, WebSocketTransport, NEW_DOCUMENT_REASON,
};
use webstrates_core::{apply, skeleton_reset, Op};

const INIT: &str = r#"{"a":"init","protocol":1,"id":"me","type":"http://sharejs.org/types/JSONv0"}"#;

#[derive(Default)]
struct Recorder {
    sent: RefCell<Vec<String>>,
}

impl Transport for Recorder {
    fn send(&self, text: String) -> Result<(), TransportError> {
        self.sent.borrow_mut().push(text);
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl Recorder {
    fn sent_json(&self) -> Vec<Value> {
        self.sent
            .borrow()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    fn keep_alives(&self) -> usize {
        self.sent_json()
            .iter()
            .filter(|message| **message == json!({"type": "alive"}))
            .count()
    }
}

fn quiet() -> ConnectionOptions {
    ConnectionOptions {
        keep_alive_timeout: Duration::from_secs(3600),
        auto_connect: false,
    }
}

fn record_errors(session: &ConnectionSession) -> Rc<RefCell<Vec<ErrorReport>>> {
    let errors = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&errors);
    session
        .on_error(move |report| sink.borrow_mut().push(report.clone()))
        .unwrap();
    errors
}

fn message(text: &str) -> TransportEvent {
    TransportEvent::Message(text.to_string())
}

#[tokio::test]
async fn new_document_is_created_with_skeleton() {
    LocalSet::new()
        .run_until(async {
            let wire = Rc::new(Recorder::default());
            let session = ConnectionSession::new(wire.clone(), quiet());
            session.dispatch(&TransportEvent::Open);

            let document = session.open_document("test", false);
            let events = Rc::new(RefCell::new(Vec::new()));
            let log = Rc::clone(&events);
            document
                .on_new_document(move |reason| log.borrow_mut().push(reason.to_string()))
                .unwrap();
            let log = Rc::clone(&events);
            document
                .on_update(move |html| log.borrow_mut().push(html.to_string()), None)
                .unwrap();

            document.connect();
            assert!(wire.sent.borrow().is_empty());

            session.dispatch(&message(INIT));
            assert_eq!(
                wire.sent_json(),
                vec![json!({"a": "s", "c": "webstrates", "d": "test"})]
            );

            session.dispatch(&message(
                r#"{"a":"s","c":"webstrates","d":"test","data":{"v":0,"type":null}}"#,
            ));
            assert_eq!(
                *events.borrow(),
                vec![
                    NEW_DOCUMENT_REASON.to_string(),
                    "<html><body></body></html>".to_string(),
                ]
            );

            let sent = wire.sent_json();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[1]["seq"], json!(1));
            assert_eq!(
                sent[1]["create"]["type"],
                json!("http://sharejs.org/types/JSONv0")
            );

            session.dispatch(&message(
                r#"{"a":"op","c":"webstrates","d":"test","v":0,"src":"me","seq":1}"#,
            ));
            let sent = wire.sent_json();
            assert_eq!(sent.len(), 3);
            assert_eq!(sent[2]["v"], json!(1));
            assert_eq!(
                sent[2]["op"],
                json!([{"p": [], "oi": ["html", {}, ["body", {}]]}])
            );
        })
        .await;
}

#[tokio::test]
async fn keep_alive_pings_until_closed() {
    LocalSet::new()
        .run_until(async {
            let wire = Rc::new(Recorder::default());
            let session = ConnectionSession::new(
                wire.clone(),
                ConnectionOptions {
                    keep_alive_timeout: Duration::ZERO,
                    auto_connect: true,
                },
            );
            session.dispatch(&TransportEvent::Open);

            timeout(Duration::from_secs(5), async {
                while wire.keep_alives() < 5 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .unwrap();

            session.close().unwrap();
            let after_close = wire.keep_alives();
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(wire.keep_alives(), after_close);
        })
        .await;
}

#[tokio::test]
async fn script_entities_survive_update() {
    LocalSet::new()
        .run_until(async {
            let wire = Rc::new(Recorder::default());
            let session = ConnectionSession::new(wire.clone(), quiet());
            session.dispatch(&TransportEvent::Open);
            session.dispatch(&message(INIT));

            let document = session.open_document("test", false);
            let rendered = Rc::new(RefCell::new(String::new()));
            let slot = Rc::clone(&rendered);
            document
                .on_update_op(move |html| *slot.borrow_mut() = html.to_string(), None)
                .unwrap();
            document.connect();
            session.dispatch(&message(
                r#"{"a":"s","c":"webstrates","d":"test","data":{"v":3,"type":"http://sharejs.org/types/JSONv0","data":["html",{},["body",{}]]}}"#,
            ));

            let html = "<html><head><script>if (a&b) { run(); }</script></head>\
                        <body>x &amp; y</body></html>";
            let outcome = document.update(html, true).unwrap();
            assert!(matches!(outcome, UpdateOutcome::Submitted(_)));
            assert_eq!(
                *rendered.borrow(),
                "<html><head><script>if (a&b) { run(); }</script></head>\
                 <body>x &amp; y</body></html>"
            );

            assert_eq!(document.update(html, true).unwrap(), UpdateOutcome::Unchanged);
        })
        .await;
}

#[tokio::test]
async fn control_messages_are_filtered() {
    LocalSet::new()
        .run_until(async {
            let wire = Rc::new(Recorder::default());
            let session = ConnectionSession::new(wire.clone(), quiet());
            let errors = record_errors(&session);
            session.dispatch(&TransportEvent::Open);
            session.dispatch(&message(INIT));

            session.dispatch(&message(r#"{"wa":"hello","id":"x"}"#));
            session.dispatch(&message(r#"{"type":"alive"}"#));
            assert!(errors.borrow().is_empty());

            session.dispatch(&message(r#"{"foo":1}"#));
            assert_eq!(errors.borrow().len(), 1);
            assert!(matches!(errors.borrow()[0].error, SessionError::Protocol(_)));
        })
        .await;
}

#[tokio::test]
async fn lifecycle_events_are_reported() {
    LocalSet::new()
        .run_until(async {
            let wire = Rc::new(Recorder::default());
            let session = ConnectionSession::new(wire.clone(), quiet());
            let errors = record_errors(&session);
            let connected = Rc::new(Cell::new(0));
            let disconnected = Rc::new(Cell::new(0));

            let count = Rc::clone(&connected);
            session
                .on_did_connect(move || count.set(count.get() + 1))
                .unwrap();
            let count = Rc::clone(&disconnected);
            session
                .on_did_disconnect(move || count.set(count.get() + 1))
                .unwrap();

            session.dispatch(&TransportEvent::Open);
            session.dispatch(&TransportEvent::Close);
            session.dispatch(&TransportEvent::Error("reset by peer".into()));

            assert_eq!(connected.get(), 1);
            assert_eq!(disconnected.get(), 1);
            assert_eq!(errors.borrow().len(), 1);
            assert_eq!(
                errors.borrow()[0].error,
                SessionError::TransportFault("reset by peer".into())
            );
        })
        .await;
}

/// Holds a snapshot and rejects everything but the skeleton reset.
struct Strict {
    data: RefCell<Option<Value>>,
}

impl RemoteDocument for Strict {
    fn id(&self) -> &str {
        "strict"
    }

    fn subscribe(&self, callback: webstrates_client::sharedb::SubscribeCallback) {
        callback(Ok(()));
    }

    fn on_op(&self, _listener: webstrates_client::sharedb::OpListener) {}

    fn on_error(&self, _listener: webstrates_client::sharedb::ErrorListener) {}

    fn snapshot(&self) -> Option<Value> {
        self.data.borrow().clone()
    }

    fn exists(&self) -> bool {
        true
    }

    fn create(&self) -> Result<(), SyncError> {
        Err(SyncError::AlreadyExists("strict".into()))
    }

    fn submit_op(&self, op: Op) -> Result<(), SyncError> {
        if op != skeleton_reset() {
            return Err(SyncError::Rejected {
                reason: "read only".into(),
                op,
            });
        }
        let mut data = self.data.borrow().clone().unwrap_or(Value::Null);
        apply(&mut data, &op).unwrap();
        *self.data.borrow_mut() = Some(data);
        Ok(())
    }

    fn has_pending(&self) -> bool {
        false
    }

    fn destroy(&self) {}
}

struct StrictConnection {
    document: Rc<Strict>,
}

impl SyncConnection for StrictConnection {
    fn get(&self, _collection: &str, _id: &str) -> Rc<dyn RemoteDocument> {
        self.document.clone()
    }
}

#[test]
fn rejected_diff_resets_document() {
    let document = Rc::new(Strict {
        data: RefCell::new(Some(json!(["html", {}, ["body", {}, "keep me"]]))),
    });
    let session = DocumentSession::new(
        "strict",
        Rc::new(StrictConnection {
            document: Rc::clone(&document),
        }),
    );
    let errors = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&errors);
    session
        .on_error(move |report| sink.borrow_mut().push(report.clone()))
        .unwrap();
    session.connect();

    let outcome = session
        .update("<html><body>changed</body></html>", true)
        .unwrap();

    assert_eq!(outcome, UpdateOutcome::Reset);
    assert_eq!(document.snapshot(), Some(json!(["html", {}, ["body", {}]])));
    assert_eq!(errors.borrow().len(), 1);
    assert_eq!(errors.borrow()[0].message, "Invalid document, rebuilding");
    assert!(matches!(
        &errors.borrow()[0].error,
        SessionError::DiffRejected(SyncError::Rejected { reason, .. }) if reason == "read only"
    ));
}

/// Opens "test" with `<html><body>keep me</body></html>` loaded at version 1.
fn loaded_document(
    wire: &Rc<Recorder>,
) -> (
    ConnectionSession,
    DocumentSession,
    Rc<RefCell<Vec<ErrorReport>>>,
    Rc<RefCell<String>>,
) {
    let session = ConnectionSession::new(wire.clone(), quiet());
    session.dispatch(&TransportEvent::Open);
    session.dispatch(&message(INIT));

    let document = session.open_document("test", false);
    let errors = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&errors);
    document
        .on_error(move |report| sink.borrow_mut().push(report.clone()))
        .unwrap();
    let rendered = Rc::new(RefCell::new(String::new()));
    let slot = Rc::clone(&rendered);
    document
        .on_update_op(move |html| *slot.borrow_mut() = html.to_string(), None)
        .unwrap();

    document.connect();
    session.dispatch(&message(
        r#"{"a":"s","c":"webstrates","d":"test","data":{"v":1,"type":"http://sharejs.org/types/JSONv0","data":["html",{},["body",{},"keep me"]]}}"#,
    ));
    (session, document, errors, rendered)
}

#[tokio::test]
async fn server_rejection_resets_document() {
    LocalSet::new()
        .run_until(async {
            let wire = Rc::new(Recorder::default());
            let (session, document, errors, rendered) = loaded_document(&wire);

            let html = "<html><body>changed</body></html>";
            assert!(matches!(
                document.update(html, true).unwrap(),
                UpdateOutcome::Submitted(_)
            ));
            assert_eq!(*rendered.borrow(), html);
            assert_eq!(wire.sent_json()[1]["seq"], json!(1));

            session.dispatch(&message(
                r#"{"a":"op","c":"webstrates","d":"test","src":"me","seq":1,"error":{"code":4000,"message":"stale"}}"#,
            ));

            assert_eq!(*rendered.borrow(), "<html><body></body></html>");
            assert_eq!(errors.borrow().len(), 1);
            let report = errors.borrow()[0].clone();
            assert_eq!(report.message, "Invalid document, rebuilding");
            assert_eq!(report.payload.as_deref(), Some(html));
            assert!(matches!(
                &report.error,
                SessionError::DiffRejected(SyncError::Rejected { reason, .. })
                    if reason == "stale (code 4000)"
            ));

            let sent = wire.sent_json();
            assert_eq!(sent.len(), 3);
            assert_eq!(sent[2]["seq"], json!(2));
            assert_eq!(
                sent[2]["op"],
                json!([{"p": [], "oi": ["html", {}, ["body", {}]]}])
            );
            assert!(document.has_pending());
        })
        .await;
}

#[tokio::test]
async fn rejected_reset_is_not_retried() {
    LocalSet::new()
        .run_until(async {
            let wire = Rc::new(Recorder::default());
            let (session, document, errors, _) = loaded_document(&wire);

            document
                .update("<html><body>changed</body></html>", true)
                .unwrap();
            session.dispatch(&message(
                r#"{"a":"op","c":"webstrates","d":"test","src":"me","seq":1,"error":{"code":4000,"message":"stale"}}"#,
            ));
            session.dispatch(&message(
                r#"{"a":"op","c":"webstrates","d":"test","src":"me","seq":2,"error":{"code":4000,"message":"stale"}}"#,
            ));

            assert_eq!(wire.sent_json().len(), 3);
            assert!(!document.has_pending());
            let messages: Vec<String> = errors
                .borrow()
                .iter()
                .map(|report| report.message.clone())
                .collect();
            assert_eq!(messages, vec!["Invalid document, rebuilding", "Reset rejected"]);
            assert_eq!(errors.borrow()[1].payload, None);
        })
        .await;
}

#[tokio::test]
async fn live_server_loads_document() {
    if std::env::var("WEBSTRATES_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set WEBSTRATES_INTEGRATION=1 to run");
        return;
    }

    let url = std::env::var("WEBSTRATES_URL")
        .unwrap_or_else(|_| "ws://localhost:7007/ws/".to_string());

    LocalSet::new()
        .run_until(async move {
            let (transport, mut event_loop) = WebSocketTransport::connect(&url).await.unwrap();
            let session = ConnectionSession::new(Rc::new(transport), ConnectionOptions::default());
            let document =
                session.open_document(&format!("integration-{}", std::process::id()), false);

            let loaded = Rc::new(RefCell::new(None));
            let slot = Rc::clone(&loaded);
            document
                .on_update(move |html| *slot.borrow_mut() = Some(html.to_string()), None)
                .unwrap();
            document.connect();

            timeout(Duration::from_secs(10), async {
                while loaded.borrow().is_none() {
                    match event_loop.poll().await {
                        Some(event) => session.dispatch(&event),
                        None => break,
                    }
                }
            })
            .await
            .unwrap();

            assert!(loaded.borrow().is_some());
            document.close();
            session.close().unwrap();
        })
        .await;
}
