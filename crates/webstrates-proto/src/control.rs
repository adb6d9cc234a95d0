//! Webstrates control messages.
//!
//! The server multiplexes its own messages onto the ShareDB socket. Any
//! message with a `wa` field, and the keep-alive ping `{"type":"alive"}`,
//! belongs to this channel.

use serde_json::{json, Value};

/// `type` value of the keep-alive ping.
pub const KEEP_ALIVE_TYPE: &str = "alive";

/// The keep-alive ping as JSON text.
#[must_use]
pub fn keep_alive() -> String {
    json!({ "type": KEEP_ALIVE_TYPE }).to_string()
}

/// Whether a decoded message is a control message.
#[must_use]
pub fn is_control(message: &Value) -> bool {
    message.get("wa").is_some()
        || message.get("type").and_then(Value::as_str) == Some(KEEP_ALIVE_TYPE)
}
