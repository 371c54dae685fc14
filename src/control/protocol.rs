//! Wire helpers for the control and event channels.
//!
//! Commands are JSON objects with a `type` and an optional, caller-assigned
//! `messageId`. Every command gets exactly one reply carrying `success` and,
//! when present, the echoed `messageId`; handlers never leave the renderer
//! waiting, even on failure. Events are JSON objects with a `type` and a
//! publish timestamp.

use crate::timebase::wall_clock_ns;
use serde_json::{json, Value};

/// Key carrying the caller-assigned correlation id.
pub const MESSAGE_ID_KEY: &str = "messageId";

/// A successful reply with extra fields merged in.
pub fn ok_reply(extra: Value) -> Value {
    let mut reply = json!({ "success": true });
    merge(&mut reply, extra);
    reply
}

/// A failure reply with a human-readable error.
pub fn error_reply(message: impl std::fmt::Display) -> Value {
    json!({ "success": false, "error": message.to_string() })
}

/// Echo the command's `messageId` (if any) into the reply.
pub fn attach_message_id(reply: &mut Value, command: &Value) {
    if let Some(id) = command.get(MESSAGE_ID_KEY) {
        if let Some(map) = reply.as_object_mut() {
            map.insert(MESSAGE_ID_KEY.to_string(), id.clone());
        }
    }
}

/// A broadcast event of the given kind.
pub fn event(kind: &str, extra: Value) -> Value {
    let mut message = json!({
        "type": kind,
        "timestamp_ns": wall_clock_ns(),
    });
    merge(&mut message, extra);
    message
}

fn merge(target: &mut Value, extra: Value) {
    if let (Some(target), Value::Object(extra)) = (target.as_object_mut(), extra) {
        for (k, v) in extra {
            target.insert(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_carry_success_and_extras() {
        let reply = ok_reply(json!({"parameters": {"a": 1}}));
        assert_eq!(reply["success"], true);
        assert_eq!(reply["parameters"]["a"], 1);

        let failure = error_reply("no camera selected");
        assert_eq!(failure["success"], false);
        assert_eq!(failure["error"], "no camera selected");
    }

    #[test]
    fn message_id_is_echoed_when_present() {
        let command = json!({"type": "ping", "messageId": "m-17"});
        let mut reply = ok_reply(json!({}));
        attach_message_id(&mut reply, &command);
        assert_eq!(reply["messageId"], "m-17");

        let command = json!({"type": "ping"});
        let mut reply = ok_reply(json!({}));
        attach_message_id(&mut reply, &command);
        assert!(reply.get("messageId").is_none());
    }

    #[test]
    fn events_are_typed_and_timestamped() {
        let e = event("preview_started", json!({"direction": "LR"}));
        assert_eq!(e["type"], "preview_started");
        assert_eq!(e["direction"], "LR");
        assert!(e["timestamp_ns"].as_u64().unwrap() > 0);
    }
}
