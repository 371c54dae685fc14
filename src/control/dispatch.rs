//! Command dispatch.
//!
//! A plain mapping from command `type` to handler closure, built once in the
//! composition root. There is no registration machinery beyond `register`:
//! handlers close over the services they need. The dispatcher guarantees a
//! structured reply for every input: unknown types, handler errors, and
//! handler panics all produce `{success: false, error}` rather than a
//! dropped request.

use crate::control::protocol::{attach_message_id, error_reply};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, warn};

/// A command handler: command in, reply out.
pub type Handler = Box<dyn Fn(&Value) -> Value + Send + Sync>;

/// Explicit `type → handler` map.
#[derive(Default)]
pub struct CommandDispatcher {
    handlers: HashMap<&'static str, Handler>,
}

impl CommandDispatcher {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one command type.
    pub fn register(
        &mut self,
        kind: &'static str,
        handler: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) {
        self.handlers.insert(kind, Box::new(handler));
    }

    /// Registered command types (for diagnostics).
    pub fn command_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Dispatch one command and always produce a reply.
    pub fn dispatch(&self, command: &Value) -> Value {
        let kind = command.get("type").and_then(|v| v.as_str());

        let mut reply = match kind {
            None => error_reply("command has no 'type' field"),
            Some(kind) => match self.handlers.get(kind) {
                None => {
                    warn!(kind, "unknown command type");
                    error_reply(format!("unknown command type '{kind}'"))
                }
                Some(handler) => {
                    match catch_unwind(AssertUnwindSafe(|| handler(command))) {
                        Ok(reply) => reply,
                        Err(_) => {
                            error!(kind, "command handler panicked");
                            error_reply(format!("internal error handling '{kind}'"))
                        }
                    }
                }
            },
        };

        attach_message_id(&mut reply, command);
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::protocol::ok_reply;
    use serde_json::json;

    fn dispatcher() -> CommandDispatcher {
        let mut d = CommandDispatcher::new();
        d.register("ping", |_| ok_reply(json!({"pong": true})));
        d.register("boom", |_| panic!("handler exploded"));
        d
    }

    #[test]
    fn known_command_gets_handler_reply_with_message_id() {
        let d = dispatcher();
        let reply = d.dispatch(&json!({"type": "ping", "messageId": 42}));
        assert_eq!(reply["success"], true);
        assert_eq!(reply["pong"], true);
        assert_eq!(reply["messageId"], 42);
    }

    #[test]
    fn unknown_and_untyped_commands_still_reply() {
        let d = dispatcher();
        let reply = d.dispatch(&json!({"type": "warp", "messageId": "m1"}));
        assert_eq!(reply["success"], false);
        assert_eq!(reply["messageId"], "m1");

        let reply = d.dispatch(&json!({"messageId": "m2"}));
        assert_eq!(reply["success"], false);
        assert_eq!(reply["messageId"], "m2");
    }

    #[test]
    fn handler_panic_becomes_error_reply() {
        let d = dispatcher();
        let reply = d.dispatch(&json!({"type": "boom", "messageId": 7}));
        assert_eq!(reply["success"], false);
        assert_eq!(reply["messageId"], 7);
        assert!(reply["error"].as_str().unwrap().contains("boom"));
    }
}
