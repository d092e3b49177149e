//! Bridge message protocol between the sandboxed document and the host.
//!
//! Envelope: `{ isBridgeMessage: true, type, payload, runId? }`. The sandbox is
//! adversarial, so parsing never fails loudly: anything that is not an
//! envelope of a known type with a well-formed payload parses to `None`.

use crate::sanitize::check_depth;
use crate::storage::{js_string, StorageOperation, StorageScope};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Marker field every envelope carries.
pub const MARKER_FIELD: &str = "isBridgeMessage";

pub const TYPE_CONSOLE: &str = "console";
pub const TYPE_ERROR: &str = "error";
pub const TYPE_UNHANDLED_REJECTION: &str = "unhandledrejection";
pub const TYPE_STORAGE: &str = "storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl ConsoleLevel {
    pub const ALL: [ConsoleLevel; 5] = [
        ConsoleLevel::Log,
        ConsoleLevel::Info,
        ConsoleLevel::Warn,
        ConsoleLevel::Error,
        ConsoleLevel::Debug,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Debug => "debug",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.as_str() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuntimeErrorKind {
    Error,
    UnhandledRejection,
}

impl RuntimeErrorKind {
    pub fn wire_type(self) -> &'static str {
        match self {
            RuntimeErrorKind::Error => TYPE_ERROR,
            RuntimeErrorKind::UnhandledRejection => TYPE_UNHANDLED_REJECTION,
        }
    }
}

/// One message relayed out of the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    Console {
        level: ConsoleLevel,
        args: Vec<Value>,
        /// Sandbox clock, milliseconds since the epoch.
        timestamp: Option<u64>,
    },
    RuntimeError {
        kind: RuntimeErrorKind,
        message: String,
        stack: Option<String>,
    },
    StorageMutation {
        scope: StorageScope,
        operation: StorageOperation,
    },
}

/// A parsed envelope: the message plus the run it was stamped with, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub run_id: Option<u64>,
    pub message: BridgeMessage,
}

impl BridgeMessage {
    /// Wire form of this message, as the shims emit it.
    pub fn to_envelope(&self, run_id: Option<u64>) -> Value {
        let (kind, payload) = match self {
            BridgeMessage::Console { level, args, timestamp } => (
                TYPE_CONSOLE,
                json!({ "level": level.as_str(), "args": args, "timestamp": timestamp }),
            ),
            BridgeMessage::RuntimeError { kind, message, stack } => {
                (kind.wire_type(), json!({ "message": message, "stack": stack }))
            }
            BridgeMessage::StorageMutation { scope, operation } => {
                let mut payload = Map::new();
                payload.insert("scope".into(), json!(scope));
                match operation {
                    StorageOperation::Set { key, value } => {
                        payload.insert("operation".into(), json!("set"));
                        payload.insert("key".into(), json!(key));
                        payload.insert("value".into(), json!(value));
                    }
                    StorageOperation::Remove { key } => {
                        payload.insert("operation".into(), json!("remove"));
                        payload.insert("key".into(), json!(key));
                    }
                    StorageOperation::Clear => {
                        payload.insert("operation".into(), json!("clear"));
                    }
                }
                (TYPE_STORAGE, Value::Object(payload))
            }
        };
        let mut envelope = json!({ MARKER_FIELD: true, "type": kind, "payload": payload });
        if let (Some(id), Value::Object(map)) = (run_id, &mut envelope) {
            map.insert("runId".into(), json!(id));
        }
        envelope
    }
}

/// Parse a raw cross-context message. `None` means "not ours, ignore it".
pub fn parse_envelope(raw: &Value) -> Option<Envelope> {
    let Value::Object(envelope) = raw else {
        return None;
    };
    if envelope.get(MARKER_FIELD) != Some(&Value::Bool(true)) {
        return None;
    }
    check_depth(raw).ok()?;

    let kind = envelope.get("type")?.as_str()?;
    let payload = envelope.get("payload").unwrap_or(&Value::Null);
    let message = match kind {
        TYPE_CONSOLE => parse_console(payload),
        TYPE_ERROR => parse_runtime_error(RuntimeErrorKind::Error, payload),
        TYPE_UNHANDLED_REJECTION => parse_runtime_error(RuntimeErrorKind::UnhandledRejection, payload),
        TYPE_STORAGE => parse_storage(payload)?,
        // Unknown types are ignored for forward compatibility.
        _ => return None,
    };
    let run_id = envelope.get("runId").and_then(Value::as_u64);
    Some(Envelope { run_id, message })
}

/// Unknown levels read as `log`, a missing argument list as empty.
fn parse_console(payload: &Value) -> BridgeMessage {
    let level = payload
        .get("level")
        .and_then(Value::as_str)
        .and_then(ConsoleLevel::parse)
        .unwrap_or(ConsoleLevel::Log);
    let args = match payload.get("args") {
        Some(Value::Array(args)) => args.clone(),
        _ => Vec::new(),
    };
    let timestamp = payload
        .get("timestamp")
        .and_then(Value::as_f64)
        .filter(|t| t.is_finite() && *t >= 0.0)
        .map(|t| t as u64);
    BridgeMessage::Console { level, args, timestamp }
}

fn parse_runtime_error(kind: RuntimeErrorKind, payload: &Value) -> BridgeMessage {
    let message = match payload.get("message") {
        Some(Value::String(m)) => m.clone(),
        _ => match payload.get("reason") {
            Some(reason) => js_string(reason),
            None => "Script error".to_string(),
        },
    };
    let stack = payload.get("stack").and_then(Value::as_str).map(str::to_string);
    BridgeMessage::RuntimeError { kind, message, stack }
}

/// Storage payloads: `{scope, operation, key?, value?}`.
///
/// The older `{kind, action, payload: {key, value}}` shape is read too.
fn parse_storage(payload: &Value) -> Option<BridgeMessage> {
    let field = |primary: &str, legacy: &str| payload.get(primary).or_else(|| payload.get(legacy));
    let scope = StorageScope::parse(field("scope", "kind")?.as_str()?)?;
    let operation = field("operation", "action")?.as_str()?;

    let nested = payload.get("payload");
    let arg = |name: &str| payload.get(name).or_else(|| nested.and_then(|n| n.get(name)));
    let key = || arg("key").and_then(Value::as_str).map(str::to_string);

    let operation = match operation {
        "set" => StorageOperation::Set {
            key: key()?,
            value: js_string(arg("value")?),
        },
        "remove" => StorageOperation::Remove { key: key()? },
        "clear" => StorageOperation::Clear,
        _ => return None,
    };
    Some(BridgeMessage::StorageMutation { scope, operation })
}

/// Console entry kept in the host's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub id: String,
    pub level: ConsoleLevel,
    /// Milliseconds since the epoch; the sandbox's clock when it sent one.
    pub timestamp: u64,
    pub args: Vec<Value>,
}

impl ConsoleEntry {
    /// Arguments joined the way a console prints them.
    pub fn render_args(&self) -> String {
        self.args
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(kind: &str, payload: Value) -> Value {
        json!({ MARKER_FIELD: true, "type": kind, "payload": payload })
    }

    #[test]
    fn test_parse_console() {
        let raw = envelope("console", json!({ "level": "warn", "args": [1, "a"], "timestamp": 1700000000000u64 }));
        let parsed = parse_envelope(&raw).unwrap();
        assert_eq!(parsed.run_id, None);
        assert_eq!(
            parsed.message,
            BridgeMessage::Console {
                level: ConsoleLevel::Warn,
                args: vec![json!(1), json!("a")],
                timestamp: Some(1700000000000),
            }
        );
    }

    #[test]
    fn test_console_unknown_level_reads_as_log() {
        let raw = envelope("console", json!({ "level": "shout", "args": "nope" }));
        match parse_envelope(&raw).unwrap().message {
            BridgeMessage::Console { level, args, .. } => {
                assert_eq!(level, ConsoleLevel::Log);
                assert!(args.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_requires_marker() {
        let mut raw = envelope("console", json!({ "level": "log", "args": [1] }));
        raw.as_object_mut().unwrap().remove(MARKER_FIELD);
        assert!(parse_envelope(&raw).is_none());

        raw.as_object_mut().unwrap().insert(MARKER_FIELD.into(), json!("true"));
        assert!(parse_envelope(&raw).is_none());
    }

    #[test]
    fn test_ignores_non_objects_and_unknown_types() {
        assert!(parse_envelope(&json!("hello")).is_none());
        assert!(parse_envelope(&json!([1, 2])).is_none());
        assert!(parse_envelope(&Value::Null).is_none());
        assert!(parse_envelope(&envelope("telemetry", json!({}))).is_none());
        assert!(parse_envelope(&json!({ MARKER_FIELD: true, "type": 7 })).is_none());
    }

    #[test]
    fn test_parse_runtime_errors() {
        let raw = envelope("error", json!({ "message": "boom", "stack": "at x" }));
        assert_eq!(
            parse_envelope(&raw).unwrap().message,
            BridgeMessage::RuntimeError {
                kind: RuntimeErrorKind::Error,
                message: "boom".into(),
                stack: Some("at x".into()),
            }
        );

        let raw = envelope("unhandledrejection", json!({ "reason": 42 }));
        match parse_envelope(&raw).unwrap().message {
            BridgeMessage::RuntimeError { kind, message, stack } => {
                assert_eq!(kind, RuntimeErrorKind::UnhandledRejection);
                assert_eq!(message, "42");
                assert_eq!(stack, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_storage_shapes() {
        let current = envelope("storage", json!({ "scope": "local", "operation": "set", "key": "a", "value": "b" }));
        let legacy = envelope(
            "storage",
            json!({ "kind": "localStorage", "action": "set", "payload": { "key": "a", "value": "b" } }),
        );
        let expected = BridgeMessage::StorageMutation {
            scope: StorageScope::Local,
            operation: StorageOperation::Set { key: "a".into(), value: "b".into() },
        };
        assert_eq!(parse_envelope(&current).unwrap().message, expected);
        assert_eq!(parse_envelope(&legacy).unwrap().message, expected);

        let clear = envelope("storage", json!({ "scope": "session", "operation": "clear" }));
        assert_eq!(
            parse_envelope(&clear).unwrap().message,
            BridgeMessage::StorageMutation { scope: StorageScope::Session, operation: StorageOperation::Clear }
        );
    }

    #[test]
    fn test_rejects_malformed_storage() {
        for payload in [
            json!({ "kind": "localStorage", "action": "explode", "payload": { "key": "a" } }),
            json!({ "scope": "cookies", "operation": "set", "key": "a", "value": "b" }),
            json!({ "scope": "local", "operation": "set", "value": "b" }),
            json!({ "scope": "local", "operation": "set", "key": 1, "value": "b" }),
            json!({ "scope": "local", "operation": "set", "key": "a" }),
            json!({ "scope": "local", "operation": "remove" }),
            json!({ "operation": "clear" }),
            Value::Null,
        ] {
            assert!(parse_envelope(&envelope("storage", payload.clone())).is_none(), "{payload}");
        }
    }

    #[test]
    fn test_set_value_is_coerced() {
        let raw = envelope("storage", json!({ "scope": "local", "operation": "set", "key": "n", "value": 5 }));
        assert_eq!(
            parse_envelope(&raw).unwrap().message,
            BridgeMessage::StorageMutation {
                scope: StorageScope::Local,
                operation: StorageOperation::Set { key: "n".into(), value: "5".into() },
            }
        );
    }

    #[test]
    fn test_run_id_round_trip() {
        let message = BridgeMessage::StorageMutation {
            scope: StorageScope::Session,
            operation: StorageOperation::Remove { key: "k".into() },
        };
        let parsed = parse_envelope(&message.to_envelope(Some(7))).unwrap();
        assert_eq!(parsed.run_id, Some(7));
        assert_eq!(parsed.message, message);
    }

    #[test]
    fn test_rejects_deep_payloads() {
        let mut args = json!("leaf");
        for _ in 0..40 {
            args = json!([args]);
        }
        let raw = envelope("console", json!({ "level": "log", "args": [args] }));
        assert!(parse_envelope(&raw).is_none());
    }

    #[test]
    fn test_render_args() {
        let entry = ConsoleEntry {
            id: "1".into(),
            level: ConsoleLevel::Log,
            timestamp: 0,
            args: vec![json!("count:"), json!(3), json!({"a": 1})],
        };
        assert_eq!(entry.render_args(), r#"count: 3 {"a":1}"#);
    }
}
