//! Host side of the sandbox bridge.
//!
//! [`HostBridge`] is the single sequential handler for every cross-context
//! message. It owns the console log and the virtual storage state, so nothing
//! else can mutate them concurrently. Messages from a discarded document can
//! still arrive late; documents synthesized through [`HostBridge::prepare_run`]
//! stamp their messages with a run id and stale ones are dropped.

use crate::document::Synthesizer;
use crate::protocol::{parse_envelope, BridgeMessage, ConsoleEntry, ConsoleLevel, Envelope};
use crate::snapshot::ProjectSnapshot;
use crate::storage::{DurableStore, StorageScope, VirtualStorageState};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// What handling one raw message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEffect {
    /// Not a well-formed bridge message; nothing changed.
    Ignored,
    /// Stamped with a run id other than the current one; nothing changed.
    Stale,
    /// A console entry was appended.
    Logged,
    /// Virtual storage changed in this scope and was persisted.
    StorageApplied(StorageScope),
}

pub struct HostBridge {
    console: Vec<ConsoleEntry>,
    storage: VirtualStorageState,
    store: Box<dyn DurableStore>,
    run_id: u64,
}

impl HostBridge {
    /// Bridge seeded with whatever virtual storage `store` holds.
    pub fn new(store: Box<dyn DurableStore>) -> Self {
        let storage = VirtualStorageState::load(store.as_ref());
        Self {
            console: Vec::new(),
            storage,
            store,
            run_id: 0,
        }
    }

    /// Append-only console log for the current run.
    pub fn console(&self) -> &[ConsoleEntry] {
        &self.console
    }

    pub fn storage(&self) -> &VirtualStorageState {
        &self.storage
    }

    /// Id of the current run; 0 before the first run starts.
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Start a new run: the previous document is discarded along with its log.
    pub fn begin_run(&mut self) -> u64 {
        self.run_id += 1;
        self.console.clear();
        tracing::debug!(run_id = self.run_id, "begin preview run");
        self.run_id
    }

    /// Begin a run and synthesize its document, seeded from current storage.
    pub fn prepare_run(&mut self, synthesizer: &Synthesizer, snapshot: &ProjectSnapshot) -> String {
        let run_id = self.begin_run();
        synthesizer.synthesize_run(snapshot, &self.storage, run_id)
    }

    /// Handle a message delivered as JSON text.
    pub fn handle_json(&mut self, text: &str) -> BridgeEffect {
        match serde_json::from_str::<Value>(text) {
            Ok(raw) => self.handle_incoming(&raw),
            Err(_) => BridgeEffect::Ignored,
        }
    }

    /// Handle one raw cross-context message. Never panics on hostile input.
    pub fn handle_incoming(&mut self, raw: &Value) -> BridgeEffect {
        let Some(Envelope { run_id, message }) = parse_envelope(raw) else {
            tracing::debug!("ignored non-bridge message");
            return BridgeEffect::Ignored;
        };
        if run_id.is_some_and(|id| id != self.run_id) {
            tracing::debug!(message_run = ?run_id, current_run = self.run_id, "dropped stale bridge message");
            return BridgeEffect::Stale;
        }

        match message {
            BridgeMessage::Console { level, args, timestamp } => {
                self.log(level, args, timestamp);
                BridgeEffect::Logged
            }
            BridgeMessage::RuntimeError { kind, message, stack } => {
                let mut args = vec![Value::String(message)];
                if let Some(stack) = stack {
                    args.push(Value::String(stack));
                }
                tracing::debug!(kind = kind.wire_type(), "sandbox runtime error");
                self.log(ConsoleLevel::Error, args, None);
                BridgeEffect::Logged
            }
            BridgeMessage::StorageMutation { scope, operation } => {
                self.storage.apply(scope, operation);
                self.storage.persist(self.store.as_ref());
                BridgeEffect::StorageApplied(scope)
            }
        }
    }

    fn log(&mut self, level: ConsoleLevel, args: Vec<Value>, timestamp: Option<u64>) {
        self.console.push(ConsoleEntry {
            id: uuid::Uuid::new_v4().to_string(),
            level,
            timestamp: timestamp.unwrap_or_else(now_millis),
            args,
        });
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
