//! # Preview Sandbox
//!
//! The execution bridge of a live HTML/CSS/JS playground: user code runs in
//! an isolated frame and never in the host page's security context.
//!
//! ## Components
//!
//! - **Snapshot codec** ([`codec`]): versioned, compressed, URL-fragment-safe
//!   share tokens, decoding every schema version ever emitted.
//! - **Document synthesizer** ([`document`]): one self-contained document per
//!   run, with telemetry and storage shims around the user's code.
//! - **Bridge** ([`protocol`], [`bridge`]): the message contract the shims
//!   speak, and the host-side handler that applies it to the console log and
//!   the virtual storage.
//! - **Headless runner** ([`runtime`]): executes a synthesized document in a
//!   V8 isolate with the same bridge, for tests and CLI runs.
//!
//! ## Isolation Guarantees
//!
//! - **User content is never trusted markup for the host**: it is only ever
//!   embedded into the sandboxed document.
//! - **No storage authority**: sandboxed code sees in-memory stores seeded by
//!   the host; mutations come back as messages the host chooses to apply.
//! - **Strict parsing**: anything that is not a well-formed bridge message
//!   is dropped without side effects.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use preview_sandbox::{codec, HostBridge, MemoryStore, ProjectSnapshot, Synthesizer};
//!
//! let snapshot = ProjectSnapshot::new("<p>x</p>", "", "console.log(1)");
//! let mut bridge = HostBridge::new(Box::new(MemoryStore::new()));
//!
//! // Load this into a frame with `sandbox="allow-scripts"`.
//! let document = bridge.prepare_run(&Synthesizer::default(), &snapshot);
//!
//! // Feed every `message` event from the frame to the bridge.
//! bridge.handle_json(r#"{"isBridgeMessage":true,"type":"console","payload":{"level":"log","args":[1]}}"#);
//!
//! let url = codec::share_url("https://play.example/", &snapshot);
//! ```

pub mod bridge;
pub mod codec;
pub mod document;
pub mod protocol;
pub mod runtime;
mod sanitize;
pub mod scripts;
pub mod snapshot;
pub mod storage;

pub use bridge::{BridgeEffect, HostBridge};
pub use codec::{decode, encode, share_fragment, share_url, snapshot_from_fragment, DecodeError};
pub use document::{normalize_import_map, synthesize, SynthConfig, Synthesizer};
pub use protocol::{BridgeMessage, ConsoleEntry, ConsoleLevel, RuntimeErrorKind};
pub use runtime::{
    create_runtime, run_document, run_project, ConsoleOutput, RunOutcome, RunReport, RunnerConfig,
};
pub use snapshot::{ActiveTab, ProjectSnapshot, RuntimeMode};
pub use storage::{
    DurableStore, FileStore, MemoryStore, StorageOperation, StorageScope, StoreError,
    VirtualStorageState,
};
