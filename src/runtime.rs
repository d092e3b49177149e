//! Headless preview runtime - executes a synthesized preview document in a
//! sandboxed V8 isolate.
//!
//! Emulates just enough of an isolated browser frame to run the shims and the
//! user runtime:
//! - window/self/parent/document stubs, `error` and `unhandledrejection` events
//! - console (captured, not printed)
//! - atob, btoa, crypto.randomUUID
//! - parent.postMessage, routed into a [`HostBridge`]
//! - No fs, net, env, timers or module loading
//!
//! External `<script src>` directives are never fetched; they are reported as
//! skipped. Module scripts run after all classic scripts, in document order.

use crate::bridge::HostBridge;
use crate::document::Synthesizer;
use crate::scripts::{extract_scripts, ScriptBlock, ScriptKind};
use crate::snapshot::ProjectSnapshot;
use anyhow::{anyhow, Error};
use deno_core::{op2, JsRuntime, OpState, PollEventLoopOptions, RuntimeOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// Captured native console output of the sandboxed context
#[derive(Debug, Default, Clone)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

/// What a headless run did besides the bridge traffic
#[derive(Debug, Default)]
pub struct RunReport {
    /// Inline scripts executed
    pub scripts_run: usize,
    /// `src` of external scripts that were not loaded
    pub skipped_external: Vec<String>,
    /// Whether the run was cut short by the timeout
    pub timed_out: bool,
    /// Isolate failure that ended the run early, other than a timeout
    pub error: Option<String>,
    /// Native console output (what the page's own devtools would show)
    pub console: ConsoleOutput,
}

/// Result of a headless run: the bridge handed back, plus the report
pub struct RunOutcome {
    pub bridge: HostBridge,
    pub report: RunReport,
}

// ============================================================================
// Console Ops
// ============================================================================

#[op2(fast)]
fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.logs.push(msg.to_string());
    }
}

#[op2(fast)]
fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.warns.push(msg.to_string());
    }
}

#[op2(fast)]
fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.errors.push(msg.to_string());
    }
}

// ============================================================================
// Bridge Op
// ============================================================================

/// `parent.postMessage` - the one channel out of the isolate.
#[op2(fast)]
fn op_bridge_post(state: &mut OpState, #[string] message: &str) {
    if let Some(bridge) = state.try_borrow_mut::<HostBridge>() {
        bridge.handle_json(message);
    }
}

// ============================================================================
// Crypto / Encoding Ops
// ============================================================================

#[op2]
#[string]
fn op_crypto_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2]
#[string]
fn op_btoa(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    // btoa expects Latin-1, but we'll be lenient and accept UTF-8
    Ok(base64::engine::general_purpose::STANDARD.encode(data.as_bytes()))
}

#[op2]
#[string]
fn op_atob(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("Invalid UTF-8 in decoded data: {}", e))
}

deno_core::extension!(
    preview_runtime,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_bridge_post,
        op_crypto_random_uuid,
        op_btoa,
        op_atob,
    ],
    esm_entry_point = "ext:preview_runtime/bootstrap.js",
    esm = ["ext:preview_runtime/bootstrap.js" = "src/bootstrap.js"],
);

/// Configuration for the headless runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Maximum wall time for one document in milliseconds (default: 5000ms, None = unlimited)
    pub timeout_ms: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
            timeout_ms: Some(5_000),
        }
    }
}

/// Create a fresh isolate with the preview bootstrap installed
pub fn create_runtime(config: &RunnerConfig) -> JsRuntime {
    let create_params = config.max_heap_size.map(|max_bytes| {
        deno_core::v8::Isolate::create_params().heap_limits(0, max_bytes)
    });

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![preview_runtime::init_ops_and_esm()],
        create_params,
        ..Default::default()
    });

    if config.max_heap_size.is_some() {
        runtime.add_near_heap_limit_callback(|current, initial| {
            // Don't raise the limit - let V8 fail the allocation instead of crashing
            tracing::warn!(
                current_mb = current / (1024 * 1024),
                initial_mb = initial / (1024 * 1024),
                "preview isolate near heap limit"
            );
            current
        });
    }

    runtime.op_state().borrow_mut().put(ConsoleOutput::default());
    runtime
}

/// Run `document` in a fresh isolate, delivering its bridge messages to `bridge`.
///
/// The bridge is moved into the isolate's state for the duration of the run
/// and handed back in the outcome.
pub async fn run_document(
    document: &str,
    bridge: HostBridge,
    config: &RunnerConfig,
) -> Result<RunOutcome, Error> {
    let mut runtime = create_runtime(config);
    runtime.op_state().borrow_mut().put(bridge);

    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog = config.timeout_ms.map(|ms| {
        let isolate_handle = runtime.v8_isolate().thread_safe_handle();
        let flag = Arc::clone(&timed_out);
        let (done_tx, done_rx) = mpsc::channel::<()>();
        std::thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(Duration::from_millis(ms)) {
                flag.store(true, Ordering::SeqCst);
                isolate_handle.terminate_execution();
            }
        });
        done_tx
    });

    let mut report = RunReport::default();
    let result = execute(&mut runtime, document, &mut report).await;

    // Dropping the sender releases the watchdog without terminating.
    drop(watchdog);

    // The bridge comes back out of the isolate whatever the run did.
    let state = runtime.op_state();
    let mut state = state.borrow_mut();
    let bridge = state
        .try_take::<HostBridge>()
        .ok_or_else(|| anyhow!("host bridge missing from runtime state"))?;
    report.console = state.try_take::<ConsoleOutput>().unwrap_or_default();
    report.timed_out = timed_out.load(Ordering::SeqCst);

    if report.timed_out {
        tracing::warn!(timeout_ms = ?config.timeout_ms, "preview run timed out");
    } else if let Err(e) = result {
        tracing::warn!(error = %e, "preview run aborted");
        report.error = Some(e.to_string());
    }
    tracing::info!(
        scripts_run = report.scripts_run,
        skipped = report.skipped_external.len(),
        console_entries = bridge.console().len(),
        "preview run finished"
    );

    Ok(RunOutcome { bridge, report })
}

/// Begin a run on `bridge`, synthesize the snapshot's document and execute it.
pub async fn run_project(
    mut bridge: HostBridge,
    synthesizer: &Synthesizer,
    snapshot: &ProjectSnapshot,
    config: &RunnerConfig,
) -> Result<RunOutcome, Error> {
    let document = bridge.prepare_run(synthesizer, snapshot);
    run_document(&document, bridge, config).await
}

async fn execute(runtime: &mut JsRuntime, document: &str, report: &mut RunReport) -> Result<(), Error> {
    let mut modules = Vec::new();

    for block in extract_scripts(document) {
        match block {
            ScriptBlock::Inline { kind: ScriptKind::Classic, source } => {
                call_hook(runtime, "__previewRunClassic", &source)?;
                report.scripts_run += 1;
            }
            ScriptBlock::Inline { kind: ScriptKind::Module, source } => modules.push(source),
            ScriptBlock::External { src, .. } => {
                tracing::debug!(%src, "skipping external script");
                report.skipped_external.push(src);
            }
        }
    }
    for source in modules {
        call_hook(runtime, "__previewRunModule", &source)?;
        report.scripts_run += 1;
    }

    // Settle promises; unhandled rejections are dispatched by the bootstrap.
    runtime.run_event_loop(PollEventLoopOptions::default()).await
}

/// Call one of the bootstrap's runner hooks with a string argument.
fn call_hook(runtime: &mut JsRuntime, hook: &str, argument: &str) -> Result<(), Error> {
    let code = format!("globalThis.{}({});", hook, serde_json::to_string(argument)?);
    runtime.execute_script("<preview>", code)?;
    Ok(())
}
