//! Preview Sandbox CLI
//!
//!   preview-sandbox synth <project.json> [--store <dir>]
//!   preview-sandbox share <project.json> [--base <url>]
//!   preview-sandbox open <token | #code=... | url>
//!   preview-sandbox run <project.json> [--store <dir>]
//!   preview-sandbox serve [--store <dir>]
//!
//! Protocol (serve mode):
//!   Request (stdin), one project per line:
//!     {"html":"<p>x</p>","css":"","js":"console.log(1)"}
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:1234
//!
//!     <!doctype html>...
//!
//!   Error response:
//!     Status:Error
//!     Length:42
//!
//!     Invalid project JSON: expected value at...

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use preview_sandbox::{
    codec, run_project, DurableStore, FileStore, HostBridge, MemoryStore, ProjectSnapshot,
    RunnerConfig, SynthConfig, Synthesizer, VirtualStorageState,
};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "preview-sandbox", version, about = "Sandboxed live-preview bridge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the preview document for a project file
    Synth {
        project: PathBuf,
        /// Directory holding persisted virtual storage (seeds the document)
        #[arg(long)]
        store: Option<PathBuf>,
        /// `lang` attribute of the generated document
        #[arg(long, default_value = "en")]
        lang: String,
    },
    /// Print the share fragment (or full URL with --base) for a project file
    Share {
        project: PathBuf,
        #[arg(long)]
        base: Option<String>,
    },
    /// Decode a share token, fragment or URL and print the project as JSON
    Open { input: String },
    /// Execute a project headlessly and print its console
    Run {
        project: PathBuf,
        /// Directory holding persisted virtual storage (read and updated)
        #[arg(long)]
        store: Option<PathBuf>,
        /// Wall-time limit in milliseconds (0 = unlimited)
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
        /// Heap limit in megabytes (0 = unlimited)
        #[arg(long, default_value_t = 64)]
        max_heap_mb: usize,
    },
    /// Persistent process: one project per stdin line, documents on stdout
    Serve {
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_project(path: &Path) -> Result<ProjectSnapshot> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| anyhow!("Invalid project JSON in '{}': {}", path.display(), e))
}

fn open_store(dir: Option<&Path>) -> Result<Box<dyn DurableStore>> {
    match dir {
        Some(dir) => Ok(Box::new(FileStore::new(dir)?)),
        None => Ok(Box::new(MemoryStore::new())),
    }
}

fn synth(project: &Path, store: Option<&Path>, lang: String) -> Result<()> {
    let snapshot = read_project(project)?;
    let store = open_store(store)?;
    let seed = VirtualStorageState::load(store.as_ref());
    let synthesizer = Synthesizer::new(SynthConfig {
        lang,
        ..Default::default()
    });
    print!("{}", synthesizer.synthesize(&snapshot, &seed));
    Ok(())
}

fn share(project: &Path, base: Option<&str>) -> Result<()> {
    let snapshot = read_project(project)?;
    match base {
        Some(base) => println!("{}", codec::share_url(base, &snapshot)),
        None => println!("{}", codec::share_fragment(&snapshot)),
    }
    Ok(())
}

fn open(input: &str) -> Result<()> {
    let input = input.trim();
    let snapshot = match input.find('#') {
        Some(hash) => codec::snapshot_from_fragment(&input[hash..]),
        None => codec::decode(input),
    };
    let snapshot = snapshot.ok_or_else(|| anyhow!("No shared project in input"))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn run(project: &Path, store: Option<&Path>, timeout_ms: u64, max_heap_mb: usize) -> Result<()> {
    let snapshot = read_project(project)?;
    let bridge = HostBridge::new(open_store(store)?);
    let config = RunnerConfig {
        max_heap_size: (max_heap_mb > 0).then(|| max_heap_mb * 1024 * 1024),
        timeout_ms: (timeout_ms > 0).then_some(timeout_ms),
    };

    let outcome = run_project(bridge, &Synthesizer::default(), &snapshot, &config).await?;

    for src in &outcome.report.skipped_external {
        eprintln!("[SKIPPED] {}", src);
    }
    for entry in outcome.bridge.console() {
        eprintln!("[{}] {}", entry.level.as_str().to_uppercase(), entry.render_args());
    }
    if let Some(error) = &outcome.report.error {
        eprintln!("[ABORTED] {}", error);
    }
    if outcome.report.timed_out {
        return Err(anyhow!("Preview timed out after {}ms", timeout_ms));
    }
    Ok(())
}

/// Run in server mode (persistent process, reads projects from stdin)
fn serve(store: Option<&Path>) -> Result<()> {
    let store = open_store(store)?;
    let synthesizer = Synthesizer::default();

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = stdin.lock();

    tracing::info!("server ready, reading from stdin");

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            // EOF - stdin closed, exit gracefully
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<ProjectSnapshot>(line) {
            Ok(snapshot) => {
                // Re-read per request: a host may have updated storage in between.
                let seed = VirtualStorageState::load(store.as_ref());
                write_response(&mut stdout, true, &synthesizer.synthesize(&snapshot, &seed))?;
            }
            Err(e) => {
                write_response(&mut stdout, false, &format!("Invalid project JSON: {}", e))?;
            }
        }
    }

    tracing::info!("server shutting down");
    Ok(())
}

/// Write response in length-prefixed protocol
fn write_response(stdout: &mut std::io::Stdout, ok: bool, body: &str) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };

    writeln!(stdout, "Status:{}", status)?;
    writeln!(stdout, "Length:{}", body.len())?;
    writeln!(stdout)?; // Empty line separator
    write!(stdout, "{}", body)?;
    stdout.flush()?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Synth { project, store, lang } => synth(&project, store.as_deref(), lang),
        Command::Share { project, base } => share(&project, base.as_deref()),
        Command::Open { input } => open(&input),
        Command::Run {
            project,
            store,
            timeout_ms,
            max_heap_mb,
        } => run(&project, store.as_deref(), timeout_ms, max_heap_mb).await,
        Command::Serve { store } => serve(store.as_deref()),
    }
}
