//! Share-token codec.
//!
//! A token is the JSON record `{v, html, css, js, runtime, importMap, tailwindCdn}`
//! compressed with LZ-String and written in its URI-component alphabet, so it
//! can sit in a URL fragment untouched. Decoding walks an additive migration
//! chain: each schema version only ever adds one optional field on top of the
//! previous version's read path.

use crate::snapshot::{ActiveTab, ProjectSnapshot, RuntimeMode};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Schema version written by [`encode`].
pub const CURRENT_SCHEMA_VERSION: u64 = 4;

/// Fragment prefix carrying a share token: `#code=<token>`.
pub const FRAGMENT_PREFIX: &str = "#code=";

/// Why a token was rejected. Public decoding collapses all of these to `None`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("token is empty")]
    Empty,
    #[error("token does not decompress")]
    Decompress,
    #[error("decompressed payload is not valid UTF-16")]
    Utf16,
    #[error("payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("unknown schema version: {0}")]
    UnknownVersion(String),
    #[error("field '{0}' is missing or not a string")]
    MissingSource(&'static str),
}

type MigrationStep = fn(&Map<String, Value>, &mut ProjectSnapshot);

/// Optional-field reads, keyed by the schema version that introduced them.
///
/// Version 1 only carried `html`/`css`/`js`, which every version requires.
/// A new schema version appends one entry here and bumps
/// [`CURRENT_SCHEMA_VERSION`].
const MIGRATIONS: &[(u64, MigrationStep)] = &[
    (2, read_runtime),
    (3, read_import_map),
    (4, read_utility_css_cdn),
];

fn read_runtime(record: &Map<String, Value>, snapshot: &mut ProjectSnapshot) {
    snapshot.runtime_mode = RuntimeMode::from_token_value(record.get("runtime"));
}

fn read_import_map(record: &Map<String, Value>, snapshot: &mut ProjectSnapshot) {
    if let Some(Value::String(import_map)) = record.get("importMap") {
        snapshot.import_map = import_map.clone();
    }
}

fn read_utility_css_cdn(record: &Map<String, Value>, snapshot: &mut ProjectSnapshot) {
    snapshot.enable_utility_css_cdn = record.get("tailwindCdn").is_some_and(is_truthy);
}

/// JavaScript `Boolean(value)` for a JSON value.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Encode a snapshot as a URL-fragment-safe token. Never fails.
pub fn encode(snapshot: &ProjectSnapshot) -> String {
    let record = json!({
        "v": CURRENT_SCHEMA_VERSION,
        "html": snapshot.html,
        "css": snapshot.css,
        "js": snapshot.js,
        "runtime": snapshot.runtime_mode.token_name(),
        "importMap": snapshot.import_map,
        "tailwindCdn": snapshot.enable_utility_css_cdn,
    });
    lz_str::compress_to_encoded_uri_component(record.to_string().as_str())
}

/// Decode a token, migrating older schema versions to the current shape.
///
/// Returns `None` for anything that is not a token this codec (at any schema
/// version) could have produced.
pub fn decode(token: &str) -> Option<ProjectSnapshot> {
    match try_decode(token) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            tracing::debug!(error = %e, "rejected share token");
            None
        }
    }
}

/// Like [`decode`], but reports why a token was rejected.
pub fn try_decode(token: &str) -> Result<ProjectSnapshot, DecodeError> {
    if token.is_empty() {
        return Err(DecodeError::Empty);
    }
    let wide = lz_str::decompress_from_encoded_uri_component(token).ok_or(DecodeError::Decompress)?;
    let text = String::from_utf16(&wide).map_err(|_| DecodeError::Utf16)?;
    if text.is_empty() {
        return Err(DecodeError::Decompress);
    }

    let value: Value = serde_json::from_str(&text)?;
    let Value::Object(record) = value else {
        return Err(DecodeError::NotAnObject);
    };
    let version = schema_version(&record)?;

    let mut snapshot = ProjectSnapshot::new(
        source_field(&record, "html")?,
        source_field(&record, "css")?,
        source_field(&record, "js")?,
    );
    for (introduced, step) in MIGRATIONS {
        if version >= *introduced {
            step(&record, &mut snapshot);
        }
    }

    // Derived fields never travel in the token.
    snapshot.auto_run = true;
    snapshot.active_tab = ActiveTab::for_mode(snapshot.runtime_mode);
    Ok(snapshot)
}

fn schema_version(record: &Map<String, Value>) -> Result<u64, DecodeError> {
    let raw = record.get("v");
    let version = raw.and_then(|v| match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        _ => None,
    });
    match version {
        Some(v) if (1..=CURRENT_SCHEMA_VERSION).contains(&v) => Ok(v),
        _ => Err(DecodeError::UnknownVersion(
            raw.map(Value::to_string).unwrap_or_else(|| "missing".to_string()),
        )),
    }
}

fn source_field(record: &Map<String, Value>, name: &'static str) -> Result<String, DecodeError> {
    match record.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(DecodeError::MissingSource(name)),
    }
}

/// `#code=<token>` for a snapshot.
pub fn share_fragment(snapshot: &ProjectSnapshot) -> String {
    format!("{}{}", FRAGMENT_PREFIX, encode(snapshot))
}

/// Share URL: `base` with its fragment (if any) replaced by the share fragment.
pub fn share_url(base: &str, snapshot: &ProjectSnapshot) -> String {
    let without_fragment = base.split('#').next().unwrap_or(base);
    format!("{}{}", without_fragment, share_fragment(snapshot))
}

/// Token carried by a fragment of exactly the form `#code=<token>`.
pub fn token_from_fragment(fragment: &str) -> Option<&str> {
    let token = fragment.strip_prefix(FRAGMENT_PREFIX)?;
    if token.is_empty() || token.contains('&') {
        return None;
    }
    Some(token)
}

/// Snapshot shared through a URL fragment, if the fragment carries one.
pub fn snapshot_from_fragment(fragment: &str) -> Option<ProjectSnapshot> {
    token_from_fragment(fragment).and_then(decode)
}
