//! Inline script extraction for the headless runner.
//!
//! A deliberately small scanner, not an HTML parser: it finds `<script>`
//! elements the way a browser's tokenizer would for well-formed documents,
//! skipping comments and the raw-text/RCDATA elements whose contents can
//! never start a script.

/// How a script element executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptKind {
    /// Classic script, run in global scope when encountered.
    Classic,
    /// Module script, deferred until classic scripts have run.
    Module,
}

/// One executable script found in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptBlock {
    Inline { kind: ScriptKind, source: String },
    External { kind: ScriptKind, src: String },
}

/// Elements whose contents are never parsed for tags.
const OPAQUE_ELEMENTS: &[&str] = &["style", "textarea", "title", "xmp", "noscript"];

/// Executable scripts of `document`, in document order.
///
/// Non-JavaScript script types (import maps, templates) are left out.
pub fn extract_scripts(document: &str) -> Vec<ScriptBlock> {
    let lower = document.to_ascii_lowercase();
    let mut scripts = Vec::new();
    let mut pos = 0;

    while let Some(offset) = lower[pos..].find('<') {
        let start = pos + offset;
        let rest = &lower[start..];

        if rest.starts_with("<!--") {
            pos = match rest.find("-->") {
                Some(end) => start + end + 3,
                None => break,
            };
            continue;
        }

        let Some(name) = tag_name(rest) else {
            pos = start + 1;
            continue;
        };
        let Some(tag_end) = find_tag_end(&lower, start) else {
            break;
        };

        if name == "script" {
            let attributes = &document[start + 1 + name.len()..tag_end];
            let body_start = tag_end + 1;
            let body_end = lower[body_start..]
                .find("</script")
                .map_or(document.len(), |i| body_start + i);
            if let Some(kind) = script_kind(attributes) {
                let block = match attribute(attributes, "src") {
                    Some(src) => ScriptBlock::External { kind, src },
                    None => ScriptBlock::Inline {
                        kind,
                        source: document[body_start..body_end].to_string(),
                    },
                };
                scripts.push(block);
            }
            pos = skip_end_tag(&lower, body_end);
        } else if OPAQUE_ELEMENTS.contains(&name) {
            let body_start = tag_end + 1;
            let closing = format!("</{}", name);
            pos = match lower[body_start..].find(&closing) {
                Some(i) => skip_end_tag(&lower, body_start + i),
                None => document.len(),
            };
        } else {
            pos = tag_end + 1;
        }
    }

    scripts
}

/// Lowercased name of a start tag at the beginning of `rest`, if it is one.
fn tag_name(rest: &str) -> Option<&str> {
    let name_end = rest[1..]
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '-')
        .map_or(rest.len(), |i| i + 1);
    let name = &rest[1..name_end];
    if name.is_empty() || !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return None;
    }
    Some(name)
}

/// Index of the `>` closing the tag opened at `start`, honouring quoted values.
fn find_tag_end(lower: &str, start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in lower.as_bytes().iter().enumerate().skip(start + 1) {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"') | (None, b'\'') => quote = Some(b),
            (None, b'>') => return Some(i),
            _ => {}
        }
    }
    None
}

/// Position just past the `>` of an end tag starting at `at`.
fn skip_end_tag(lower: &str, at: usize) -> usize {
    lower[at..].find('>').map_or(lower.len(), |i| at + i + 1)
}

fn script_kind(attributes: &str) -> Option<ScriptKind> {
    match attribute(attributes, "type").map(|t| t.trim().to_ascii_lowercase()) {
        None => Some(ScriptKind::Classic),
        Some(t) if t.is_empty() || t == "text/javascript" || t == "application/javascript" => {
            Some(ScriptKind::Classic)
        }
        Some(t) if t == "module" => Some(ScriptKind::Module),
        Some(_) => None,
    }
}

/// Value of attribute `name` within a start tag's attribute text.
fn attribute(attributes: &str, name: &str) -> Option<String> {
    let bytes = attributes.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && (bytes[i].is_ascii_whitespace() || bytes[i] == b'/') {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && !matches!(bytes[i], b'=' | b'/') {
            i += 1;
        }
        let key = &attributes[key_start..i];
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let mut value = None;
        if i < bytes.len() && bytes[i] == b'=' {
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            if i < bytes.len() && matches!(bytes[i], b'"' | b'\'') {
                let quote = bytes[i];
                let value_start = i + 1;
                let value_end = attributes[value_start..]
                    .find(quote as char)
                    .map_or(attributes.len(), |j| value_start + j);
                value = Some(&attributes[value_start..value_end]);
                i = (value_end + 1).min(attributes.len());
            } else {
                let value_start = i;
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                value = Some(&attributes[value_start..i]);
            }
        }

        if key.is_empty() {
            i += 1;
            continue;
        }
        if key.eq_ignore_ascii_case(name) {
            return Some(value.unwrap_or("").to_string());
        }
    }
    None
}
