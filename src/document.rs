//! Preview document synthesis.
//!
//! Turns a [`ProjectSnapshot`] plus the current virtual storage into one
//! self-contained document for an isolated frame. Synthesis is a pure function
//! of its inputs and never fails on user content: a bad import map is dropped
//! and reported to the sandboxed console instead.
//!
//! Document order:
//! 1. import map (if any, and valid)
//! 2. utility-CSS loader (if enabled)
//! 3. user CSS in a `<style>` container
//! 4. user HTML
//! 5. telemetry shim
//! 6. storage shim
//! 7. user runtime (vanilla or jsx)

use crate::snapshot::{ProjectSnapshot, RuntimeMode};
use crate::storage::VirtualStorageState;

const TELEMETRY_SHIM: &str = include_str!("shims/telemetry.js");
const STORAGE_SHIM: &str = include_str!("shims/storage.js");
const JSX_RUNTIME: &str = include_str!("shims/jsx.js");

/// Knobs for the parts of the document that do not come from the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthConfig {
    /// `lang` attribute of the root element
    pub lang: String,
    /// Script URL of the utility-CSS loader
    pub utility_css_url: String,
    /// Script URL of the in-browser JSX transform toolchain
    pub transform_url: String,
    /// Module specifier of the component framework (resolved via import map)
    pub framework_module: String,
    /// Module specifier exposing `createRoot`
    pub dom_module: String,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            lang: String::from("en"),
            utility_css_url: String::from("https://cdn.tailwindcss.com"),
            transform_url: String::from("https://unpkg.com/@babel/standalone/babel.min.js"),
            framework_module: String::from("react"),
            dom_module: String::from("react-dom/client"),
        }
    }
}

/// Synthesize a document with the default configuration and no run id.
pub fn synthesize(snapshot: &ProjectSnapshot, storage_seed: &VirtualStorageState) -> String {
    Synthesizer::default().synthesize(snapshot, storage_seed)
}

/// Builds preview documents for one [`SynthConfig`].
#[derive(Debug, Clone, Default)]
pub struct Synthesizer {
    config: SynthConfig,
}

impl Synthesizer {
    pub fn new(config: SynthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SynthConfig {
        &self.config
    }

    /// Document whose messages carry no run id.
    pub fn synthesize(&self, snapshot: &ProjectSnapshot, storage_seed: &VirtualStorageState) -> String {
        self.build(snapshot, storage_seed, None)
    }

    /// Document whose shims stamp every message with `run_id`.
    pub fn synthesize_run(
        &self,
        snapshot: &ProjectSnapshot,
        storage_seed: &VirtualStorageState,
        run_id: u64,
    ) -> String {
        self.build(snapshot, storage_seed, Some(run_id))
    }

    fn build(&self, snapshot: &ProjectSnapshot, storage_seed: &VirtualStorageState, run_id: Option<u64>) -> String {
        let mut warnings: Vec<String> = Vec::new();
        let run_id_literal = run_id.map_or_else(|| "null".to_string(), |id| id.to_string());

        let mut doc = String::with_capacity(
            snapshot.html.len() + snapshot.css.len() + snapshot.js.len() + 8 * 1024,
        );
        doc.push_str("<!doctype html>\n");
        doc.push_str(&format!("<html lang=\"{}\">\n", escape_attribute(&self.config.lang)));
        doc.push_str("  <head>\n");
        doc.push_str("    <meta charset=\"utf-8\" />\n");
        doc.push_str("    <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\" />\n");

        match normalize_import_map(&snapshot.import_map) {
            Ok(map) if map.is_empty() => {}
            Ok(map) => {
                doc.push_str("    <script type=\"importmap\">");
                doc.push_str(&escape_end_tag(&map, "script").replace("<!--", "\\u003c!--"));
                doc.push_str("</script>\n");
            }
            Err(e) => warnings.push(format!("import map is not valid JSON and was ignored: {}", e)),
        }

        if snapshot.enable_utility_css_cdn {
            doc.push_str(&format!(
                "    <script src=\"{}\"></script>\n",
                escape_attribute(&self.config.utility_css_url)
            ));
        }

        doc.push_str("    <style>");
        doc.push_str(&escape_end_tag(&snapshot.css, "style"));
        doc.push_str("</style>\n");
        doc.push_str("  </head>\n");
        doc.push_str("  <body>\n");

        doc.push_str(&snapshot.html);
        doc.push('\n');

        let telemetry = TELEMETRY_SHIM
            .replace("__RUN_ID__", &run_id_literal)
            .replace("__QUEUED_WARNINGS__", &script_json(&warnings));
        push_script(&mut doc, None, &telemetry);

        let storage = STORAGE_SHIM
            .replace("__RUN_ID__", &run_id_literal)
            .replace("__STORAGE_SEED__", &script_json(&storage_seed.seed_json()));
        push_script(&mut doc, None, &storage);

        match snapshot.runtime_mode {
            RuntimeMode::Vanilla => {
                let guarded = format!(
                    "try {{\n{}\n}} catch (e) {{\n  console.error(e);\n}}",
                    snapshot.js
                );
                push_script(&mut doc, Some("module"), &escape_script_text(&guarded));
            }
            RuntimeMode::Jsx => {
                doc.push_str(&format!(
                    "    <script src=\"{}\" crossorigin></script>\n",
                    escape_attribute(&self.config.transform_url)
                ));
                // User source goes in last so its text is never scanned for placeholders.
                let runtime = JSX_RUNTIME
                    .replace("__FRAMEWORK_MODULE__", &script_json(&self.config.framework_module))
                    .replace("__DOM_MODULE__", &script_json(&self.config.dom_module))
                    .replace("__USER_SOURCE__", &script_json(&snapshot.js));
                push_script(&mut doc, Some("module"), &runtime);
            }
        }

        doc.push_str("  </body>\n");
        doc.push_str("</html>\n");
        doc
    }
}

fn push_script(doc: &mut String, kind: Option<&str>, body: &str) {
    match kind {
        Some(kind) => doc.push_str(&format!("    <script type=\"{}\">\n", kind)),
        None => doc.push_str("    <script>\n"),
    }
    doc.push_str(body);
    if !body.ends_with('\n') {
        doc.push('\n');
    }
    doc.push_str("    </script>\n");
}

/// Validate and pretty-print import-map JSON.
///
/// Blank input normalizes to an empty string. Returns the parser's message on
/// invalid JSON.
pub fn normalize_import_map(source: &str) -> Result<String, String> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&value).map_err(|e| e.to_string())
}

/// Break every `</tag` (ASCII case-insensitive) as `<\/tag`, so embedded text
/// cannot close its raw-text container.
pub fn escape_end_tag(text: &str, tag: &str) -> String {
    let needle_len = 2 + tag.len();
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut i = 0;
    while i + needle_len <= bytes.len() {
        if bytes[i] == b'<'
            && bytes[i + 1] == b'/'
            && bytes[i + 2..i + needle_len].eq_ignore_ascii_case(tag.as_bytes())
        {
            out.push_str(&text[last..i + 1]);
            out.push('\\');
            last = i + 1;
            i += needle_len;
        } else {
            i += 1;
        }
    }
    out.push_str(&text[last..]);
    out
}

/// Script text that can neither close its element nor open an HTML comment
/// (`<!--` followed by `<script` would swallow the closing tag).
fn escape_script_text(text: &str) -> String {
    escape_end_tag(text, "script").replace("<!--", "<\\!--")
}

/// Writing `<` as `\u003c` keeps JSON inert inside a script element. `<` only
/// ever occurs inside JSON strings, where the escape means the same character.
fn escape_json_for_script(json: &str) -> String {
    json.replace('<', "\\u003c")
}

/// A value as a JS literal safe to place inside a script element.
fn script_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    let json = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    escape_json_for_script(&json)
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageOperation, StorageScope};

    fn basic() -> ProjectSnapshot {
        ProjectSnapshot::new("<p>x</p>", "p { color: red }", "console.log(1)")
    }

    /// Text between the first `<style>` and the first `</style` after it.
    fn style_body(doc: &str) -> &str {
        let start = doc.find("<style>").unwrap() + "<style>".len();
        let end = start + doc[start..].to_ascii_lowercase().find("</style").unwrap();
        &doc[start..end]
    }

    #[test]
    fn test_synthesis_is_pure() {
        let mut seed = VirtualStorageState::default();
        seed.apply(StorageScope::Local, StorageOperation::Set { key: "k".into(), value: "v".into() });
        let snapshot = basic().with_import_map(r#"{"imports":{"a":"https://x/a.js"}}"#);
        assert_eq!(synthesize(&snapshot, &seed), synthesize(&snapshot, &seed));

        let jsx = ProjectSnapshot::jsx_starter();
        let synth = Synthesizer::default();
        assert_eq!(synth.synthesize_run(&jsx, &seed, 3), synth.synthesize_run(&jsx, &seed, 3));
    }

    #[test]
    fn test_section_order() {
        let snapshot = basic()
            .with_import_map(r#"{"imports":{}}"#)
            .with_utility_css_cdn(true);
        let doc = synthesize(&snapshot, &VirtualStorageState::default());
        let positions = [
            doc.find("type=\"importmap\"").unwrap(),
            doc.find("cdn.tailwindcss.com").unwrap(),
            doc.find("<style>").unwrap(),
            doc.find("<p>x</p>").unwrap(),
            doc.find("addEventListener('unhandledrejection'").unwrap(),
            doc.find("defineGlobal('localStorage'").unwrap(),
            doc.find("<script type=\"module\">").unwrap(),
        ];
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
    }

    #[test]
    fn test_optional_directives_absent_by_default() {
        let doc = synthesize(&basic(), &VirtualStorageState::default());
        assert!(!doc.contains("importmap"));
        assert!(!doc.contains("cdn.tailwindcss.com"));
        assert!(!doc.contains("babel"));
    }

    #[test]
    fn test_style_containment() {
        let css = "a{}</style><script>alert(1)</script></STYLE x><p>";
        let plain = synthesize(&basic(), &VirtualStorageState::default());
        let hostile = synthesize(
            &ProjectSnapshot::new("<p>x</p>", css, "console.log(1)"),
            &VirtualStorageState::default(),
        );
        assert_eq!(style_body(&hostile), escape_end_tag(css, "style"));

        // Everything outside the style container is unchanged.
        let outside = |doc: &str| {
            let body = style_body(doc);
            doc.replacen(body, "", 1)
        };
        assert_eq!(outside(&plain), outside(&hostile));
    }

    #[test]
    fn test_escape_end_tag() {
        assert_eq!(escape_end_tag("</style>", "style"), "<\\/style>");
        assert_eq!(escape_end_tag("</StYlE", "style"), "<\\/StYlE");
        assert_eq!(escape_end_tag("a</scrip", "script"), "a</scrip");
        assert_eq!(escape_end_tag("x</script></script>", "script"), "x<\\/script><\\/script>");
        assert_eq!(escape_end_tag("é</style", "style"), "é<\\/style");
    }

    #[test]
    fn test_invalid_import_map_degrades() {
        let snapshot = basic().with_import_map("{not json");
        let doc = synthesize(&snapshot, &VirtualStorageState::default());
        assert!(!doc.contains("type=\"importmap\""));
        assert!(doc.contains("import map is not valid JSON"));
        assert!(doc.contains("<p>x</p>"));
        assert!(doc.contains("p { color: red }"));
        assert!(doc.contains("console.log(1)"));
    }

    #[test]
    fn test_import_map_is_normalized() {
        assert_eq!(normalize_import_map("   ").unwrap(), "");
        assert_eq!(
            normalize_import_map(r#"{"imports":{"a":"b"}}"#).unwrap(),
            "{\n  \"imports\": {\n    \"a\": \"b\"\n  }\n}"
        );
        assert!(normalize_import_map("{").is_err());
    }

    #[test]
    fn test_import_map_cannot_close_script() {
        let snapshot = basic().with_import_map(r#"{"imports":{"x":"</script><b>"}}"#);
        let doc = synthesize(&snapshot, &VirtualStorageState::default());
        assert!(doc.contains(r#""x": "<\/script><b>""#));
    }

    #[test]
    fn test_vanilla_script_is_guarded_and_escaped() {
        let snapshot = ProjectSnapshot::new("", "", "const s = '</script>';\nthrow new Error('x')");
        let doc = synthesize(&snapshot, &VirtualStorageState::default());
        assert!(doc.contains("try {\nconst s = '<\\/script>';\nthrow new Error('x')\n} catch (e) {"));
    }

    #[test]
    fn test_user_js_is_not_reindented() {
        let js = "const t = `line1\nline2`;";
        let doc = synthesize(&ProjectSnapshot::new("", "", js), &VirtualStorageState::default());
        assert!(doc.contains(js));
    }

    #[test]
    fn test_seed_is_embedded_inert() {
        let mut seed = VirtualStorageState::default();
        seed.apply(
            StorageScope::Session,
            StorageOperation::Set { key: "k".into(), value: "</script><img>".into() },
        );
        let doc = synthesize(&basic(), &seed);
        assert!(doc.contains(
            r#"JSON.parse("{\"localStorage\":{},\"sessionStorage\":{\"k\":\"\u003c/script>\u003cimg>\"}}")"#
        ));
    }

    #[test]
    fn test_seed_keeps_proto_key() {
        let mut seed = VirtualStorageState::default();
        seed.apply(
            StorageScope::Local,
            StorageOperation::Set { key: "__proto__".into(), value: "b".into() },
        );
        let doc = synthesize(&basic(), &seed);
        // Parsed at runtime, never evaluated as an object literal.
        assert!(doc.contains(r#"JSON.parse("{\"localStorage\":{\"__proto__\":\"b\"},\"sessionStorage\":{}}")"#));
        assert!(!doc.contains(r#"{"localStorage":{"__proto__""#));
    }

    #[test]
    fn test_comment_open_cannot_swallow_closing_tag() {
        let snapshot = ProjectSnapshot::new("", "", "const s = '<!--<script>';\nconsole.log(s)");
        let doc = synthesize(&snapshot, &VirtualStorageState::default());
        assert!(doc.contains("const s = '<\\!--<script>';"));
        assert!(!doc.contains("<!--<script>"));

        let snapshot = basic().with_import_map(r#"{"imports":{"x":"<!--<script>"}}"#);
        let doc = synthesize(&snapshot, &VirtualStorageState::default());
        assert!(doc.contains(r#""x": "\u003c!--<script>""#));
    }

    #[test]
    fn test_run_id_stamp() {
        let synth = Synthesizer::default();
        let seed = VirtualStorageState::default();
        assert!(synth.synthesize(&basic(), &seed).contains("var RUN_ID = null;"));
        assert!(synth.synthesize_run(&basic(), &seed, 42).contains("var RUN_ID = 42;"));
    }

    #[test]
    fn test_jsx_runtime_embeds_source_as_literal() {
        let snapshot = ProjectSnapshot::new(
            "",
            "",
            "export default () => <p>__FRAMEWORK_MODULE__ </script></p>",
        )
        .with_runtime_mode(RuntimeMode::Jsx);
        let doc = synthesize(&snapshot, &VirtualStorageState::default());
        assert!(doc.contains("babel.min.js"));
        assert!(doc.contains(
            r#"window.Babel.transform("export default () => \u003cp>__FRAMEWORK_MODULE__ \u003c/script>\u003c/p>""#
        ));
        assert!(doc.contains("await import(\"react\")"));
        assert!(doc.contains("await import(\"react-dom/client\")"));
        assert!(doc.contains("!root.hasChildNodes()"));
    }

    #[test]
    fn test_config_overrides() {
        let synth = Synthesizer::new(SynthConfig {
            lang: "zh-CN".into(),
            utility_css_url: "https://cdn.example/tw.js?a=1&b=2".into(),
            ..SynthConfig::default()
        });
        let doc = synth.synthesize(&basic().with_utility_css_cdn(true), &VirtualStorageState::default());
        assert!(doc.contains("<html lang=\"zh-CN\">"));
        assert!(doc.contains("src=\"https://cdn.example/tw.js?a=1&amp;b=2\""));
    }
}
