//! Project snapshot - the unit the host persists, shares and executes.
//!
//! Every text field is untrusted user input. Nothing here parses it; the
//! synthesizer only ever embeds it into the sandboxed document.

use serde::{Deserialize, Serialize};

/// How the user's script is turned into running code inside the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Script is embedded as-is in a guarded module block.
    #[default]
    Vanilla,
    /// Script is JSX, transformed in-context before it is imported.
    #[serde(alias = "react")]
    Jsx,
}

impl RuntimeMode {
    /// Name used in share tokens. Older tokens call jsx mode `react`.
    pub fn token_name(self) -> &'static str {
        match self {
            RuntimeMode::Vanilla => "vanilla",
            RuntimeMode::Jsx => "react",
        }
    }

    /// Reads a token `runtime` field. Anything unrecognised is vanilla.
    pub fn from_token_value(value: Option<&serde_json::Value>) -> Self {
        match value.and_then(|v| v.as_str()) {
            Some("react") | Some("jsx") => RuntimeMode::Jsx,
            _ => RuntimeMode::Vanilla,
        }
    }
}

/// Editor tab that has focus when a project is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveTab {
    #[default]
    Html,
    Css,
    Js,
}

impl ActiveTab {
    /// Jsx projects open on the script tab, everything else on markup.
    pub fn for_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::Jsx => ActiveTab::Js,
            RuntimeMode::Vanilla => ActiveTab::Html,
        }
    }
}

/// Full user-editable state of one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    pub html: String,
    pub css: String,
    pub js: String,
    #[serde(default)]
    pub runtime_mode: RuntimeMode,
    /// Raw import-map JSON source. May be empty or invalid.
    #[serde(default)]
    pub import_map: String,
    #[serde(default)]
    pub enable_utility_css_cdn: bool,
    #[serde(default = "default_auto_run")]
    pub auto_run: bool,
    #[serde(default)]
    pub active_tab: ActiveTab,
}

fn default_auto_run() -> bool {
    true
}

impl ProjectSnapshot {
    /// A vanilla project with the given sources and every other field defaulted.
    pub fn new(html: impl Into<String>, css: impl Into<String>, js: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            css: css.into(),
            js: js.into(),
            runtime_mode: RuntimeMode::Vanilla,
            import_map: String::new(),
            enable_utility_css_cdn: false,
            auto_run: true,
            active_tab: ActiveTab::Html,
        }
    }

    pub fn with_runtime_mode(mut self, mode: RuntimeMode) -> Self {
        self.runtime_mode = mode;
        self.active_tab = ActiveTab::for_mode(mode);
        self
    }

    pub fn with_import_map(mut self, import_map: impl Into<String>) -> Self {
        self.import_map = import_map.into();
        self
    }

    pub fn with_utility_css_cdn(mut self, enabled: bool) -> Self {
        self.enable_utility_css_cdn = enabled;
        self
    }

    /// Project shown when neither a share link nor a saved draft exists.
    pub fn starter() -> Self {
        Self::new(STARTER_HTML, STARTER_CSS, STARTER_JS)
    }

    /// Component starter for jsx mode, rendering into `#root`.
    pub fn jsx_starter() -> Self {
        Self::new(JSX_STARTER_HTML, STARTER_CSS, JSX_STARTER_JS).with_runtime_mode(RuntimeMode::Jsx)
    }

    /// Whether two snapshots would synthesize the same preview.
    ///
    /// Editor-only fields (`auto_run`, `active_tab`) are ignored.
    pub fn same_sources(&self, other: &ProjectSnapshot) -> bool {
        self.html == other.html
            && self.css == other.css
            && self.js == other.js
            && self.runtime_mode == other.runtime_mode
            && self.import_map == other.import_map
            && self.enable_utility_css_cdn == other.enable_utility_css_cdn
    }
}

impl Default for ProjectSnapshot {
    fn default() -> Self {
        Self::starter()
    }
}

const STARTER_HTML: &str = r#"<div class="wrap">
  <h1>preview</h1>
  <p>Edit HTML, CSS and JS; the preview updates live.</p>
  <button id="btn">Click me</button>
</div>"#;

const STARTER_CSS: &str = r#":root { color-scheme: dark; }
body { margin: 0; font-family: system-ui, -apple-system, Segoe UI, Roboto, Helvetica, Arial, sans-serif; background: #0b1020; color: #e6e6e6; }
.wrap, .card { padding: 24px; }
h1 { margin: 0 0 12px; font-size: 28px; }
button { padding: 8px 12px; border: 1px solid #2b3350; background: #151b2e; color: #e6e6e6; border-radius: 10px; cursor: pointer; }
button:hover { border-color: #5a6cff; }"#;

const STARTER_JS: &str = r#"const btn = document.querySelector('#btn');
btn?.addEventListener('click', () => {
  console.log('hello from the preview');
});"#;

const JSX_STARTER_HTML: &str = r#"<div id="root"></div>"#;

const JSX_STARTER_JS: &str = r#"export default function App() {
  const [count, setCount] = React.useState(0);
  return (
    <div className="card">
      <h1>JSX</h1>
      <button onClick={() => setCount((c) => c + 1)}>count: {count}</button>
    </div>
  );
}"#;
