use console::Style;
use std::env;

/// Initializes the process-wide logger from `KINTEGRITY_LOG`, defaulting to
/// `info` when unset. Mirrors the env-driven level selection the
/// scaffolding's own local logger uses, minus its progress-spinner
/// suspension (this tool has no interactive spinner to suspend).
pub fn init_logging() {
    let mut builder = env_logger::Builder::new();
    let filter = env::var("KINTEGRITY_LOG").unwrap_or_else(|_| "info".to_string());
    builder.parse_filters(&filter);
    builder.format_timestamp(None);
    let _ = builder.try_init();
}

/// Severity tag used when rendering a validation finding to the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Clean,
    Suspicious,
    Mismatch,
}

impl Severity {
    fn style(self) -> Style {
        match self {
            Severity::Clean => Style::new().green(),
            Severity::Suspicious => Style::new().yellow(),
            Severity::Mismatch => Style::new().red().bold(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Severity::Clean => "CLEAN",
            Severity::Suspicious => "SUSPICIOUS",
            Severity::Mismatch => "MISMATCH",
        }
    }
}

/// Formats a one-line finding summary with a colored severity tag.
pub fn render_finding(severity: Severity, message: &str) -> String {
    format!("[{}] {}", severity.style().apply_to(severity.label()), message)
}

/// Formats a `±span` byte context dump as two hex lines, matching the
/// original validator's side-by-side expected/actual dumps.
pub fn render_context_dump(expected: &[u8], actual: &[u8]) -> String {
    let hex = |b: &[u8]| b.iter().map(|x| format!("{x:02x}")).collect::<Vec<_>>().join(" ");
    format!("  expected: {}\n  actual:   {}", hex(expected), hex(actual))
}
