//! `evaluate` request contexts and how each presents its result.

use std::time::Duration;

/// Where an `evaluate` request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalContext {
    Watch,
    Hover,
    Repl,
    Clipboard,
    Other,
}

impl EvalContext {
    pub fn from_dap_context(context: Option<&str>) -> Self {
        match context.map(str::to_ascii_lowercase).as_deref() {
            Some("watch") => Self::Watch,
            Some("hover") => Self::Hover,
            Some("repl") => Self::Repl,
            Some("clipboard") => Self::Clipboard,
            _ => Self::Other,
        }
    }

    /// The `result` string for this context. Typed into the debug console,
    /// an evaluation also reports how long the target spent on it.
    pub fn present(self, rendered: String, elapsed_ms: f64) -> String {
        match self {
            Self::Repl => format!("{rendered}\n⏱️ {elapsed_ms:.3}ms"),
            Self::Watch | Self::Hover | Self::Clipboard | Self::Other => rendered,
        }
    }
}

pub fn duration_ms(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}
