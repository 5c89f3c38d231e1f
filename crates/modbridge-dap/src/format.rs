//! Rendering of target values for the client.

use std::fmt::Write as _;

use modbridge_wire::wire::Value;

/// Type tag the target reports for string values.
const STRING_TYPE: &str = "string";

/// Marker appended to truncated strings.
const ELLIPSIS: char = '…';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueFormatter {
    pub max_string_len: usize,
}

impl Default for ValueFormatter {
    fn default() -> Self {
        Self {
            max_string_len: 1_000,
        }
    }
}

impl ValueFormatter {
    pub fn new(max_string_len: usize) -> Self {
        Self {
            max_string_len: max_string_len.max(1),
        }
    }

    /// The text shown for `value`. Strings are quoted, escaped and truncated;
    /// everything else is shown as the target rendered it.
    pub fn render(&self, value: &Value) -> String {
        if value.type_name == STRING_TYPE {
            self.quote(&value.value)
        } else {
            value.value.clone()
        }
    }

    fn quote(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len().min(self.max_string_len) + 2);
        out.push('"');
        for (count, ch) in text.chars().enumerate() {
            if count == self.max_string_len {
                out.push(ELLIPSIS);
                break;
            }
            match ch {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if c.is_control() => {
                    let _ = write!(out, "\\{}", c as u32);
                }
                c => out.push(c),
            }
        }
        out.push('"');
        out
    }
}
