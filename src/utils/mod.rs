pub mod error;

pub use error::{Error, Result};

/// Truncates an SDP (or any long text) for log output.
pub fn preview(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
