//! Reply confidence classification.
//!
//! The system prompt instructs the model to open with the escalation marker
//! when it cannot answer on its own. This module detects and strips that
//! marker from raw completions.

/// A classified completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// Reply text with the marker removed.
    pub content: String,
    /// The model asked for a human to take over.
    pub requires_human: bool,
}

impl Classified {
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Classify a raw completion against the configured marker.
///
/// Matching is case-insensitive and tolerates a trailing colon and
/// whitespace after the marker.
pub fn classify(raw: &str, marker: &str) -> Classified {
    let trimmed = raw.trim();
    let marker = marker.trim();
    if marker.is_empty() {
        return Classified {
            content: trimmed.to_string(),
            requires_human: false,
        };
    }

    // Byte-wise comparison: a matching prefix guarantees the slice below
    // lands on a char boundary even when the reply itself is non-ASCII.
    let starts_with_marker = trimmed.len() >= marker.len()
        && trimmed.as_bytes()[..marker.len()].eq_ignore_ascii_case(marker.as_bytes());
    if !starts_with_marker {
        return Classified {
            content: trimmed.to_string(),
            requires_human: false,
        };
    }

    let mut rest = &trimmed[marker.len()..];
    rest = rest.trim_start();
    rest = rest.strip_prefix(':').unwrap_or(rest);
    Classified {
        content: rest.trim().to_string(),
        requires_human: true,
    }
}
