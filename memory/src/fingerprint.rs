//! Failure fingerprints
//!
//! A fingerprint keeps only what identifies an error across runs: its type,
//! its message with volatile details masked, and the file it was seen in.
//! Timestamps and raw tool output never take part.

use regex::Regex;
use std::sync::OnceLock;

use veritas_core::ExecutionFailure;
use veritas_databases::FingerprintFields;

struct Masks {
    workspace: Option<Regex>,
    hex: Option<Regex>,
    digits: Option<Regex>,
    whitespace: Option<Regex>,
}

fn masks() -> &'static Masks {
    static MASKS: OnceLock<Masks> = OnceLock::new();
    MASKS.get_or_init(|| Masks {
        workspace: Regex::new(r"\S*veritas-unit-[A-Za-z0-9_]+").ok(),
        hex: Regex::new(r"0x[0-9a-f]+").ok(),
        digits: Regex::new(r"[0-9]+").ok(),
        whitespace: Regex::new(r"\s+").ok(),
    })
}

/// Lowercase `message` and mask scratch paths, addresses and numbers
pub fn normalize_message(message: &str) -> String {
    let masks = masks();
    let mut text = message.trim().to_lowercase();

    let replacements = [
        (&masks.workspace, "<workspace>"),
        (&masks.hex, "0x?"),
        (&masks.digits, "0"),
        (&masks.whitespace, " "),
    ];
    for (pattern, replacement) in replacements {
        if let Some(pattern) = pattern {
            text = pattern.replace_all(&text, replacement).into_owned();
        }
    }
    text
}

pub fn fingerprint(failure: &ExecutionFailure) -> FingerprintFields {
    FingerprintFields {
        failure_type: failure.failure_type,
        normalized_message: normalize_message(&failure.message),
        file_path: failure.context.file_path.to_string_lossy().into_owned(),
    }
}
