//! Denylist screening of pattern source before it is executed.
//!
//! This is a syntactic guardrail that gives fast, readable feedback. It is
//! not a security boundary and can be bypassed by creative source; what user
//! code can actually reach is decided by the sandbox's capability table.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::{GardenLiveError, Result};

/// `(pattern, message)` pairs, checked in order.
const DENYLIST: &[(&str, &str)] = &[
    (r"\bfetch\s*\(", "Network requests (fetch) are not allowed"),
    (r"\bimport\s*\(", "Dynamic imports are not allowed"),
    (r"\beval\s*\(", "eval() is not allowed"),
    (r"\bnew\s+Function\b|\bFunction\s*\(", "Function constructor is not allowed"),
    (r"\bnew\s+(?:Shared)?Worker\b|\bWorker\s*\(", "Web Workers are not allowed"),
    (r"\b(?:localStorage|sessionStorage|indexedDB)\b", "Storage access is not allowed"),
    (r"\b(?:document|window|globalThis|self\.)", "DOM and global object access is not allowed"),
    (r"\bXMLHttpRequest\b", "XMLHttpRequest is not allowed"),
    (r"\bWebSocket\b", "WebSocket connections are not allowed"),
];

static RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    DENYLIST
        .iter()
        .map(|(pattern, message)| (Regex::new(pattern).expect("denylist pattern"), *message))
        .collect()
});

/// Outcome of screening a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationResult {
    Safe,
    Rejected { reason: &'static str },
}

impl ValidationResult {
    pub fn is_safe(&self) -> bool {
        matches!(self, ValidationResult::Safe)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            ValidationResult::Safe => Ok(()),
            ValidationResult::Rejected { reason } => {
                Err(GardenLiveError::Validation(reason.to_string()))
            }
        }
    }
}

/// Returns the message of the first denylist entry that matches `source`.
pub fn validate(source: &str) -> ValidationResult {
    RULES
        .iter()
        .find(|(pattern, _)| pattern.is_match(source))
        .map(|(_, reason)| ValidationResult::Rejected { reason: *reason })
        .unwrap_or(ValidationResult::Safe)
}
