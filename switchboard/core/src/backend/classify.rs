//! Retryable / fatal error classification
//!
//! Transport signals win over message text: a timeout or a status code is
//! decisive, and message patterns only classify errors without either.
//! Among the patterns, fatal ones are checked first. An error matching
//! neither list is `Unknown`, which escalates like a
//! retryable failure so an unfamiliar provider message never aborts a
//! request outright.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::traits::{BackendError, ErrorKind};

/// Configurable pattern lists (case-insensitive regexes) and status codes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPatterns {
    /// Messages that should trigger escalation
    pub retryable: Vec<String>,
    /// Messages that should abort the request
    pub fatal: Vec<String>,
    /// Status codes that should trigger escalation
    pub retryable_status: Vec<u16>,
    /// Status codes that should abort the request
    pub fatal_status: Vec<u16>,
}

impl Default for ErrorPatterns {
    fn default() -> Self {
        let strings = |list: &[&str]| list.iter().map(ToString::to_string).collect();
        Self {
            retryable: strings(&[
                "rate limit",
                "quota",
                "model.*unavailable",
                "timeout",
                "temporary",
                r"\b503\b",
                r"\b429\b",
            ]),
            fatal: strings(&[
                "authentication",
                "invalid.*api.*key",
                "forbidden",
                r"\b40[13]\b",
            ]),
            retryable_status: vec![408, 429, 500, 502, 503, 504],
            fatal_status: vec![401, 403],
        }
    }
}

/// Compiled classifier
#[derive(Clone, Debug)]
pub struct ErrorClassifier {
    retryable: Vec<Regex>,
    fatal: Vec<Regex>,
    retryable_status: Vec<u16>,
    fatal_status: Vec<u16>,
}

impl ErrorClassifier {
    /// Compile the pattern lists
    ///
    /// # Errors
    ///
    /// Returns the first pattern that fails to compile.
    pub fn new(patterns: &ErrorPatterns) -> Result<Self, regex::Error> {
        Ok(Self {
            retryable: compile(&patterns.retryable)?,
            fatal: compile(&patterns.fatal)?,
            retryable_status: patterns.retryable_status.clone(),
            fatal_status: patterns.fatal_status.clone(),
        })
    }

    /// Classify a backend failure
    #[must_use]
    pub fn classify(&self, error: &BackendError) -> ErrorKind {
        if error.timed_out {
            return ErrorKind::Retryable;
        }
        if let Some(status) = error.status {
            if self.fatal_status.contains(&status) {
                return ErrorKind::Fatal;
            }
            if self.retryable_status.contains(&status) {
                return ErrorKind::Retryable;
            }
        }

        let text = error.to_string();
        if self.fatal.iter().any(|re| re.is_match(&text)) {
            return ErrorKind::Fatal;
        }
        if self.retryable.iter().any(|re| re.is_match(&text)) {
            return ErrorKind::Retryable;
        }

        tracing::debug!(error = %text, "Unrecognized backend error");
        ErrorKind::Unknown
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        let patterns = ErrorPatterns::default();
        Self {
            retryable: compile(&patterns.retryable).unwrap_or_default(),
            fatal: compile(&patterns.fatal).unwrap_or_default(),
            retryable_status: patterns.retryable_status,
            fatal_status: patterns.fatal_status,
        }
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
    patterns
        .iter()
        .map(|p| RegexBuilder::new(p).case_insensitive(true).build())
        .collect()
}
