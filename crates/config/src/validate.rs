//! Semantic checks on a parsed configuration.

use crate::schema::CourierConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "sending.poll_interval_ms"
    pub path: &'static str,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: &'static str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path,
            message: message.into(),
        });
    }
}

/// Check the timing values for combinations a delivery queue cannot run with.
#[must_use]
pub fn validate(config: &CourierConfig) -> ValidationResult {
    let mut result = ValidationResult::default();
    let s = &config.sending;

    if s.poll_interval_ms == 0 {
        result.push(
            Severity::Error,
            "sending.poll_interval_ms",
            "must be greater than zero",
        );
    }
    if s.block_retry_window_ms < s.poll_interval_ms {
        result.push(
            Severity::Error,
            "sending.block_retry_window_ms",
            format!(
                "{}ms is shorter than one poll interval ({}ms)",
                s.block_retry_window_ms, s.poll_interval_ms
            ),
        );
    }
    if s.cache_ttl_secs == 0 {
        result.push(
            Severity::Error,
            "sending.cache_ttl_secs",
            "must be greater than zero",
        );
    }
    if s.sweep_interval_secs == 0 {
        result.push(
            Severity::Error,
            "sending.sweep_interval_secs",
            "must be greater than zero",
        );
    } else if s.sweep_interval_secs > s.cache_ttl_secs {
        result.push(
            Severity::Warning,
            "sending.sweep_interval_secs",
            "sweeps run less often than queues expire; idle queues linger past their ttl",
        );
    }
    if s.stop_timeout_secs == 0 {
        result.push(
            Severity::Warning,
            "sending.stop_timeout_secs",
            "a zero stop timeout never waits for pending items",
        );
    }

    result
}
