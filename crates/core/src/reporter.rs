//! Error reporting channel
//!
//! Every condition the update machinery detects is funneled through one
//! [`ErrorReporter`] call so that an installed handler sees a consistent
//! stream. The default reporter logs through `tracing`.

use crate::error::{Error, ErrorCode};
use crate::limits::MAX_ERROR_INSERTS;
use parking_lot::Mutex;
use std::sync::Arc;

/// Receiver of container error reports
pub trait ErrorReporter: Send + Sync {
    /// Report a condition with up to five string inserts
    fn report(&self, code: ErrorCode, inserts: &[&str]);
}

/// Report a condition and build the error returned to the caller
pub fn raise(reporter: &dyn ErrorReporter, code: ErrorCode, inserts: &[&str]) -> Error {
    let inserts = &inserts[..inserts.len().min(MAX_ERROR_INSERTS)];
    reporter.report(code, inserts);
    Error::Container {
        code,
        message: code.format(inserts),
    }
}

/// Reporter that logs every report at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, code: ErrorCode, inserts: &[&str]) {
        let inserts = &inserts[..inserts.len().min(MAX_ERROR_INSERTS)];
        tracing::error!(target: "bento::error", code = %code, "{}", code.format(inserts));
    }
}

/// A report captured by [`CollectingReporter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Reported code
    pub code: ErrorCode,
    /// Inserts, already truncated to the maximum count
    pub inserts: Vec<String>,
}

/// Reporter that keeps every report in memory
///
/// Clones share the same report list, so a test can keep one handle while
/// the container owns another.
#[derive(Debug, Default, Clone)]
pub struct CollectingReporter {
    reports: Arc<Mutex<Vec<Report>>>,
}

impl CollectingReporter {
    /// Create an empty collecting reporter
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all reports so far
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    /// Codes of all reports so far, in order
    pub fn codes(&self) -> Vec<ErrorCode> {
        self.reports().into_iter().map(|r| r.code).collect()
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, code: ErrorCode, inserts: &[&str]) {
        let report = Report {
            code,
            inserts: inserts
                .iter()
                .take(MAX_ERROR_INSERTS)
                .map(|s| s.to_string())
                .collect(),
        };
        self.reports.lock().push(report);
    }
}
