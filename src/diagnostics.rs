//! Non-fatal warnings collected while an operation runs.
//!
//! Cache and credential-store failures never abort an operation; they are recorded here,
//! logged, and returned next to the operation's result.
//!
//! Each operation runs inside [`Diagnostics::scope`] with a sink of its own. Components
//! that outlive a single operation, such as a cached session, call [`Diagnostics::report`],
//! which records into the sink of the operation currently running on the task.

use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::warn;

tokio::task_local! {
    static OPERATION: Diagnostics;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
}

/// Shared sink of diagnostics. Cloning shares the same underlying list.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    entries: Arc<Mutex<Vec<Diagnostic>>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning and emit it through `tracing`.
    pub fn warn(&self, summary: impl Into<String>, detail: impl Into<String>) {
        let diagnostic = Diagnostic {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
        };
        warn!(summary = %diagnostic.summary, detail = %diagnostic.detail, "Diagnostic recorded");
        // A poisoned lock only means another thread panicked mid-push
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(diagnostic);
    }

    /// Record a warning into the sink of the running operation, or into `self` when the
    /// task is not inside [`Diagnostics::scope`].
    pub fn report(&self, summary: impl Into<String>, detail: impl Into<String>) {
        match Self::current() {
            Some(operation) => operation.warn(summary, detail),
            None => self.warn(summary, detail),
        }
    }

    /// Run `future` with `self` as the sink of the running operation.
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        OPERATION.scope(self.clone(), future).await
    }

    /// Sink of the operation running on this task, if any.
    pub fn current() -> Option<Diagnostics> {
        OPERATION.try_with(Diagnostics::clone).ok()
    }

    /// Append diagnostics recorded elsewhere.
    pub fn extend(&self, diagnostics: Vec<Diagnostic>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.extend(diagnostics);
    }

    /// Remove and return everything recorded so far.
    pub fn drain(&self) -> Vec<Diagnostic> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *entries)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
