/*!
Interaction recording with a caller-enforced write deadline.

[`InteractionRecorder`] sits between the harness and the audit store. The one
rule it exists to enforce: a write that does not complete inside the deadline
is a persistence failure that must fail the whole request — a response with
no audit record behind it never leaves the pipeline.
*/

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::audit::{
    AuditStore, FailureAnalysisRow, FailureAnalytics, InteractionRecord, PersistenceError,
};

/// Append-only recording facade over the audit store.
#[derive(Clone)]
pub struct InteractionRecorder {
    store: Arc<dyn AuditStore>,
    op_timeout: Duration,
}

impl InteractionRecorder {
    pub fn new(store: Arc<dyn AuditStore>, op_timeout: Duration) -> Self {
        Self { store, op_timeout }
    }

    /// Appends `record` under the write deadline and returns its id.
    ///
    /// Records are write-once; there is nothing to update or delete later.
    #[instrument(skip(self, record), err)]
    pub async fn record(&self, record: &InteractionRecord) -> Result<String, PersistenceError> {
        debug_assert!(
            record.is_consistent(),
            "failure_mode, injection_applied, and natural_response must agree"
        );
        match tokio::time::timeout(self.op_timeout, self.store.record_interaction(record)).await {
            Ok(result) => {
                result?;
                Ok(record.id.clone())
            }
            Err(_) => Err(PersistenceError::Timeout {
                timeout_ms: self.op_timeout.as_millis() as u64,
            }),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<InteractionRecord>, PersistenceError> {
        self.store.get_interaction(id).await
    }

    /// Most recent interactions for a session, newest first.
    pub async fn session_history(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<InteractionRecord>, PersistenceError> {
        self.store.session_history(session_id, limit).await
    }

    /// Failure counts, status distribution, and latency over the trailing
    /// window.
    pub async fn failure_analytics(
        &self,
        window_hours: u32,
    ) -> Result<FailureAnalytics, PersistenceError> {
        self.store.failure_analytics(window_hours).await
    }

    /// Per session/mode failure view joined with recovery outcomes.
    pub async fn failure_analysis(&self) -> Result<Vec<FailureAnalysisRow>, PersistenceError> {
        self.store.failure_analysis().await
    }
}
