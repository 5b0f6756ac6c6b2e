/*!
Recovery attempt tracking against recorded interactions.

An attempt can only be logged for an interaction that exists in the audit
log; `attempt_number` is one plus the count of prior attempts at insert time.
The aggregate query answers the two questions callers ask: did recovery ever
succeed, and how many attempts were taken.
*/

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use crate::audit::{AuditStore, PersistenceError, RecoveryAttempt, RecoveryStatus, new_record_id};

/// Errors from recovery tracking.
#[derive(Debug, Error, Diagnostic)]
pub enum RecoveryError {
    #[error("interaction {id:?} not found in the audit log")]
    #[diagnostic(
        code(faultline::recovery::interaction_not_found),
        help("Attempts can only be logged against a recorded interaction id.")
    )]
    InteractionNotFound { id: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Tracks recovery attempts in the audit store.
#[derive(Clone)]
pub struct RecoveryTracker {
    store: Arc<dyn AuditStore>,
    op_timeout: Duration,
}

impl RecoveryTracker {
    pub fn new(store: Arc<dyn AuditStore>, op_timeout: Duration) -> Self {
        Self { store, op_timeout }
    }

    /// Logs one attempt and returns the stored row.
    #[instrument(skip(self, data, notes), err)]
    pub async fn record_attempt(
        &self,
        interaction_id: &str,
        strategy: &str,
        success: bool,
        data: Option<Value>,
        notes: Option<&str>,
    ) -> Result<RecoveryAttempt, RecoveryError> {
        self.ensure_recorded(interaction_id).await?;
        let attempt_number = self.store.count_attempts(interaction_id).await? + 1;
        let attempt = RecoveryAttempt {
            id: new_record_id(),
            interaction_id: interaction_id.to_string(),
            strategy: strategy.to_string(),
            attempt_number,
            success,
            data,
            notes: notes.map(str::to_string),
            created_at: Utc::now(),
        };
        match tokio::time::timeout(self.op_timeout, self.store.insert_attempt(&attempt)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PersistenceError::Timeout {
                    timeout_ms: self.op_timeout.as_millis() as u64,
                }
                .into());
            }
        }
        Ok(attempt)
    }

    /// Whether any attempt succeeded, and how many were taken.
    #[instrument(skip(self), err)]
    pub async fn recovery_status(
        &self,
        interaction_id: &str,
    ) -> Result<RecoveryStatus, RecoveryError> {
        self.ensure_recorded(interaction_id).await?;
        Ok(self.store.recovery_status(interaction_id).await?)
    }

    async fn ensure_recorded(&self, interaction_id: &str) -> Result<(), RecoveryError> {
        if self.store.get_interaction(interaction_id).await?.is_none() {
            return Err(RecoveryError::InteractionNotFound {
                id: interaction_id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{InteractionRecord, InteractionStatus, MemoryAuditStore};
    use serde_json::json;

    async fn store_with_interaction() -> (Arc<MemoryAuditStore>, String) {
        let store = Arc::new(MemoryAuditStore::new());
        let record = InteractionRecord {
            id: new_record_id(),
            session_id: "s1".into(),
            request_message: "q".into(),
            response: "Authentication failed: Invalid API key".into(),
            natural_response: Some("genuine".into()),
            failure_mode: Some("auth_error".into()),
            injection_applied: true,
            status: InteractionStatus::Error,
            natural_status: InteractionStatus::Success,
            processing_time_ms: 8,
            token_count: 2,
            model_used: "test-model".into(),
            metadata: json!({}),
            created_at: Utc::now(),
        };
        store.record_interaction(&record).await.unwrap();
        (store, record.id)
    }

    #[tokio::test]
    async fn attempt_numbers_count_up_from_one() {
        let (store, id) = store_with_interaction().await;
        let tracker = RecoveryTracker::new(store, Duration::from_secs(1));

        let first = tracker
            .record_attempt(&id, "retry", false, None, None)
            .await
            .unwrap();
        assert_eq!(first.attempt_number, 1);

        let second = tracker
            .record_attempt(&id, "fallback", true, Some(json!({"route": "b"})), Some("ok"))
            .await
            .unwrap();
        assert_eq!(second.attempt_number, 2);

        let status = tracker.recovery_status(&id).await.unwrap();
        assert_eq!(status.attempts, 2);
        assert!(status.recovered);
        assert_eq!(status.successful_strategy.as_deref(), Some("fallback"));
    }

    #[tokio::test]
    async fn unknown_interaction_is_rejected() {
        let (store, _) = store_with_interaction().await;
        let tracker = RecoveryTracker::new(store, Duration::from_secs(1));
        let err = tracker
            .record_attempt("no-such-id", "retry", true, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::InteractionNotFound { .. }));

        let err = tracker.recovery_status("no-such-id").await.unwrap_err();
        assert!(matches!(err, RecoveryError::InteractionNotFound { .. }));
    }
}
