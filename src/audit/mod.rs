/*!
Durable audit log: every processed interaction, recovery attempt, system
metric, and a mirror of scenario definitions.

Interaction records are write-once; there is no update or delete. Analytics
(failure counts by mode, status distribution, latency, per-session failure
analysis, system health) are derived by queries over the log, never stored
redundantly.

The [`AuditStore`] trait is the storage seam; [`MemoryAuditStore`] backs tests
and demos, the SQLite implementation (behind the `sqlite` feature) shares the
pool with the state store.

A consistent record satisfies: `failure_mode` is present exactly when
`injection_applied` is true, exactly when `natural_response` is present.
Genuine backend faults show up in `natural_status` only and never set
`failure_mode`.
*/

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::scenario::FailureScenario;

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryAuditStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAuditStore;

/// Fresh audit-record id.
#[must_use]
pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

/// Outcome classification, used for both the observed and the natural side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    /// Genuine answer delivered (or would have been, on the natural side).
    Success,
    /// Degraded output substituted (hallucination, refusal, loop).
    Failure,
    /// Timed out, genuinely or synthetically.
    Timeout,
    /// Dependency or resource error.
    Error,
}

impl InteractionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "timeout" => Some(Self::Timeout),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for InteractionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One processed request, natural and observed sides both recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: String,
    pub session_id: String,
    pub request_message: String,
    /// What the caller ultimately received.
    pub response: String,
    /// The genuine answer, recorded verbatim; present iff injection occurred.
    pub natural_response: Option<String>,
    /// Winning scenario name; present iff injection occurred.
    pub failure_mode: Option<String>,
    pub injection_applied: bool,
    /// Status of the observed response.
    pub status: InteractionStatus,
    /// What genuinely happened upstream, independent of injection.
    pub natural_status: InteractionStatus,
    pub processing_time_ms: u64,
    pub token_count: u32,
    pub model_used: String,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl InteractionRecord {
    /// Whether the injection fields agree: mode, flag, and natural response
    /// are all present or all absent together.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.failure_mode.is_some() == self.injection_applied
            && self.injection_applied == self.natural_response.is_some()
    }
}

/// One recovery attempt against a recorded interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub id: String,
    pub interaction_id: String,
    pub strategy: String,
    /// 1 + count of prior attempts for the interaction at insert time.
    pub attempt_number: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate recovery outcome for one interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStatus {
    pub interaction_id: String,
    pub attempts: u32,
    pub recovered: bool,
    /// Strategy of the first successful attempt, when one exists.
    pub successful_strategy: Option<String>,
}

/// Generic recorded measurement feeding the system-health view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetric {
    pub id: String,
    pub metric_type: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    pub exceeded_threshold: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl SystemMetric {
    /// Measurement stamped now; `exceeded_threshold` is fixed at record time.
    #[must_use]
    pub fn new(metric_type: impl Into<String>, value: f64, threshold: Option<f64>) -> Self {
        Self {
            id: new_record_id(),
            metric_type: metric_type.into(),
            value,
            threshold,
            exceeded_threshold: threshold.is_some_and(|t| value > t),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Failure counts and latency over a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureAnalytics {
    pub time_range_hours: u32,
    pub total_interactions: u64,
    /// Injected-failure counts keyed by mode.
    pub failure_counts: BTreeMap<String, u64>,
    /// Observed-status counts keyed by status string.
    pub status_distribution: BTreeMap<String, u64>,
    pub average_processing_time_ms: f64,
}

/// Per session/mode derived view: how often a mode fired and how recovery went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureAnalysisRow {
    pub session_id: String,
    pub failure_mode: String,
    pub occurrences: u64,
    pub average_processing_time_ms: f64,
    /// Whether any attempt against any of these interactions succeeded.
    pub recovered: bool,
    /// Mean attempt count over interactions that did recover.
    pub average_attempts_to_recovery: Option<f64>,
}

/// Per metric type derived view over a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricHealth {
    pub metric_type: String,
    pub samples: u64,
    pub average: f64,
    pub max: f64,
    pub threshold_violations: u64,
}

/// Errors from the audit store. Any of these fails the whole request: no
/// response may be returned without its audit record.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("audit store unreachable: {message}")]
    #[diagnostic(
        code(faultline::audit::backend),
        help("Check the durable store (connection string, file permissions, disk space).")
    )]
    Backend { message: String },

    #[error("audit write exceeded its {timeout_ms}ms deadline")]
    #[diagnostic(
        code(faultline::audit::timeout),
        help("The store is up but slow; raise the persistence timeout or investigate load.")
    )]
    Timeout { timeout_ms: u64 },

    #[error("audit codec failure: {source}")]
    #[diagnostic(code(faultline::audit::serde))]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

impl PersistenceError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Storage seam for the audit log.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Appends a write-once interaction record.
    async fn record_interaction(&self, record: &InteractionRecord)
        -> Result<(), PersistenceError>;

    async fn get_interaction(&self, id: &str)
        -> Result<Option<InteractionRecord>, PersistenceError>;

    /// Most recent interactions for a session, newest first.
    async fn session_history(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<InteractionRecord>, PersistenceError>;

    /// Failure counts, status distribution, and latency over the trailing
    /// `window_hours`.
    async fn failure_analytics(&self, window_hours: u32)
        -> Result<FailureAnalytics, PersistenceError>;

    /// Per session/mode failure analysis joined with recovery outcomes.
    async fn failure_analysis(&self) -> Result<Vec<FailureAnalysisRow>, PersistenceError>;

    /// Count of recorded attempts for an interaction.
    async fn count_attempts(&self, interaction_id: &str) -> Result<u32, PersistenceError>;

    /// Appends a recovery attempt.
    async fn insert_attempt(&self, attempt: &RecoveryAttempt) -> Result<(), PersistenceError>;

    /// Aggregate recovery outcome for one interaction.
    async fn recovery_status(&self, interaction_id: &str)
        -> Result<RecoveryStatus, PersistenceError>;

    /// Appends a system metric sample.
    async fn record_metric(&self, metric: &SystemMetric) -> Result<(), PersistenceError>;

    /// Per metric type aggregates over the trailing `window_hours`.
    async fn system_health(&self, window_hours: u32)
        -> Result<Vec<MetricHealth>, PersistenceError>;

    /// Upserts the durable mirror of a scenario definition.
    async fn save_scenario(&self, scenario: &FailureScenario) -> Result<(), PersistenceError>;

    /// Reads back every mirrored scenario definition.
    async fn load_scenarios(&self) -> Result<Vec<FailureScenario>, PersistenceError>;
}
