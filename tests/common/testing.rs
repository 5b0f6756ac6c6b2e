#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use faultline::audit::{
    AuditStore, FailureAnalysisRow, FailureAnalytics, InteractionRecord, MemoryAuditStore,
    MetricHealth, PersistenceError, RecoveryAttempt, RecoveryStatus, SystemMetric,
};
use faultline::backend::{CompletionBackend, CompletionError};
use faultline::scenario::FailureScenario;
use faultline::session::SessionState;

/// Which genuine fault the scripted backend raises on every call.
#[derive(Debug, Clone, Copy)]
pub enum ScriptedFault {
    Timeout,
    RateLimited,
    Unavailable,
}

/// Backend that never answers: every call fails with the scripted fault.
/// Used to prove genuine faults and injected failures stay distinguishable.
#[derive(Debug, Clone, Copy)]
pub struct FailingBackend {
    pub fault: ScriptedFault,
}

impl FailingBackend {
    pub fn new(fault: ScriptedFault) -> Self {
        Self { fault }
    }
}

#[async_trait]
impl CompletionBackend for FailingBackend {
    async fn complete(
        &self,
        _session: &SessionState,
        _message: &str,
        _model: &str,
    ) -> Result<String, CompletionError> {
        Err(match self.fault {
            ScriptedFault::Timeout => CompletionError::Timeout {
                message: "upstream 30s deadline elapsed".into(),
            },
            ScriptedFault::RateLimited => CompletionError::RateLimited {
                message: "429 from upstream".into(),
            },
            ScriptedFault::Unavailable => CompletionError::Unavailable {
                message: "connection refused".into(),
            },
        })
    }
}

/// Audit store whose interaction writes can be switched off mid-test. Reads
/// and every other write delegate to a real in-memory store, so a test can
/// flip the switch and observe how the pipeline reacts to a write outage.
#[derive(Default)]
pub struct FailingAuditStore {
    inner: MemoryAuditStore,
    fail_writes: AtomicBool,
}

impl FailingAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditStore for FailingAuditStore {
    async fn record_interaction(
        &self,
        record: &InteractionRecord,
    ) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::backend("simulated audit outage"));
        }
        self.inner.record_interaction(record).await
    }

    async fn get_interaction(
        &self,
        id: &str,
    ) -> Result<Option<InteractionRecord>, PersistenceError> {
        self.inner.get_interaction(id).await
    }

    async fn session_history(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<InteractionRecord>, PersistenceError> {
        self.inner.session_history(session_id, limit).await
    }

    async fn failure_analytics(
        &self,
        window_hours: u32,
    ) -> Result<FailureAnalytics, PersistenceError> {
        self.inner.failure_analytics(window_hours).await
    }

    async fn failure_analysis(&self) -> Result<Vec<FailureAnalysisRow>, PersistenceError> {
        self.inner.failure_analysis().await
    }

    async fn count_attempts(&self, interaction_id: &str) -> Result<u32, PersistenceError> {
        self.inner.count_attempts(interaction_id).await
    }

    async fn insert_attempt(&self, attempt: &RecoveryAttempt) -> Result<(), PersistenceError> {
        self.inner.insert_attempt(attempt).await
    }

    async fn recovery_status(
        &self,
        interaction_id: &str,
    ) -> Result<RecoveryStatus, PersistenceError> {
        self.inner.recovery_status(interaction_id).await
    }

    async fn record_metric(&self, metric: &SystemMetric) -> Result<(), PersistenceError> {
        self.inner.record_metric(metric).await
    }

    async fn system_health(
        &self,
        window_hours: u32,
    ) -> Result<Vec<MetricHealth>, PersistenceError> {
        self.inner.system_health(window_hours).await
    }

    async fn save_scenario(&self, scenario: &FailureScenario) -> Result<(), PersistenceError> {
        self.inner.save_scenario(scenario).await
    }

    async fn load_scenarios(&self) -> Result<Vec<FailureScenario>, PersistenceError> {
        self.inner.load_scenarios().await
    }
}
