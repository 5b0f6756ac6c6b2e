/*!
Process-local audit store. Append-only vectors behind one mutex; aggregation
queries fold over the log on demand. Backs tests and demos.
*/

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::audit::{
    AuditStore, FailureAnalysisRow, FailureAnalytics, InteractionRecord, MetricHealth,
    PersistenceError, RecoveryAttempt, RecoveryStatus, SystemMetric,
};
use crate::scenario::FailureScenario;

#[derive(Default)]
struct Log {
    interactions: Vec<InteractionRecord>,
    attempts: Vec<RecoveryAttempt>,
    metrics: Vec<SystemMetric>,
    scenarios: Vec<FailureScenario>,
}

/// In-memory [`AuditStore`].
#[derive(Default)]
pub struct MemoryAuditStore {
    inner: Mutex<Log>,
}

impl MemoryAuditStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn record_interaction(
        &self,
        record: &InteractionRecord,
    ) -> Result<(), PersistenceError> {
        let mut log = self.inner.lock().unwrap();
        log.interactions.push(record.clone());
        Ok(())
    }

    async fn get_interaction(
        &self,
        id: &str,
    ) -> Result<Option<InteractionRecord>, PersistenceError> {
        let log = self.inner.lock().unwrap();
        Ok(log.interactions.iter().find(|r| r.id == id).cloned())
    }

    async fn session_history(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<InteractionRecord>, PersistenceError> {
        let log = self.inner.lock().unwrap();
        let mut rows: Vec<InteractionRecord> = log
            .interactions
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        rows.reverse(); // insertion order is chronological; newest first
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn failure_analytics(
        &self,
        window_hours: u32,
    ) -> Result<FailureAnalytics, PersistenceError> {
        let cutoff = Utc::now() - Duration::hours(i64::from(window_hours));
        let log = self.inner.lock().unwrap();

        let mut failure_counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut status_distribution: BTreeMap<String, u64> = BTreeMap::new();
        let mut total = 0u64;
        let mut latency_sum = 0u64;
        for record in log.interactions.iter().filter(|r| r.created_at >= cutoff) {
            total += 1;
            latency_sum += record.processing_time_ms;
            if let Some(mode) = &record.failure_mode {
                *failure_counts.entry(mode.clone()).or_default() += 1;
            }
            *status_distribution
                .entry(record.status.as_str().to_string())
                .or_default() += 1;
        }
        let average_processing_time_ms = if total == 0 {
            0.0
        } else {
            latency_sum as f64 / total as f64
        };
        Ok(FailureAnalytics {
            time_range_hours: window_hours,
            total_interactions: total,
            failure_counts,
            status_distribution,
            average_processing_time_ms,
        })
    }

    async fn failure_analysis(&self) -> Result<Vec<FailureAnalysisRow>, PersistenceError> {
        let log = self.inner.lock().unwrap();

        // Group injected interactions by (session, mode).
        let mut groups: BTreeMap<(String, String), Vec<&InteractionRecord>> = BTreeMap::new();
        for record in &log.interactions {
            if let Some(mode) = &record.failure_mode {
                groups
                    .entry((record.session_id.clone(), mode.clone()))
                    .or_default()
                    .push(record);
            }
        }

        let mut rows = Vec::with_capacity(groups.len());
        for ((session_id, failure_mode), records) in groups {
            let occurrences = records.len() as u64;
            let latency_sum: u64 = records.iter().map(|r| r.processing_time_ms).sum();
            // Attempts-to-recovery per interaction: the attempt number of the
            // first successful attempt, averaged over recovered interactions.
            let mut recoveries = Vec::new();
            for record in &records {
                let first_success = log
                    .attempts
                    .iter()
                    .filter(|a| a.interaction_id == record.id && a.success)
                    .map(|a| a.attempt_number)
                    .min();
                if let Some(n) = first_success {
                    recoveries.push(n);
                }
            }
            let recovered = !recoveries.is_empty();
            let average_attempts_to_recovery = if recovered {
                Some(recoveries.iter().map(|&n| f64::from(n)).sum::<f64>() / recoveries.len() as f64)
            } else {
                None
            };
            rows.push(FailureAnalysisRow {
                session_id,
                failure_mode,
                occurrences,
                average_processing_time_ms: latency_sum as f64 / occurrences as f64,
                recovered,
                average_attempts_to_recovery,
            });
        }
        Ok(rows)
    }

    async fn count_attempts(&self, interaction_id: &str) -> Result<u32, PersistenceError> {
        let log = self.inner.lock().unwrap();
        Ok(log
            .attempts
            .iter()
            .filter(|a| a.interaction_id == interaction_id)
            .count() as u32)
    }

    async fn insert_attempt(&self, attempt: &RecoveryAttempt) -> Result<(), PersistenceError> {
        let mut log = self.inner.lock().unwrap();
        log.attempts.push(attempt.clone());
        Ok(())
    }

    async fn recovery_status(
        &self,
        interaction_id: &str,
    ) -> Result<RecoveryStatus, PersistenceError> {
        let log = self.inner.lock().unwrap();
        let mut attempts: Vec<&RecoveryAttempt> = log
            .attempts
            .iter()
            .filter(|a| a.interaction_id == interaction_id)
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        let successful_strategy = attempts
            .iter()
            .find(|a| a.success)
            .map(|a| a.strategy.clone());
        Ok(RecoveryStatus {
            interaction_id: interaction_id.to_string(),
            attempts: attempts.len() as u32,
            recovered: successful_strategy.is_some(),
            successful_strategy,
        })
    }

    async fn record_metric(&self, metric: &SystemMetric) -> Result<(), PersistenceError> {
        let mut log = self.inner.lock().unwrap();
        log.metrics.push(metric.clone());
        Ok(())
    }

    async fn system_health(
        &self,
        window_hours: u32,
    ) -> Result<Vec<MetricHealth>, PersistenceError> {
        let cutoff = Utc::now() - Duration::hours(i64::from(window_hours));
        let log = self.inner.lock().unwrap();

        let mut groups: BTreeMap<String, Vec<&SystemMetric>> = BTreeMap::new();
        for metric in log.metrics.iter().filter(|m| m.created_at >= cutoff) {
            groups.entry(metric.metric_type.clone()).or_default().push(metric);
        }
        Ok(groups
            .into_iter()
            .map(|(metric_type, samples)| {
                let count = samples.len() as u64;
                let sum: f64 = samples.iter().map(|m| m.value).sum();
                let max = samples.iter().map(|m| m.value).fold(f64::MIN, f64::max);
                let threshold_violations =
                    samples.iter().filter(|m| m.exceeded_threshold).count() as u64;
                MetricHealth {
                    metric_type,
                    samples: count,
                    average: sum / count as f64,
                    max,
                    threshold_violations,
                }
            })
            .collect())
    }

    async fn save_scenario(&self, scenario: &FailureScenario) -> Result<(), PersistenceError> {
        let mut log = self.inner.lock().unwrap();
        match log.scenarios.iter_mut().find(|s| s.name == scenario.name) {
            Some(existing) => *existing = scenario.clone(),
            None => log.scenarios.push(scenario.clone()),
        }
        Ok(())
    }

    async fn load_scenarios(&self) -> Result<Vec<FailureScenario>, PersistenceError> {
        let log = self.inner.lock().unwrap();
        Ok(log.scenarios.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{InteractionStatus, new_record_id};
    use serde_json::json;

    fn record(session: &str, mode: Option<&str>, status: InteractionStatus, ms: u64) -> InteractionRecord {
        InteractionRecord {
            id: new_record_id(),
            session_id: session.into(),
            request_message: "q".into(),
            response: "a".into(),
            natural_response: mode.map(|_| "genuine".to_string()),
            failure_mode: mode.map(str::to_string),
            injection_applied: mode.is_some(),
            status,
            natural_status: InteractionStatus::Success,
            processing_time_ms: ms,
            token_count: 4,
            model_used: "test-model".into(),
            metadata: json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_are_retrievable_and_consistent() {
        let store = MemoryAuditStore::new();
        let r = record("s1", Some("hallucination"), InteractionStatus::Failure, 12);
        assert!(r.is_consistent());
        store.record_interaction(&r).await.unwrap();
        assert_eq!(store.get_interaction(&r.id).await.unwrap(), Some(r));
        assert_eq!(store.get_interaction("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn analytics_fold_counts_statuses_and_latency() {
        let store = MemoryAuditStore::new();
        store
            .record_interaction(&record("s1", None, InteractionStatus::Success, 10))
            .await
            .unwrap();
        store
            .record_interaction(&record("s1", Some("hallucination"), InteractionStatus::Failure, 20))
            .await
            .unwrap();
        store
            .record_interaction(&record("s2", Some("hallucination"), InteractionStatus::Failure, 30))
            .await
            .unwrap();
        store
            .record_interaction(&record("s2", Some("api_timeout"), InteractionStatus::Timeout, 40))
            .await
            .unwrap();

        let analytics = store.failure_analytics(24).await.unwrap();
        assert_eq!(analytics.total_interactions, 4);
        assert_eq!(analytics.failure_counts.get("hallucination"), Some(&2));
        assert_eq!(analytics.failure_counts.get("api_timeout"), Some(&1));
        assert_eq!(analytics.status_distribution.get("success"), Some(&1));
        assert_eq!(analytics.status_distribution.get("failure"), Some(&2));
        assert_eq!(analytics.status_distribution.get("timeout"), Some(&1));
        assert_eq!(analytics.average_processing_time_ms, 25.0);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let store = MemoryAuditStore::new();
        for ms in [1, 2, 3] {
            store
                .record_interaction(&record("s1", None, InteractionStatus::Success, ms))
                .await
                .unwrap();
        }
        store
            .record_interaction(&record("other", None, InteractionStatus::Success, 9))
            .await
            .unwrap();

        let history = store.session_history("s1", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].processing_time_ms, 3);
        assert_eq!(history[1].processing_time_ms, 2);
    }

    #[tokio::test]
    async fn recovery_status_reports_first_success() {
        let store = MemoryAuditStore::new();
        let interaction = record("s1", Some("auth_error"), InteractionStatus::Error, 5);
        store.record_interaction(&interaction).await.unwrap();
        for (n, success, strategy) in [(1, false, "retry"), (2, true, "fallback"), (3, true, "retry")] {
            store
                .insert_attempt(&RecoveryAttempt {
                    id: new_record_id(),
                    interaction_id: interaction.id.clone(),
                    strategy: strategy.into(),
                    attempt_number: n,
                    success,
                    data: None,
                    notes: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let status = store.recovery_status(&interaction.id).await.unwrap();
        assert_eq!(status.attempts, 3);
        assert!(status.recovered);
        assert_eq!(status.successful_strategy.as_deref(), Some("fallback"));
        assert_eq!(store.count_attempts(&interaction.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failure_analysis_joins_recovery_outcomes() {
        let store = MemoryAuditStore::new();
        let failed = record("s1", Some("service_unavailable"), InteractionStatus::Error, 10);
        store.record_interaction(&failed).await.unwrap();
        store
            .insert_attempt(&RecoveryAttempt {
                id: new_record_id(),
                interaction_id: failed.id.clone(),
                strategy: "retry".into(),
                attempt_number: 2,
                success: true,
                data: None,
                notes: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let unrecovered = record("s1", Some("hallucination"), InteractionStatus::Failure, 30);
        store.record_interaction(&unrecovered).await.unwrap();

        let rows = store.failure_analysis().await.unwrap();
        assert_eq!(rows.len(), 2);
        let svc = rows
            .iter()
            .find(|r| r.failure_mode == "service_unavailable")
            .unwrap();
        assert!(svc.recovered);
        assert_eq!(svc.average_attempts_to_recovery, Some(2.0));
        let hall = rows.iter().find(|r| r.failure_mode == "hallucination").unwrap();
        assert!(!hall.recovered);
        assert_eq!(hall.average_attempts_to_recovery, None);
    }

    #[tokio::test]
    async fn scenario_mirror_upserts_by_name() {
        let store = MemoryAuditStore::new();
        let mut scenario = crate::scenario::default_scenarios()
            .into_iter()
            .find(|s| s.name == "hallucination")
            .unwrap();
        store.save_scenario(&scenario).await.unwrap();
        scenario.enabled = false;
        store.save_scenario(&scenario).await.unwrap();

        let mirrored = store.load_scenarios().await.unwrap();
        assert_eq!(mirrored.len(), 1);
        assert!(!mirrored[0].enabled);
    }

    #[tokio::test]
    async fn system_health_aggregates_per_metric_type() {
        let store = MemoryAuditStore::new();
        for value in [0.5, 1.5, 2.5] {
            store
                .record_metric(&SystemMetric::new("response_time", value, Some(2.0)))
                .await
                .unwrap();
        }
        store
            .record_metric(&SystemMetric::new("error_rate", 0.01, Some(0.05)))
            .await
            .unwrap();

        let health = store.system_health(1).await.unwrap();
        assert_eq!(health.len(), 2);
        let rt = health.iter().find(|h| h.metric_type == "response_time").unwrap();
        assert_eq!(rt.samples, 3);
        assert_eq!(rt.average, 1.5);
        assert_eq!(rt.max, 2.5);
        assert_eq!(rt.threshold_violations, 1);
    }
}
