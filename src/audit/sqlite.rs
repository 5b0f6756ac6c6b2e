/*!
SQLite audit store.

Write paths are plain inserts (interaction records are write-once by design;
the scenario mirror upserts). Analytics run as GROUP BY queries over the log;
trailing windows compare on `created_at_ms` (Unix millis) so ordering never
depends on text timestamps.

Shares its pool with [`crate::stores::SqliteStateStore`] via `from_pool`;
`connect` is standalone and runs the embedded migrations when the
`sqlite-migrations` feature is enabled.
*/

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::instrument;

use crate::audit::{
    AuditStore, FailureAnalysisRow, FailureAnalytics, InteractionRecord, InteractionStatus,
    MetricHealth, PersistenceError, RecoveryAttempt, RecoveryStatus, SystemMetric,
};
use crate::persistence::{decode_ts, encode_ts};
use crate::scenario::{FailureScenario, ScenarioParams};

/// SQLite-backed [`AuditStore`].
pub struct SqliteAuditStore {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteAuditStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteAuditStore").finish()
    }
}

fn window_cutoff_ms(window_hours: u32) -> i64 {
    (Utc::now() - Duration::hours(i64::from(window_hours))).timestamp_millis()
}

fn parse_status(raw: &str) -> Result<InteractionStatus, PersistenceError> {
    InteractionStatus::parse_str(raw)
        .ok_or_else(|| PersistenceError::backend(format!("unknown status {raw:?} in audit row")))
}

fn parse_created_at(raw: &str) -> Result<chrono::DateTime<Utc>, PersistenceError> {
    decode_ts(raw).map_err(|e| PersistenceError::backend(format!("bad audit timestamp: {e}")))
}

fn row_to_record(row: &SqliteRow) -> Result<InteractionRecord, PersistenceError> {
    let status: String = row.get("status");
    let natural_status: String = row.get("natural_status");
    let metadata_json: String = row.get("metadata_json");
    let created_at: String = row.get("created_at");
    let processing_time_ms: i64 = row.get("processing_time_ms");
    let token_count: i64 = row.get("token_count");
    Ok(InteractionRecord {
        id: row.get("id"),
        session_id: row.get("session_id"),
        request_message: row.get("request_message"),
        response: row.get("response"),
        natural_response: row.get("natural_response"),
        failure_mode: row.get("failure_mode"),
        injection_applied: row.get("injection_applied"),
        status: parse_status(&status)?,
        natural_status: parse_status(&natural_status)?,
        processing_time_ms: processing_time_ms as u64,
        token_count: token_count as u32,
        model_used: row.get("model_used"),
        metadata: serde_json::from_str(&metadata_json)?,
        created_at: parse_created_at(&created_at)?,
    })
}

impl SqliteAuditStore {
    /// Connect (or create) a SQLite database at `database_url`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| PersistenceError::backend(format!("connect error: {e}")))?;
        #[cfg(feature = "sqlite-migrations")]
        {
            if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
                return Err(PersistenceError::backend(format!("migration failure: {e}")));
            }
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// Wraps an existing pool (schema assumed to be in place), typically the
    /// state store's.
    #[must_use]
    pub fn from_pool(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    #[instrument(skip(self, record), err)]
    async fn record_interaction(
        &self,
        record: &InteractionRecord,
    ) -> Result<(), PersistenceError> {
        let metadata_json = serde_json::to_string(&record.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO interactions (
                id, session_id, request_message, response, natural_response,
                failure_mode, injection_applied, status, natural_status,
                processing_time_ms, token_count, model_used, metadata_json,
                created_at, created_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.request_message)
        .bind(&record.response)
        .bind(&record.natural_response)
        .bind(&record.failure_mode)
        .bind(record.injection_applied)
        .bind(record.status.as_str())
        .bind(record.natural_status.as_str())
        .bind(record.processing_time_ms as i64)
        .bind(i64::from(record.token_count))
        .bind(&record.model_used)
        .bind(&metadata_json)
        .bind(encode_ts(record.created_at))
        .bind(record.created_at.timestamp_millis())
        .execute(&*self.pool)
        .await
        .map_err(|e| PersistenceError::backend(format!("insert interaction: {e}")))?;
        Ok(())
    }

    async fn get_interaction(
        &self,
        id: &str,
    ) -> Result<Option<InteractionRecord>, PersistenceError> {
        let row = sqlx::query("SELECT * FROM interactions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| PersistenceError::backend(format!("select interaction: {e}")))?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn session_history(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<InteractionRecord>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM interactions
            WHERE session_id = ?1
            ORDER BY created_at_ms DESC, rowid DESC
            LIMIT ?2
            "#,
        )
        .bind(session_id)
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| PersistenceError::backend(format!("select history: {e}")))?;
        rows.iter().map(row_to_record).collect()
    }

    #[instrument(skip(self), err)]
    async fn failure_analytics(
        &self,
        window_hours: u32,
    ) -> Result<FailureAnalytics, PersistenceError> {
        let cutoff = window_cutoff_ms(window_hours);

        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS total, AVG(processing_time_ms) AS avg_ms
            FROM interactions WHERE created_at_ms >= ?1
            "#,
        )
        .bind(cutoff)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| PersistenceError::backend(format!("analytics totals: {e}")))?;
        let total: i64 = totals.get("total");
        let avg_ms: Option<f64> = totals.get("avg_ms");

        let mut failure_counts = BTreeMap::new();
        let mode_rows = sqlx::query(
            r#"
            SELECT failure_mode, COUNT(*) AS n FROM interactions
            WHERE created_at_ms >= ?1 AND failure_mode IS NOT NULL
            GROUP BY failure_mode
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| PersistenceError::backend(format!("analytics modes: {e}")))?;
        for row in mode_rows {
            let mode: String = row.get("failure_mode");
            let n: i64 = row.get("n");
            failure_counts.insert(mode, n as u64);
        }

        let mut status_distribution = BTreeMap::new();
        let status_rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n FROM interactions
            WHERE created_at_ms >= ?1
            GROUP BY status
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| PersistenceError::backend(format!("analytics statuses: {e}")))?;
        for row in status_rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            status_distribution.insert(status, n as u64);
        }

        Ok(FailureAnalytics {
            time_range_hours: window_hours,
            total_interactions: total as u64,
            failure_counts,
            status_distribution,
            average_processing_time_ms: avg_ms.unwrap_or(0.0),
        })
    }

    #[instrument(skip(self), err)]
    async fn failure_analysis(&self) -> Result<Vec<FailureAnalysisRow>, PersistenceError> {
        let base_rows = sqlx::query(
            r#"
            SELECT session_id, failure_mode, COUNT(*) AS occurrences,
                   AVG(processing_time_ms) AS avg_ms
            FROM interactions
            WHERE failure_mode IS NOT NULL
            GROUP BY session_id, failure_mode
            ORDER BY session_id, failure_mode
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| PersistenceError::backend(format!("analysis base: {e}")))?;

        // First successful attempt per interaction, aggregated up to the
        // (session, mode) group.
        let recovery_rows = sqlx::query(
            r#"
            SELECT i.session_id, i.failure_mode,
                   COUNT(fs.first_success) AS recovered_count,
                   AVG(fs.first_success) AS avg_attempts
            FROM interactions i
            JOIN (
                SELECT interaction_id, MIN(attempt_number) AS first_success
                FROM recovery_attempts WHERE success = 1
                GROUP BY interaction_id
            ) fs ON fs.interaction_id = i.id
            WHERE i.failure_mode IS NOT NULL
            GROUP BY i.session_id, i.failure_mode
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| PersistenceError::backend(format!("analysis recovery: {e}")))?;

        let mut recovery: BTreeMap<(String, String), (i64, Option<f64>)> = BTreeMap::new();
        for row in recovery_rows {
            let key = (row.get("session_id"), row.get("failure_mode"));
            recovery.insert(key, (row.get("recovered_count"), row.get("avg_attempts")));
        }

        let mut rows = Vec::with_capacity(base_rows.len());
        for row in base_rows {
            let session_id: String = row.get("session_id");
            let failure_mode: String = row.get("failure_mode");
            let occurrences: i64 = row.get("occurrences");
            let avg_ms: Option<f64> = row.get("avg_ms");
            let (recovered_count, avg_attempts) = recovery
                .get(&(session_id.clone(), failure_mode.clone()))
                .copied()
                .unwrap_or((0, None));
            rows.push(FailureAnalysisRow {
                session_id,
                failure_mode,
                occurrences: occurrences as u64,
                average_processing_time_ms: avg_ms.unwrap_or(0.0),
                recovered: recovered_count > 0,
                average_attempts_to_recovery: avg_attempts,
            });
        }
        Ok(rows)
    }

    async fn count_attempts(&self, interaction_id: &str) -> Result<u32, PersistenceError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM recovery_attempts WHERE interaction_id = ?1")
            .bind(interaction_id)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| PersistenceError::backend(format!("count attempts: {e}")))?;
        let n: i64 = row.get("n");
        Ok(n as u32)
    }

    #[instrument(skip(self, attempt), err)]
    async fn insert_attempt(&self, attempt: &RecoveryAttempt) -> Result<(), PersistenceError> {
        let data_json = attempt.data.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO recovery_attempts (
                id, interaction_id, strategy, attempt_number, success,
                data_json, notes, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&attempt.id)
        .bind(&attempt.interaction_id)
        .bind(&attempt.strategy)
        .bind(i64::from(attempt.attempt_number))
        .bind(attempt.success)
        .bind(&data_json)
        .bind(&attempt.notes)
        .bind(encode_ts(attempt.created_at))
        .execute(&*self.pool)
        .await
        .map_err(|e| PersistenceError::backend(format!("insert attempt: {e}")))?;
        Ok(())
    }

    async fn recovery_status(
        &self,
        interaction_id: &str,
    ) -> Result<RecoveryStatus, PersistenceError> {
        let attempts = self.count_attempts(interaction_id).await?;
        let row = sqlx::query(
            r#"
            SELECT strategy FROM recovery_attempts
            WHERE interaction_id = ?1 AND success = 1
            ORDER BY attempt_number ASC LIMIT 1
            "#,
        )
        .bind(interaction_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| PersistenceError::backend(format!("select recovery: {e}")))?;
        let successful_strategy: Option<String> = row.map(|r| r.get("strategy"));
        Ok(RecoveryStatus {
            interaction_id: interaction_id.to_string(),
            attempts,
            recovered: successful_strategy.is_some(),
            successful_strategy,
        })
    }

    async fn record_metric(&self, metric: &SystemMetric) -> Result<(), PersistenceError> {
        let metadata_json = metric.metadata.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO system_metrics (
                id, metric_type, value, threshold, exceeded_threshold,
                metadata_json, created_at, created_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&metric.id)
        .bind(&metric.metric_type)
        .bind(metric.value)
        .bind(metric.threshold)
        .bind(metric.exceeded_threshold)
        .bind(&metadata_json)
        .bind(encode_ts(metric.created_at))
        .bind(metric.created_at.timestamp_millis())
        .execute(&*self.pool)
        .await
        .map_err(|e| PersistenceError::backend(format!("insert metric: {e}")))?;
        Ok(())
    }

    async fn system_health(
        &self,
        window_hours: u32,
    ) -> Result<Vec<MetricHealth>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT metric_type, COUNT(*) AS n, AVG(value) AS avg_value,
                   MAX(value) AS max_value,
                   SUM(CASE WHEN exceeded_threshold THEN 1 ELSE 0 END) AS violations
            FROM system_metrics
            WHERE created_at_ms >= ?1
            GROUP BY metric_type
            ORDER BY metric_type
            "#,
        )
        .bind(window_cutoff_ms(window_hours))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| PersistenceError::backend(format!("system health: {e}")))?;
        rows.into_iter()
            .map(|row| {
                let n: i64 = row.get("n");
                let violations: i64 = row.get("violations");
                Ok(MetricHealth {
                    metric_type: row.get("metric_type"),
                    samples: n as u64,
                    average: row.get::<Option<f64>, _>("avg_value").unwrap_or(0.0),
                    max: row.get::<Option<f64>, _>("max_value").unwrap_or(0.0),
                    threshold_violations: violations as u64,
                })
            })
            .collect()
    }

    #[instrument(skip(self, scenario), err)]
    async fn save_scenario(&self, scenario: &FailureScenario) -> Result<(), PersistenceError> {
        let params_json = serde_json::to_string(&scenario.params)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO failure_scenarios
                (name, description, category, params_json, enabled, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&scenario.name)
        .bind(&scenario.description)
        .bind(scenario.category().as_str())
        .bind(&params_json)
        .bind(scenario.enabled)
        .bind(encode_ts(Utc::now()))
        .execute(&*self.pool)
        .await
        .map_err(|e| PersistenceError::backend(format!("upsert scenario: {e}")))?;
        Ok(())
    }

    async fn load_scenarios(&self) -> Result<Vec<FailureScenario>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT name, description, params_json, enabled FROM failure_scenarios ORDER BY rowid",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| PersistenceError::backend(format!("select scenarios: {e}")))?;
        rows.into_iter()
            .map(|row| {
                let params_json: String = row.get("params_json");
                let params: ScenarioParams = serde_json::from_str(&params_json)?;
                Ok(FailureScenario {
                    name: row.get("name"),
                    description: row.get("description"),
                    params,
                    enabled: row.get("enabled"),
                })
            })
            .collect()
    }
}
