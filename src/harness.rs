/*!
Request pipeline: the in-process equivalent of the HTTP contract.

[`Harness::process`] runs one chat turn end to end:

1. validate the request, minting a fresh session id when none is given;
2. serialize on the per-session lock (same-session requests never interleave;
   different sessions run fully in parallel);
3. load state, checkpoint it under `pre_request`, merge request context,
   append the user turn;
4. obtain the genuine answer from the [`CompletionBackend`] — genuine faults
   map to `natural_status` with canned fallback text, never to a failure
   mode;
5. consult the [`FailureInjector`]; on an injected timeout, honor the delay
   as a non-blocking wait;
6. append the assistant turn, save, and write the audit record — a
   persistence failure fails the whole request, because a response nobody
   can audit must not leave the pipeline.

Every store call the harness makes runs under the configured persistence
deadline.
*/

use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use chrono::Utc;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{
    AuditStore, FailureAnalysisRow, FailureAnalytics, InteractionRecord, InteractionStatus,
    MetricHealth, PersistenceError, SystemMetric, new_record_id,
};
use crate::backend::CompletionBackend;
use crate::catalog::{CatalogError, ScenarioCatalog, ScenarioIter};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointManager, PRE_REQUEST_TAG};
use crate::config::HarnessConfig;
use crate::injector::{Decision, FailureInjector, FailurePayload, InjectorError};
use crate::recorder::InteractionRecorder;
use crate::recovery::{RecoveryError, RecoveryTracker};
use crate::scenario::{FailureCategory, FailureScenario, ScenarioParams};
use crate::session::estimate_tokens;
use crate::stores::{CheckpointStore, SessionStore, StoreError};
use crate::turn::Turn;

/// One inbound chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Opaque session id; blank means "mint a fresh session".
    #[serde(default)]
    pub session_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<FxHashMap<String, Value>>,
    /// Forced failure mode; unconditional injection when it names an enabled
    /// scenario.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ChatRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            context: None,
            failure_mode: None,
            max_tokens: None,
            model: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: FxHashMap<String, Value>) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn with_failure_mode(mut self, mode: impl Into<String>) -> Self {
        self.failure_mode = Some(mode.into());
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// The processed turn, natural and observed sides both visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    /// What the caller sees: natural answer, or the injected payload.
    pub response: String,
    pub status: InteractionStatus,
    /// What genuinely happened upstream, regardless of injection.
    pub natural_status: InteractionStatus,
    pub failure_mode: Option<String>,
    pub failure_injection_applied: bool,
    /// Genuine answer, verbatim; present exactly when injection occurred.
    pub natural_response: Option<String>,
    pub processing_time_ms: u64,
    pub token_count: u32,
    pub model_used: String,
    /// Scenario extras plus `interaction_id` (handle for recovery tracking)
    /// and `stuck_since` while the session is livelocked.
    pub metadata: Value,
}

/// Component snapshot for liveness checks.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub scenario_count: usize,
    pub enabled_scenario_count: usize,
    pub state_store_reachable: bool,
    pub audit_store_reachable: bool,
}

/// Umbrella error for pipeline operations.
#[derive(Debug, Error, Diagnostic)]
pub enum HarnessError {
    #[error("request validation failed: {message}")]
    #[diagnostic(code(faultline::harness::invalid_request))]
    InvalidRequest { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Injector(#[from] InjectorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Recovery(#[from] RecoveryError),
}

/// Distinguishes a synthesized timeout from a genuine upstream one on the
/// internal path. Converted into the observed timeout response right where
/// it is raised; never surfaced to callers.
#[derive(Debug, Error)]
#[error("simulated timeout after {delay_ms}ms: {message}")]
struct TimeoutSimulationError {
    message: String,
    delay_ms: u64,
}

#[derive(Default, Clone)]
struct SessionLocks {
    inner: Arc<Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SessionLocks {
    fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap();
        map.entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn forget(&self, session_id: &str) {
        self.inner.lock().unwrap().remove(session_id);
    }
}

/// The assembled engine: stores, catalog, injector, recorder, tracker.
pub struct Harness {
    config: HarnessConfig,
    catalog: ScenarioCatalog,
    sessions: Arc<dyn SessionStore>,
    checkpoints: CheckpointManager,
    injector: Arc<FailureInjector>,
    recorder: InteractionRecorder,
    recovery: RecoveryTracker,
    audit: Arc<dyn AuditStore>,
    session_locks: SessionLocks,
    started: Instant,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("config", &self.config)
            .finish()
    }
}

impl Harness {
    /// Assembles a harness over explicit stores.
    pub fn new(
        config: HarnessConfig,
        catalog: ScenarioCatalog,
        sessions: Arc<dyn SessionStore>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        let checkpoints = CheckpointManager::new(checkpoint_store, sessions.clone());
        let injector = Arc::new(FailureInjector::new(catalog.clone(), sessions.clone()));
        let recorder = InteractionRecorder::new(audit.clone(), config.op_timeout);
        let recovery = RecoveryTracker::new(audit.clone(), config.op_timeout);
        Self {
            config,
            catalog,
            sessions,
            checkpoints,
            injector,
            recorder,
            recovery,
            audit,
            session_locks: SessionLocks::default(),
            started: Instant::now(),
        }
    }

    /// Fully in-memory harness with the stock scenario set.
    #[must_use]
    pub fn in_memory(config: HarnessConfig) -> Self {
        let store = Arc::new(crate::stores::MemoryStateStore::with_ttls(
            config.session_ttl,
            config.checkpoint_ttl,
            config.rate_window,
        ));
        let audit = Arc::new(crate::audit::MemoryAuditStore::new());
        Self::new(
            config,
            ScenarioCatalog::with_defaults(),
            store.clone(),
            store,
            audit,
        )
    }

    /// Durable harness over SQLite; the state and audit stores share one
    /// pool. Requires `config.database_url`.
    #[cfg(feature = "sqlite")]
    pub async fn connect_sqlite(config: HarnessConfig) -> Result<Self, HarnessError> {
        let Some(url) = config.database_url.clone() else {
            return Err(StoreError::backend("database_url is not configured").into());
        };
        let state = crate::stores::SqliteStateStore::connect(&url)
            .await?
            .with_ttls(config.session_ttl, config.checkpoint_ttl, config.rate_window);
        let audit = Arc::new(crate::audit::SqliteAuditStore::from_pool(state.pool()));
        let state = Arc::new(state);
        Ok(Self::new(
            config,
            ScenarioCatalog::with_defaults(),
            state.clone(),
            state,
            audit,
        ))
    }

    /// Replaces the injector with a seeded one; decision sequences replay.
    #[must_use]
    pub fn with_injection_seed(mut self, seed: u64) -> Self {
        self.injector = Arc::new(FailureInjector::with_seed(
            self.catalog.clone(),
            self.sessions.clone(),
            seed,
        ));
        self
    }

    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    #[must_use]
    pub fn catalog(&self) -> &ScenarioCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    #[must_use]
    pub fn recorder(&self) -> &InteractionRecorder {
        &self.recorder
    }

    #[must_use]
    pub fn recovery(&self) -> &RecoveryTracker {
        &self.recovery
    }

    /// Processes one chat turn. See the module docs for the pipeline stages.
    #[instrument(skip(self, request, backend), fields(session_id = %request.session_id), err)]
    pub async fn process(
        &self,
        request: ChatRequest,
        backend: &dyn CompletionBackend,
    ) -> Result<ChatResponse, HarnessError> {
        let started = Instant::now();
        if request.message.trim().is_empty() {
            return Err(HarnessError::InvalidRequest {
                message: "message must not be empty".into(),
            });
        }
        let session_id = if request.session_id.trim().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            request.session_id.clone()
        };

        let lock = self.session_locks.lock_for(&session_id);
        let _guard = lock.lock().await;

        let mut session = self.bounded(self.sessions.load(&session_id)).await?;
        self.bounded(
            self.checkpoints
                .capture_from(&session_id, PRE_REQUEST_TAG, &session),
        )
        .await?;

        if let Some(context) = request.context.clone() {
            session.merge_context(context);
        }
        session.push_turn(Turn::user(&request.message));

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());

        // The natural side first: injection decisions come after the genuine
        // outcome is known, so the audit can always tell them apart.
        let (natural_text, natural_status) =
            match backend.complete(&session, &request.message, &model).await {
                Ok(text) => (text, InteractionStatus::Success),
                Err(fault) => {
                    warn!(%fault, "completion backend fault");
                    (fault.fallback_text().to_string(), fault.natural_status())
                }
            };

        let decision = self
            .bounded(self.injector.decide(
                &session_id,
                &mut session,
                &request.message,
                request.failure_mode.as_deref(),
                &self.config.injection,
            ))
            .await?;

        let interaction_id = new_record_id();
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "interaction_id".into(),
            Value::String(interaction_id.clone()),
        );

        let (response_text, status, failure_mode, natural_response) = match decision {
            Decision::PassThrough => (natural_text.clone(), natural_status, None, None),
            Decision::Injected(injection) => {
                metadata.insert(
                    "category".into(),
                    Value::String(injection.category.as_str().to_string()),
                );
                if let Value::Object(extra) = &injection.metadata {
                    for (key, value) in extra {
                        metadata.insert(key.clone(), value.clone());
                    }
                }
                let (text, status) = self.apply_injection(&injection).await;
                (
                    text,
                    status,
                    Some(injection.mode),
                    Some(natural_text.clone()),
                )
            }
        };
        let injection_applied = failure_mode.is_some();
        if let Some(stuck_since) = session.stuck_since {
            metadata.insert(
                "stuck_since".into(),
                Value::String(stuck_since.to_rfc3339()),
            );
        }

        session.push_turn(match &failure_mode {
            Some(mode) => Turn::assistant_injected(&response_text, mode),
            None => Turn::assistant(&response_text),
        });
        self.bounded(self.sessions.save(&session_id, &session)).await?;

        let processing_time_ms = started.elapsed().as_millis() as u64;
        let token_count = estimate_tokens(&response_text);
        let record = InteractionRecord {
            id: interaction_id,
            session_id: session_id.clone(),
            request_message: request.message.clone(),
            response: response_text.clone(),
            natural_response: natural_response.clone(),
            failure_mode: failure_mode.clone(),
            injection_applied,
            status,
            natural_status,
            processing_time_ms,
            token_count,
            model_used: model.clone(),
            metadata: Value::Object(metadata.clone()),
            created_at: Utc::now(),
        };
        self.recorder.record(&record).await?;

        Ok(ChatResponse {
            session_id,
            response: response_text,
            status,
            natural_status,
            failure_mode,
            failure_injection_applied: injection_applied,
            natural_response,
            processing_time_ms,
            token_count,
            model_used: model,
            metadata: Value::Object(metadata),
        })
    }

    /// Clears live state, counters, and the cooldown marker for a session.
    /// Audit records and checkpoints are untouched.
    #[instrument(skip(self), err)]
    pub async fn reset_session(&self, session_id: &str) -> Result<(), HarnessError> {
        let lock = self.session_locks.lock_for(session_id);
        let _guard = lock.lock().await;
        self.bounded(self.sessions.reset(session_id)).await?;
        self.session_locks.forget(session_id);
        info!("session reset");
        Ok(())
    }

    /// Rolls a session back to a tagged checkpoint: restores the snapshot and
    /// writes it as the live state. The checkpoint itself is untouched, so
    /// the same tag can be rolled back to again.
    #[instrument(skip(self), err)]
    pub async fn rollback_session(
        &self,
        session_id: &str,
        tag: &str,
    ) -> Result<Checkpoint, HarnessError> {
        let lock = self.session_locks.lock_for(session_id);
        let _guard = lock.lock().await;
        let checkpoint = self.bounded(self.checkpoints.restore(session_id, tag)).await?;
        self.bounded(self.sessions.save(session_id, &checkpoint.state))
            .await?;
        info!(tag, "session rolled back");
        Ok(checkpoint)
    }

    /// Forces `mode` against an ephemeral `test-{uuid}` session, bypassing
    /// any live conversation. Same response shape as chat.
    pub async fn test_failure(
        &self,
        mode: &str,
        message: &str,
        backend: &dyn CompletionBackend,
    ) -> Result<ChatResponse, HarnessError> {
        let request = ChatRequest::new(format!("test-{}", Uuid::new_v4()), message)
            .with_failure_mode(mode);
        self.process(request, backend).await
    }

    /// Registers a scenario and mirrors it durably.
    pub async fn register_scenario(&self, scenario: FailureScenario) -> Result<(), HarnessError> {
        self.catalog.register(scenario.clone())?;
        self.bounded(self.audit.save_scenario(&scenario)).await
    }

    /// Replaces a scenario's parameters and mirrors the result.
    pub async fn update_scenario(
        &self,
        name: &str,
        params: ScenarioParams,
    ) -> Result<(), HarnessError> {
        self.catalog.update(name, params)?;
        self.mirror_scenario(name).await
    }

    /// Enables or disables a scenario and mirrors the result. Disabled
    /// scenarios stay listable; no path selects them.
    pub async fn set_scenario_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<(), HarnessError> {
        self.catalog.set_enabled(name, enabled)?;
        self.mirror_scenario(name).await
    }

    /// Re-saves the named scenario's current catalog definition to the
    /// durable mirror.
    async fn mirror_scenario(&self, name: &str) -> Result<(), HarnessError> {
        let scenario = self
            .catalog
            .get(name)
            .ok_or_else(|| CatalogError::NotFound {
                name: name.to_string(),
            })?;
        self.bounded(self.audit.save_scenario(&scenario)).await
    }

    /// Lazy snapshot listing; `category` and `enabled_only` filter it.
    #[must_use]
    pub fn list_scenarios(
        &self,
        category: Option<FailureCategory>,
        enabled_only: bool,
    ) -> ScenarioIter {
        self.catalog.list(category, enabled_only)
    }

    /// Rehydrates the catalog from the durable mirror; returns how many
    /// definitions were applied. Intended for startup.
    pub async fn restore_scenarios(&self) -> Result<usize, HarnessError> {
        let mirrored = self.bounded(self.audit.load_scenarios()).await?;
        let mut restored = 0;
        for scenario in mirrored {
            if self.catalog.contains(&scenario.name) {
                self.catalog.update(&scenario.name, scenario.params.clone())?;
                self.catalog.set_enabled(&scenario.name, scenario.enabled)?;
            } else {
                self.catalog.register(scenario)?;
            }
            restored += 1;
        }
        Ok(restored)
    }

    /// Failure counts, status distribution, and latency over the window.
    pub async fn failure_analytics(
        &self,
        window_hours: u32,
    ) -> Result<FailureAnalytics, HarnessError> {
        Ok(self.recorder.failure_analytics(window_hours).await?)
    }

    /// Per session/mode failure view joined with recovery outcomes.
    pub async fn failure_analysis(&self) -> Result<Vec<FailureAnalysisRow>, HarnessError> {
        Ok(self.recorder.failure_analysis().await?)
    }

    /// Most recent interactions for a session, newest first.
    pub async fn session_history(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<InteractionRecord>, HarnessError> {
        Ok(self.recorder.session_history(session_id, limit).await?)
    }

    /// Stores a system metric sample.
    pub async fn record_metric(&self, metric: SystemMetric) -> Result<(), HarnessError> {
        self.bounded(self.audit.record_metric(&metric)).await
    }

    /// Per metric type aggregates over the trailing window.
    pub async fn system_health(&self, window_hours: u32) -> Result<Vec<MetricHealth>, HarnessError> {
        Ok(self.audit.system_health(window_hours).await?)
    }

    /// Component liveness snapshot.
    pub async fn health(&self) -> HealthSnapshot {
        let state_store_reachable = self.sessions.load("health-probe").await.is_ok();
        let audit_store_reachable = self.audit.get_interaction("health-probe").await.is_ok();
        let scenario_count = self.catalog.len();
        let enabled_scenario_count = self.catalog.list(None, true).count();
        HealthSnapshot {
            status: if state_store_reachable && audit_store_reachable {
                "ok"
            } else {
                "degraded"
            },
            uptime_secs: self.started.elapsed().as_secs(),
            scenario_count,
            enabled_scenario_count,
            state_store_reachable,
            audit_store_reachable,
        }
    }

    async fn apply_injection(
        &self,
        injection: &crate::injector::Injection,
    ) -> (String, InteractionStatus) {
        match &injection.payload {
            FailurePayload::Response { text } => (text.clone(), InteractionStatus::Failure),
            FailurePayload::Error { message } => (message.clone(), InteractionStatus::Error),
            FailurePayload::Timeout { message, delay } => {
                match simulate_timeout(message, *delay).await {
                    Ok(never) => match never {},
                    Err(simulated) => {
                        debug!(delay_ms = simulated.delay_ms, "synthetic timeout elapsed");
                        (simulated.message, InteractionStatus::Timeout)
                    }
                }
            }
        }
    }

    /// Runs a store future under the persistence deadline. Exceeding the
    /// deadline is a persistence failure, never a silent no-op.
    async fn bounded<T, E>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, HarnessError>
    where
        E: Into<HarnessError>,
    {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HarnessError::Persistence(PersistenceError::Timeout {
                timeout_ms: self.config.op_timeout.as_millis() as u64,
            })),
        }
    }
}

/// The non-blocking wait behind an injected timeout. Always resolves to the
/// internal marker error after the delay; the caller converts it into the
/// observed timeout on the spot.
async fn simulate_timeout(
    message: &str,
    delay: StdDuration,
) -> Result<Infallible, TimeoutSimulationError> {
    tokio::time::sleep(delay).await;
    Err(TimeoutSimulationError {
        message: message.to_string(),
        delay_ms: delay.as_millis() as u64,
    })
}
