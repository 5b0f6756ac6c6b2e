/*!
Failure injection decision engine.

[`FailureInjector::decide`] is the single entry point: given a session, the
incoming message, and an optional forced mode, it returns
[`Decision::PassThrough`] or [`Decision::Injected`] with a synthesized
payload. "No injection" is the normal result of a round, never an error.

Two paths:

- **Forced**: a requested mode that names a known, enabled scenario injects
  unconditionally, bypassing probability, cooldown, and anti-repetition, but
  still writing the failure counter and the injection marker. An unknown name
  is [`InjectorError::UnknownScenario`]; a known-but-disabled one passes
  through.
- **Probabilistic**: gated by the per-session [`InjectionGate`], then a
  first-match sweep over the catalog's fixed decision order (category-major:
  output quality, behavioral, integration, resource; registration order
  within) with one independent uniform draw per eligible scenario at
  `probability × rate_multiplier`, clamped to [0, 1]. First winner takes the
  round. First-match over a weighted draw keeps outcomes reproducible under a
  seeded source.

Scenario gating on top of the sweep:
- the immediately preceding injected mode is excluded, unless it is the only
  enabled scenario in its category;
- loop-detection scenarios need the session's consecutive trigger-phrase
  streak to have reached `max_iterations`;
- livelock scenarios stay permanently eligible (their confidence can never
  reach the perfectionism threshold) and stamp the session stuck on first win.

The engine draws from a `Mutex<StdRng>` so a seeded injector replays the same
decision sequence, which the convergence and determinism tests rely on.
*/

mod gate;

pub use gate::InjectionGate;

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use miette::Diagnostic;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::catalog::ScenarioCatalog;
use crate::config::InjectionConfig;
use crate::scenario::{FailureCategory, FailureScenario, ScenarioParams};
use crate::session::SessionState;
use crate::stores::{InjectionMarker, SessionStore, StoreError};

/// Floor for the injection-marker TTL; the marker must outlive the cooldown
/// window so anti-repetition still sees the previous mode right after cooling.
const MARKER_TTL_FLOOR_SECS: i64 = 60;

/// Errors from the decision engine.
#[derive(Debug, Error, Diagnostic)]
pub enum InjectorError {
    #[error("unknown failure scenario {name:?}")]
    #[diagnostic(
        code(faultline::injector::unknown_scenario),
        help("Scenario names are case-sensitive; list registered ones via the catalog.")
    )]
    UnknownScenario { name: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one decision round.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// No failure this round; the natural response flows through untouched.
    PassThrough,
    /// A failure fires; the caller substitutes the payload for the natural
    /// response and records both.
    Injected(Injection),
}

impl Decision {
    #[must_use]
    pub fn is_injected(&self) -> bool {
        matches!(self, Self::Injected(_))
    }
}

/// A synthesized failure, ready for the caller to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
    /// Winning scenario name.
    pub mode: String,
    pub category: FailureCategory,
    pub payload: FailurePayload,
    /// Scenario-specific extras (delay, limits, livelock detail) merged into
    /// the audit record's metadata.
    pub metadata: Value,
}

/// What the caller must do with a fired scenario.
#[derive(Debug, Clone, PartialEq)]
pub enum FailurePayload {
    /// Substitute this text for the natural response (observed status:
    /// failure).
    Response { text: String },
    /// Wait out `delay` without blocking a worker, then surface the message
    /// as a synthetic timeout (observed status: timeout).
    Timeout {
        message: String,
        delay: StdDuration,
    },
    /// Surface the message as a dependency or resource error (observed
    /// status: error).
    Error { message: String },
}

impl FailurePayload {
    /// Text the caller shows in place of the natural response.
    #[must_use]
    pub fn observed_text(&self) -> &str {
        match self {
            Self::Response { text } => text,
            Self::Timeout { message, .. } | Self::Error { message } => message,
        }
    }
}

/// The decision engine. Cheap to share behind an `Arc`; the RNG is the only
/// interior state.
pub struct FailureInjector {
    catalog: ScenarioCatalog,
    sessions: Arc<dyn SessionStore>,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for FailureInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureInjector")
            .field("catalog", &self.catalog)
            .finish()
    }
}

impl FailureInjector {
    /// Engine with an OS-seeded random source.
    #[must_use]
    pub fn new(catalog: ScenarioCatalog, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            catalog,
            sessions,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Engine with a fixed seed; decision sequences replay exactly.
    #[must_use]
    pub fn with_seed(catalog: ScenarioCatalog, sessions: Arc<dyn SessionStore>, seed: u64) -> Self {
        Self {
            catalog,
            sessions,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &ScenarioCatalog {
        &self.catalog
    }

    /// Runs one decision round for `session_id`.
    ///
    /// Always bumps the session's request-rate counter and advances
    /// loop-detection streaks from `message`, whatever the outcome. Counter
    /// and marker writes go through the session store; the caller persists
    /// `session` itself afterwards.
    #[instrument(skip(self, session, message, config), err)]
    pub async fn decide(
        &self,
        session_id: &str,
        session: &mut SessionState,
        message: &str,
        requested_mode: Option<&str>,
        config: &InjectionConfig,
    ) -> Result<Decision, InjectorError> {
        let requests_in_window = self.sessions.bump_request_counter(session_id).await?;
        self.advance_streaks(session, message);

        if let Some(mode) = requested_mode {
            return self
                .decide_forced(session_id, session, mode, requests_in_window, config)
                .await;
        }
        if !config.probabilistic {
            return Ok(Decision::PassThrough);
        }
        self.decide_probabilistic(session_id, session, requests_in_window, config)
            .await
    }

    async fn decide_forced(
        &self,
        session_id: &str,
        session: &mut SessionState,
        mode: &str,
        requests_in_window: u32,
        config: &InjectionConfig,
    ) -> Result<Decision, InjectorError> {
        let Some(scenario) = self.catalog.get(mode) else {
            return Err(InjectorError::UnknownScenario {
                name: mode.to_string(),
            });
        };
        if !scenario.enabled {
            debug!(scenario = %mode, "forced mode is disabled, passing through");
            return Ok(Decision::PassThrough);
        }
        let injection = {
            let mut rng = self.rng.lock().unwrap();
            Self::synthesize(&mut rng, &scenario, session, requests_in_window)
        };
        self.commit(session_id, session, &scenario, config.cooldown)
            .await?;
        warn!(scenario = %injection.mode, "forced failure injected");
        Ok(Decision::Injected(injection))
    }

    async fn decide_probabilistic(
        &self,
        session_id: &str,
        session: &mut SessionState,
        requests_in_window: u32,
        config: &InjectionConfig,
    ) -> Result<Decision, InjectorError> {
        let marker = self.sessions.injection_marker(session_id).await?;
        let gate = InjectionGate::resolve(marker.as_ref(), config.cooldown, Utc::now());
        let last_mode = match gate {
            InjectionGate::Cooling { until, .. } => {
                debug!(%until, "cooldown active, passing through");
                return Ok(Decision::PassThrough);
            }
            InjectionGate::Eligible { last_mode } => last_mode,
        };

        let winner = {
            let mut rng = self.rng.lock().unwrap();
            let mut winner = None;
            for scenario in self.catalog.decision_order() {
                if !self.eligible(&scenario, last_mode.as_deref(), session) {
                    continue;
                }
                let effective = (scenario.probability() * config.rate_multiplier).clamp(0.0, 1.0);
                if effective > 0.0 && rng.random_bool(effective) {
                    let injection =
                        Self::synthesize(&mut rng, &scenario, session, requests_in_window);
                    winner = Some((scenario, injection));
                    break;
                }
            }
            winner
        };

        match winner {
            Some((scenario, injection)) => {
                self.commit(session_id, session, &scenario, config.cooldown)
                    .await?;
                warn!(
                    scenario = %injection.mode,
                    category = %injection.category,
                    "probabilistic failure injected"
                );
                Ok(Decision::Injected(injection))
            }
            None => Ok(Decision::PassThrough),
        }
    }

    /// Advances consecutive trigger-phrase streaks for every loop-detection
    /// scenario. Counts track the conversation itself, independent of
    /// enablement or draw outcomes, and stick once they reach the scenario's
    /// threshold until the session is reset.
    fn advance_streaks(&self, session: &mut SessionState, message: &str) {
        let lowered = message.to_lowercase();
        for scenario in self.catalog.snapshot().iter() {
            if let Some(loop_params) = scenario.params.loop_detection() {
                let matched = loop_params
                    .trigger_phrases
                    .iter()
                    .any(|phrase| lowered.contains(&phrase.to_lowercase()));
                session.update_streak(&scenario.name, matched, loop_params.max_iterations);
            }
        }
    }

    fn eligible(
        &self,
        scenario: &FailureScenario,
        last_mode: Option<&str>,
        session: &SessionState,
    ) -> bool {
        if last_mode == Some(scenario.name.as_str())
            && self.catalog.enabled_in_category(scenario.category()) > 1
        {
            debug!(scenario = %scenario.name, "excluded this round, fired last");
            return false;
        }
        if let Some(loop_params) = scenario.params.loop_detection() {
            return session.streak(&scenario.name) >= loop_params.max_iterations;
        }
        true
    }

    /// Builds the category-specific payload. Template picks and delay draws
    /// come from the shared RNG so seeded runs stay reproducible.
    fn synthesize(
        rng: &mut StdRng,
        scenario: &FailureScenario,
        session: &SessionState,
        requests_in_window: u32,
    ) -> Injection {
        let (payload, metadata) = match &scenario.params {
            ScenarioParams::OutputQuality(params) => {
                let text = pick(rng, &params.responses);
                (FailurePayload::Response { text }, json!({}))
            }
            ScenarioParams::Behavioral(params) => {
                let text = pick(rng, &params.responses);
                let mut meta = json!({});
                if let Some(loop_params) = &params.loop_detection {
                    meta = json!({
                        "trigger_streak": session.streak(&scenario.name),
                        "max_iterations": loop_params.max_iterations,
                    });
                }
                if let Some(livelock) = params.livelock {
                    meta = json!({
                        "livelock": true,
                        "confidence": livelock.confidence,
                        "perfectionism_threshold": livelock.perfectionism_threshold,
                    });
                }
                (FailurePayload::Response { text }, meta)
            }
            ScenarioParams::Integration(params) => match params.delay_range {
                Some(range) => {
                    let delay_secs = rng.random_range(range.min_secs..=range.max_secs);
                    (
                        FailurePayload::Timeout {
                            message: params.error_message.clone(),
                            delay: StdDuration::from_secs_f64(delay_secs),
                        },
                        json!({ "delay_secs": delay_secs }),
                    )
                }
                None => (
                    FailurePayload::Error {
                        message: params.error_message.clone(),
                    },
                    json!({}),
                ),
            },
            ScenarioParams::Resource(params) => {
                let mut meta = json!({ "requests_in_window": requests_in_window });
                if let Some(limit) = params.limit {
                    meta = json!({
                        "requests_in_window": requests_in_window,
                        "limit": limit,
                        "estimated_tokens": session.estimated_tokens(),
                    });
                }
                (
                    FailurePayload::Error {
                        message: params.error_message.clone(),
                    },
                    meta,
                )
            }
        };
        Injection {
            mode: scenario.name.clone(),
            category: scenario.category(),
            payload,
            metadata,
        }
    }

    /// Applies the session-side effects of a fired scenario: failure counter,
    /// last-injection timestamp, livelock stamp, and the injection marker the
    /// gate reads next round. The marker TTL is at least twice the cooldown
    /// so it is always alive when anti-repetition needs it.
    async fn commit(
        &self,
        session_id: &str,
        session: &mut SessionState,
        scenario: &FailureScenario,
        cooldown: Duration,
    ) -> Result<(), InjectorError> {
        let now = Utc::now();
        session.note_injection(now);
        session.failure_count = self.sessions.increment_failure_count(session_id).await?;
        if scenario.params.livelock().is_some() {
            session.mark_stuck(now);
        }
        let marker = InjectionMarker {
            mode: scenario.name.clone(),
            at: now,
        };
        let ttl = std::cmp::max(Duration::seconds(MARKER_TTL_FLOOR_SECS), cooldown * 2);
        self.sessions
            .set_injection_marker(session_id, &marker, ttl)
            .await?;
        Ok(())
    }
}

fn pick(rng: &mut StdRng, responses: &[String]) -> String {
    responses[rng.random_range(0..responses.len())].clone()
}
