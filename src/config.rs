/*!
Runtime configuration.

[`InjectionConfig`] is the immutable value passed into every decision call;
there are deliberately no ambient process toggles, so parallel tests can run
with different settings side by side. [`HarnessConfig`] bundles the wider
pipeline knobs (TTLs, persistence timeout, model label, database URL).

Both resolve from the environment via `from_env` (loading `.env` through
`dotenvy` first), with every knob overridable through `with_*` builders.
*/

use chrono::Duration;

/// Decision-engine settings for a single `decide` call.
#[derive(Clone, Debug, PartialEq)]
pub struct InjectionConfig {
    /// Master switch for the probabilistic path. Forced modes work either way.
    pub probabilistic: bool,
    /// Global multiplier applied to every scenario probability, clamped to
    /// [0, 1] after scaling.
    pub rate_multiplier: f64,
    /// Minimum quiet period after an injection before the probabilistic path
    /// may fire again for the same session.
    pub cooldown: Duration,
}

impl InjectionConfig {
    pub const DEFAULT_COOLDOWN_SECS: i64 = 30;

    /// Reads `PROBABILISTIC_FAILURES`, `FAILURE_RATE_MULTIPLIER`, and
    /// `FAILURE_COOLDOWN_SECS`, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            probabilistic: env_flag("PROBABILISTIC_FAILURES", false),
            rate_multiplier: env_parsed("FAILURE_RATE_MULTIPLIER", 1.0),
            cooldown: Duration::seconds(env_parsed(
                "FAILURE_COOLDOWN_SECS",
                Self::DEFAULT_COOLDOWN_SECS,
            )),
        }
    }

    #[must_use]
    pub fn with_probabilistic(mut self, enabled: bool) -> Self {
        self.probabilistic = enabled;
        self
    }

    #[must_use]
    pub fn with_rate_multiplier(mut self, multiplier: f64) -> Self {
        self.rate_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            probabilistic: false,
            rate_multiplier: 1.0,
            cooldown: Duration::seconds(Self::DEFAULT_COOLDOWN_SECS),
        }
    }
}

/// Pipeline-wide settings for the harness.
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    pub injection: InjectionConfig,
    /// TTL for live session state.
    pub session_ttl: Duration,
    /// TTL for checkpoints; outlives the session TTL.
    pub checkpoint_ttl: Duration,
    /// Width of the per-session request-rate window.
    pub rate_window: Duration,
    /// Caller-enforced timeout on durable writes; exceeding it is a
    /// persistence failure, not a silent no-op.
    pub op_timeout: std::time::Duration,
    /// Model label stamped on responses when the request names none.
    pub default_model: String,
    /// SQLite URL for durable storage, when configured.
    pub database_url: Option<String>,
}

impl HarnessConfig {
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";
    pub const DEFAULT_OP_TIMEOUT_SECS: u64 = 5;

    /// Reads the harness knobs from the environment (`SESSION_TTL_SECS`,
    /// `CHECKPOINT_TTL_SECS`, `PERSISTENCE_TIMEOUT_SECS`, `AI_MODEL`,
    /// `DATABASE_URL`), plus the injection settings.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            injection: InjectionConfig::from_env(),
            session_ttl: Duration::seconds(env_parsed(
                "SESSION_TTL_SECS",
                crate::stores::DEFAULT_SESSION_TTL_SECS,
            )),
            checkpoint_ttl: Duration::seconds(env_parsed(
                "CHECKPOINT_TTL_SECS",
                crate::stores::DEFAULT_CHECKPOINT_TTL_SECS,
            )),
            rate_window: Duration::seconds(crate::stores::DEFAULT_RATE_WINDOW_SECS),
            op_timeout: std::time::Duration::from_secs(env_parsed(
                "PERSISTENCE_TIMEOUT_SECS",
                Self::DEFAULT_OP_TIMEOUT_SECS,
            )),
            default_model: std::env::var("AI_MODEL")
                .unwrap_or_else(|_| Self::DEFAULT_MODEL.to_string()),
            database_url: std::env::var("DATABASE_URL").ok(),
        }
    }

    #[must_use]
    pub fn with_injection(mut self, injection: InjectionConfig) -> Self {
        self.injection = injection;
        self
    }

    #[must_use]
    pub fn with_ttls(mut self, session_ttl: Duration, checkpoint_ttl: Duration) -> Self {
        self.session_ttl = session_ttl;
        self.checkpoint_ttl = checkpoint_ttl;
        self
    }

    #[must_use]
    pub fn with_op_timeout(mut self, op_timeout: std::time::Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    #[must_use]
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            injection: InjectionConfig::default(),
            session_ttl: Duration::seconds(crate::stores::DEFAULT_SESSION_TTL_SECS),
            checkpoint_ttl: Duration::seconds(crate::stores::DEFAULT_CHECKPOINT_TTL_SECS),
            rate_window: Duration::seconds(crate::stores::DEFAULT_RATE_WINDOW_SECS),
            op_timeout: std::time::Duration::from_secs(Self::DEFAULT_OP_TIMEOUT_SECS),
            default_model: Self::DEFAULT_MODEL.to_string(),
            database_url: None,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => parse_flag(&raw),
        Err(_) => default,
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
