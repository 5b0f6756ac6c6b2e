//! # Faultline: Failure Injection & Session State Engine
//!
//! Faultline is a controlled fault-injection harness for conversational
//! agents. It wraps a completion backend, decides on every turn whether to
//! substitute a realistic failure for the genuine answer, and keeps an
//! immutable audit trail that always records what *would* have happened —
//! so recovery tooling can be exercised against failures that are
//! reproducible instead of waited for.
//!
//! ## Core Concepts
//!
//! - **Scenarios**: Named failure modes in four categories (output quality,
//!   behavioral, integration, resource), validated and runtime-tunable
//!   through a copy-on-write registry
//! - **Decisions**: Forced injection on request, or probabilistic selection
//!   gated by a per-session cooldown, anti-repetition, and loop thresholds
//! - **Sessions**: TTL'd conversation state with atomic failure counters,
//!   trigger-phrase streaks, and livelock tracking
//! - **Checkpoints**: Tagged snapshots that restore without being consumed
//! - **Audit**: Write-once interaction records pairing the observed response
//!   with the natural one, plus recovery attempts and analytics views
//!
//! ## Quick Start
//!
//! ### Processing a Turn
//!
//! ```
//! use faultline::backend::SimulatedBackend;
//! use faultline::config::HarnessConfig;
//! use faultline::harness::{ChatRequest, Harness};
//!
//! # async fn demo() -> Result<(), faultline::harness::HarnessError> {
//! let harness = Harness::in_memory(HarnessConfig::default());
//! let backend = SimulatedBackend::new();
//!
//! // Probabilistic mode is off by default: this passes through untouched.
//! let response = harness
//!     .process(ChatRequest::new("session-1", "What plans do you offer?"), &backend)
//!     .await?;
//! assert!(!response.failure_injection_applied);
//!
//! // Forcing a mode injects unconditionally and preserves the natural answer.
//! let injected = harness
//!     .process(
//!         ChatRequest::new("session-1", "And the premium tier?")
//!             .with_failure_mode("hallucination"),
//!         &backend,
//!     )
//!     .await?;
//! assert!(injected.failure_injection_applied);
//! assert!(injected.natural_response.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ### Working with Scenarios
//!
//! ```
//! use faultline::catalog::ScenarioCatalog;
//! use faultline::scenario::{FailureCategory, FailureScenario, OutputQualityParams, ScenarioParams};
//!
//! let catalog = ScenarioCatalog::with_defaults();
//! assert_eq!(catalog.len(), 11);
//!
//! // Register a custom mode; validation runs before anything is stored.
//! catalog.register(FailureScenario::new(
//!     "confident_nonsense",
//!     "Answers with plausible but invented product history.",
//!     ScenarioParams::OutputQuality(OutputQualityParams {
//!         probability: 0.1,
//!         responses: vec!["That feature shipped in 1987.".into()],
//!     }),
//! )).unwrap();
//!
//! // Disabled scenarios stay listable but are never selected.
//! catalog.disable("confident_nonsense").unwrap();
//! assert!(catalog.list(Some(FailureCategory::OutputQuality), false)
//!     .any(|s| s.name == "confident_nonsense"));
//! ```
//!
//! ## Determinism
//!
//! The probabilistic path draws from a single engine-owned RNG. Seed it
//! ([`harness::Harness::with_injection_seed`]) and identical request
//! sequences produce identical decision sequences, which is what makes
//! failure drills repeatable enough to assert on.
//!
//! ## Module Guide
//!
//! - [`scenario`] - Failure categories, parameter bags, the stock catalog
//! - [`catalog`] - Concurrency-safe scenario registry
//! - [`turn`] / [`session`] - Conversation history and live session state
//! - [`stores`] - Session/checkpoint storage traits, memory and SQLite backends
//! - [`checkpoint`] - Tagged snapshot capture and restore
//! - [`injector`] - The decision engine: forced and probabilistic paths
//! - [`backend`] - Completion seam and the deterministic simulated backend
//! - [`harness`] - End-to-end request pipeline
//! - [`audit`] - Interaction records, recovery rows, metrics, analytics
//! - [`recorder`] / [`recovery`] - Deadline-bounded audit writers
//! - [`persistence`] - Versioned serialization of session state
//! - [`config`] - Environment-driven runtime configuration

pub mod audit;
pub mod backend;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod harness;
pub mod injector;
pub mod persistence;
pub mod recorder;
pub mod recovery;
pub mod scenario;
pub mod session;
pub mod stores;
pub mod turn;
