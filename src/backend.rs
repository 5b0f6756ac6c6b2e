/*!
Completion backend seam.

The harness has exactly one external collaborator: something that produces
the genuine answer for a message. [`CompletionBackend`] is that seam. Its
faults are *natural* faults — they land in `natural_status` with a canned
fallback text and are never confused with injected failures.

[`SimulatedBackend`] is the built-in implementation: deterministic canned
answers keyed off the conversation, no network, no keys. Tests swap in
scripted backends through the same trait.
*/

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::audit::InteractionStatus;
use crate::session::SessionState;

/// Genuine faults from the completion service.
#[derive(Debug, Error, Diagnostic)]
pub enum CompletionError {
    #[error("completion timed out: {message}")]
    #[diagnostic(code(faultline::backend::timeout))]
    Timeout { message: String },

    #[error("completion rate limited: {message}")]
    #[diagnostic(code(faultline::backend::rate_limited))]
    RateLimited { message: String },

    #[error("completion backend unavailable: {message}")]
    #[diagnostic(code(faultline::backend::unavailable))]
    Unavailable { message: String },
}

impl CompletionError {
    /// How the fault shows up in `natural_status`.
    #[must_use]
    pub fn natural_status(&self) -> InteractionStatus {
        match self {
            Self::Timeout { .. } => InteractionStatus::Timeout,
            Self::RateLimited { .. } | Self::Unavailable { .. } => InteractionStatus::Error,
        }
    }

    /// Apologetic text shown in place of the answer that never materialized.
    #[must_use]
    pub fn fallback_text(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => {
                "I'm taking longer than usual to respond. Please try again in a moment."
            }
            Self::RateLimited { .. } => {
                "I'm handling a lot of requests right now. Please try again shortly."
            }
            Self::Unavailable { .. } => {
                "I'm sorry, I'm having trouble responding right now. Please try again."
            }
        }
    }
}

/// Produces the genuine answer for a message.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// `session` holds the conversation so far (the current user turn is
    /// already appended); `model` is the label the caller selected.
    async fn complete(
        &self,
        session: &SessionState,
        message: &str,
        model: &str,
    ) -> Result<String, CompletionError>;
}

/// Deterministic built-in backend: no network, answers derived from the
/// message itself so tests and demos can assert on them.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend;

impl SimulatedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CompletionBackend for SimulatedBackend {
    async fn complete(
        &self,
        session: &SessionState,
        message: &str,
        _model: &str,
    ) -> Result<String, CompletionError> {
        let topic: String = message.chars().take(48).collect();
        let turn_count = session.turns.len();
        Ok(format!(
            "I understand you're asking about \"{}\". Based on our conversation so far \
             ({turn_count} turns), here's what I can tell you: this is a reasonable \
             request and I can help with it.",
            topic.trim()
        ))
    }
}
