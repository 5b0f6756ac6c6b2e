use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single turn in a conversation session: a role, the text that was said,
/// and when it was said.
///
/// Turns are the unit of session history. Assistant turns produced while a
/// failure was being injected additionally carry the failure-mode name, so
/// history alone shows where the conversation was sabotaged.
///
/// # Examples
///
/// ```
/// use faultline::turn::Turn;
///
/// let user = Turn::user("What is the capital of France?");
/// assert_eq!(user.role, Turn::USER);
///
/// let injected = Turn::assistant_injected("The capital is Lyon.", "hallucination");
/// assert_eq!(injected.failure_mode.as_deref(), Some("hallucination"));
/// ```
///
/// # Serialization
///
/// Turns serialize to JSON with an RFC3339 timestamp; the `failure_mode` tag
/// is omitted entirely for clean turns:
/// ```
/// use faultline::turn::Turn;
///
/// let json = serde_json::to_string(&Turn::user("hi")).unwrap();
/// assert!(!json.contains("failure_mode"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// The role of the speaker (e.g., "user", "assistant", "system").
    ///
    /// Use the constants on [`Turn`] for standardized values.
    pub role: String,
    /// The text content of the turn.
    pub content: String,
    /// When the turn was appended to the session.
    pub timestamp: DateTime<Utc>,
    /// Name of the injected failure scenario, for assistant turns emitted
    /// under injection. `None` for every genuine turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_mode: Option<String>,
}

impl Turn {
    /// User input turn role.
    pub const USER: &'static str = "user";
    /// Agent response turn role.
    pub const ASSISTANT: &'static str = "assistant";
    /// System prompt or instruction turn role.
    pub const SYSTEM: &'static str = "system";

    /// Creates a turn with the specified role and content, stamped now.
    #[must_use]
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            failure_mode: None,
        }
    }

    /// Creates a user turn.
    #[must_use]
    pub fn user(content: &str) -> Self {
        Self::new(Self::USER, content)
    }

    /// Creates a genuine assistant turn.
    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self::new(Self::ASSISTANT, content)
    }

    /// Creates an assistant turn that was produced under failure injection,
    /// tagged with the scenario name that fired.
    #[must_use]
    pub fn assistant_injected(content: &str, failure_mode: &str) -> Self {
        Self {
            failure_mode: Some(failure_mode.to_string()),
            ..Self::new(Self::ASSISTANT, content)
        }
    }

    /// Creates a system turn.
    #[must_use]
    pub fn system(content: &str) -> Self {
        Self::new(Self::SYSTEM, content)
    }

    /// Returns true if this turn has the specified role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }

    /// Returns true if this turn was emitted under failure injection.
    #[must_use]
    pub fn is_injected(&self) -> bool {
        self.failure_mode.is_some()
    }
}
