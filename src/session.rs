/*!
Per-session conversational and failure-tracking state.

A [`SessionState`] is everything the engine remembers about one conversation:
the ordered turn history, free-form context, failure/recovery counters, the
timestamp of the last injected failure, and the bookkeeping that behavioral
scenarios maintain across turns (trigger streaks for loop detection, the
livelock marker for stuck sessions).

Sessions are owned by a [`SessionStore`](crate::stores::SessionStore): loaded
at the start of a request, mutated as a working copy, and saved back at the
end. Absence in the store is a valid initial state, never an error — a fresh
`SessionState::default()` is what an unknown session id looks like.
*/

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::turn::Turn;

/// Rough token estimate for a piece of text, at the conventional four
/// characters per token. Stands in for a real tokenizer; good enough for
/// token-limit payload metadata and audit records.
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

/// The complete state of one conversation session.
///
/// # Examples
///
/// ```
/// use faultline::session::SessionState;
/// use faultline::turn::Turn;
///
/// let mut state = SessionState::default();
/// state.push_turn(Turn::user("hello"));
/// state.push_turn(Turn::assistant("hi there"));
/// assert_eq!(state.turns.len(), 2);
/// assert_eq!(state.failure_count, 0);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Ordered, append-only turn history.
    pub turns: Vec<Turn>,
    /// Free-form context key/value pairs supplied by callers.
    pub context: FxHashMap<String, Value>,
    /// Number of failures injected into this session so far.
    pub failure_count: u32,
    /// Number of recovery attempts logged for this session so far.
    pub recovery_count: u32,
    /// When the last failure was injected, if any.
    pub last_injection: Option<DateTime<Utc>>,
    /// Consecutive trigger-phrase hits per loop scenario name.
    ///
    /// A streak that has reached the scenario's `max_iterations` is sticky:
    /// only a session reset clears it.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub trigger_streaks: FxHashMap<String, u32>,
    /// Set when a livelock scenario fires; the session stays marked until
    /// reset, and callers surface it so consumers stop retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_since: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Appends a turn to the history.
    pub fn push_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Merges caller-supplied context into the session, overwriting existing
    /// keys. Shallow by design: context values are opaque to the engine.
    pub fn merge_context(&mut self, context: FxHashMap<String, Value>) {
        self.context.extend(context);
    }

    /// Estimated token footprint of the whole turn history.
    #[must_use]
    pub fn estimated_tokens(&self) -> u32 {
        self.turns
            .iter()
            .map(|t| estimate_tokens(&t.content))
            .sum()
    }

    /// Current trigger streak for a loop scenario.
    #[must_use]
    pub fn streak(&self, scenario: &str) -> u32 {
        self.trigger_streaks.get(scenario).copied().unwrap_or(0)
    }

    /// Advances the trigger streak for `scenario` given whether the inbound
    /// message matched a trigger phrase, and returns the streak after the
    /// update.
    ///
    /// A non-matching message breaks a streak only while it is still below
    /// `max_iterations`; once the threshold is reached the streak persists
    /// until the session is reset.
    pub fn update_streak(&mut self, scenario: &str, matched: bool, max_iterations: u32) -> u32 {
        let entry = self.trigger_streaks.entry(scenario.to_string()).or_insert(0);
        if matched {
            *entry = entry.saturating_add(1);
        } else if *entry < max_iterations {
            *entry = 0;
        }
        *entry
    }

    /// Records when a failure was injected. The failure counter itself is
    /// owned by the store's atomic increment, whose result the caller folds
    /// into `failure_count` separately.
    pub fn note_injection(&mut self, at: DateTime<Utc>) {
        self.last_injection = Some(at);
    }

    /// Marks the session livelocked as of `at`. Idempotent: the first mark
    /// wins so `stuck_since` reports when the livelock began.
    pub fn mark_stuck(&mut self, at: DateTime<Utc>) {
        self.stuck_since.get_or_insert(at);
    }

    /// True when the session is in a livelock (a stuck scenario has fired and
    /// the session has not been reset since).
    #[must_use]
    pub fn is_stuck(&self) -> bool {
        self.stuck_since.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaks_break_below_threshold_and_stick_at_it() {
        let mut state = SessionState::default();

        assert_eq!(state.update_streak("infinite_loop", true, 3), 1);
        assert_eq!(state.update_streak("infinite_loop", true, 3), 2);
        // A miss below the threshold resets the streak.
        assert_eq!(state.update_streak("infinite_loop", false, 3), 0);

        for expected in 1..=3 {
            assert_eq!(state.update_streak("infinite_loop", true, 3), expected);
        }
        // At the threshold a miss no longer resets.
        assert_eq!(state.update_streak("infinite_loop", false, 3), 3);
        assert_eq!(state.streak("infinite_loop"), 3);
    }

    #[test]
    fn stuck_marker_keeps_first_timestamp() {
        let mut state = SessionState::default();
        let first = Utc::now();
        state.mark_stuck(first);
        state.mark_stuck(Utc::now());
        assert_eq!(state.stuck_since, Some(first));
        assert!(state.is_stuck());
    }

    #[test]
    fn token_estimate_counts_all_turns() {
        let mut state = SessionState::default();
        state.push_turn(Turn::user("abcd"));
        state.push_turn(Turn::assistant("efgh"));
        assert_eq!(state.estimated_tokens(), 2);
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
