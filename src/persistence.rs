/*!
Persistence models for session state and checkpoints (used by the SQLite
backends and any future durable store).

Design goals:
- Explicit serde structs decoupled from the in-memory types, so the stored
  schema can evolve independently of the engine's working representation.
- Conversion logic localized in `From` / `TryFrom` impls; store code stays
  lean and declarative.
- A `schema_version` stamp on every persisted blob, checked on decode.

Top-level timestamps are stored as RFC3339 strings (keeps `chrono` types out
of the serialized shape). This module performs no I/O.
*/

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::checkpoint::Checkpoint;
use crate::session::SessionState;
use crate::turn::Turn;

/// Version stamped into every persisted blob written by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Conversion and (de)serialization errors for persistence models.
#[derive(Debug, Error, Diagnostic)]
pub enum SchemaError {
    #[error("JSON serialization/deserialization failed: {source}")]
    #[diagnostic(
        code(faultline::persistence::serde),
        help("The stored blob is not valid JSON for this schema.")
    )]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    #[error("unsupported persisted schema version {found} (this build reads {supported})")]
    #[diagnostic(
        code(faultline::persistence::unsupported_schema),
        help("The blob was written by an incompatible build; migrate or discard it.")
    )]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("invalid persisted timestamp {value:?}")]
    #[diagnostic(code(faultline::persistence::bad_timestamp))]
    BadTimestamp { value: String },
}

pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn decode_ts(value: &str) -> Result<DateTime<Utc>, SchemaError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SchemaError::BadTimestamp {
            value: value.to_string(),
        })
}

/// Persisted shape of a [`SessionState`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedSession {
    pub schema_version: u32,
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub context: FxHashMap<String, Value>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub recovery_count: u32,
    /// RFC3339; `None` when no failure has been injected.
    #[serde(default)]
    pub last_injection: Option<String>,
    #[serde(default)]
    pub trigger_streaks: FxHashMap<String, u32>,
    /// RFC3339; set while the session is livelocked.
    #[serde(default)]
    pub stuck_since: Option<String>,
}

impl From<&SessionState> for PersistedSession {
    fn from(state: &SessionState) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            turns: state.turns.clone(),
            context: state.context.clone(),
            failure_count: state.failure_count,
            recovery_count: state.recovery_count,
            last_injection: state.last_injection.map(encode_ts),
            trigger_streaks: state.trigger_streaks.clone(),
            stuck_since: state.stuck_since.map(encode_ts),
        }
    }
}

impl TryFrom<PersistedSession> for SessionState {
    type Error = SchemaError;

    fn try_from(persisted: PersistedSession) -> Result<Self, Self::Error> {
        if persisted.schema_version != SCHEMA_VERSION {
            return Err(SchemaError::UnsupportedSchema {
                found: persisted.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(SessionState {
            turns: persisted.turns,
            context: persisted.context,
            failure_count: persisted.failure_count,
            recovery_count: persisted.recovery_count,
            last_injection: persisted
                .last_injection
                .as_deref()
                .map(decode_ts)
                .transpose()?,
            trigger_streaks: persisted.trigger_streaks,
            stuck_since: persisted.stuck_since.as_deref().map(decode_ts).transpose()?,
        })
    }
}

/// Persisted shape of a [`Checkpoint`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedCheckpoint {
    pub schema_version: u32,
    pub session_id: String,
    pub tag: String,
    pub session: PersistedSession,
    /// RFC3339 capture time.
    pub captured_at: String,
}

impl From<&Checkpoint> for PersistedCheckpoint {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: checkpoint.session_id.clone(),
            tag: checkpoint.tag.clone(),
            session: PersistedSession::from(&checkpoint.state),
            captured_at: encode_ts(checkpoint.captured_at),
        }
    }
}

impl TryFrom<PersistedCheckpoint> for Checkpoint {
    type Error = SchemaError;

    fn try_from(persisted: PersistedCheckpoint) -> Result<Self, Self::Error> {
        if persisted.schema_version != SCHEMA_VERSION {
            return Err(SchemaError::UnsupportedSchema {
                found: persisted.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        let captured_at = decode_ts(&persisted.captured_at)?;
        Ok(Checkpoint {
            session_id: persisted.session_id,
            tag: persisted.tag,
            state: SessionState::try_from(persisted.session)?,
            captured_at,
        })
    }
}

/// Encodes a session state as a JSON persistence blob.
pub fn encode_session(state: &SessionState) -> Result<String, SchemaError> {
    Ok(serde_json::to_string(&PersistedSession::from(state))?)
}

/// Decodes a JSON persistence blob back into a session state.
pub fn decode_session(json: &str) -> Result<SessionState, SchemaError> {
    let persisted: PersistedSession = serde_json::from_str(json)?;
    SessionState::try_from(persisted)
}

/// Encodes a checkpoint as a JSON persistence blob.
pub fn encode_checkpoint(checkpoint: &Checkpoint) -> Result<String, SchemaError> {
    Ok(serde_json::to_string(&PersistedCheckpoint::from(
        checkpoint,
    ))?)
}

/// Decodes a JSON persistence blob back into a checkpoint.
pub fn decode_checkpoint(json: &str) -> Result<Checkpoint, SchemaError> {
    let persisted: PersistedCheckpoint = serde_json::from_str(json)?;
    Checkpoint::try_from(persisted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> SessionState {
        let mut state = SessionState::default();
        state.push_turn(Turn::user("hello"));
        state.push_turn(Turn::assistant_injected("made up", "hallucination"));
        state.context.insert("tenant".into(), serde_json::json!("acme"));
        state.failure_count = 2;
        state.last_injection = Some(Utc::now());
        state.update_streak("infinite_loop", true, 3);
        state
    }

    #[test]
    fn session_round_trip_preserves_everything() {
        let state = sample_state();
        let json = encode_session(&state).expect("encode");
        let decoded = decode_session(&json).expect("decode");
        assert_eq!(decoded, state);
    }

    #[test]
    fn checkpoint_round_trip() {
        let checkpoint = Checkpoint {
            session_id: "s1".into(),
            tag: "pre_request".into(),
            state: sample_state(),
            captured_at: Utc::now(),
        };
        let json = encode_checkpoint(&checkpoint).expect("encode");
        let decoded = decode_checkpoint(&json).expect("decode");
        assert_eq!(decoded, checkpoint);
    }

    #[test]
    fn future_schema_versions_are_rejected() {
        let mut persisted = PersistedSession::from(&sample_state());
        persisted.schema_version = SCHEMA_VERSION + 1;
        let err = SessionState::try_from(persisted).unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedSchema { .. }));
    }

    #[test]
    fn garbage_timestamps_are_rejected() {
        let mut persisted = PersistedSession::from(&sample_state());
        persisted.last_injection = Some("not-a-timestamp".into());
        let err = SessionState::try_from(persisted).unwrap_err();
        assert!(matches!(err, SchemaError::BadTimestamp { .. }));
    }
}
