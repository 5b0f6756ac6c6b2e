/*!
Storage seams for session state and checkpoints.

Two async traits:
- [`SessionStore`]: live conversational state plus the small TTL'd cells the
  injector leans on (failure/recovery counters, the cooldown marker, the
  per-session request counter).
- [`CheckpointStore`]: tagged deep snapshots for capture/restore.

Both ship with an in-memory backend ([`MemoryStateStore`]) and, behind the
`sqlite` feature, a SQLite-backed one ([`SqliteStateStore`]). A single struct
implements both traits per backend so the two keyspaces share one lifecycle.

Counter semantics: `save` never writes counters. The `increment_*` methods are
the only writers, each read-modify-write is atomic per backend, and every cell
carries its own TTL. `load` folds live cells over the persisted blob, so a
counter that expired between requests falls back to the blob value and the
next increment restarts the cell at 1.
*/

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::Checkpoint;
use crate::persistence::SchemaError;
use crate::session::SessionState;

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStateStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;

/// Default TTL for live session state.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 3600;
/// Default TTL for checkpoints (outlives the session TTL).
pub const DEFAULT_CHECKPOINT_TTL_SECS: i64 = 7200;
/// Default width of the request-rate counting window.
pub const DEFAULT_RATE_WINDOW_SECS: i64 = 60;

/// Errors surfaced by session and checkpoint stores.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("storage backend failure: {message}")]
    #[diagnostic(
        code(faultline::stores::backend),
        help("Check the backing store (connection string, file permissions, disk space).")
    )]
    Backend { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Codec(#[from] SchemaError),
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Record of the most recent injected failure in a session. Drives both the
/// cooldown gate and anti-repetition; expires on its own TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionMarker {
    /// Scenario name that was injected.
    pub mode: String,
    /// When the injection happened.
    pub at: DateTime<Utc>,
}

/// Async storage for live session state and the injector's TTL'd cells.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads the state for `session_id`, folding in any live counter cells.
    /// Absent or expired sessions yield a fresh default state, never an error.
    async fn load(&self, session_id: &str) -> Result<SessionState, StoreError>;

    /// Persists `state` (sans counters) and refreshes the session TTL.
    async fn save(&self, session_id: &str, state: &SessionState) -> Result<(), StoreError>;

    /// Drops the session blob and every associated cell. Resetting an unknown
    /// session is a no-op.
    async fn reset(&self, session_id: &str) -> Result<(), StoreError>;

    /// Atomically bumps the failure counter, returning the new value.
    async fn increment_failure_count(&self, session_id: &str) -> Result<u32, StoreError>;

    /// Atomically bumps the recovery counter, returning the new value.
    async fn increment_recovery_count(&self, session_id: &str) -> Result<u32, StoreError>;

    /// Overwrites the injection marker for `session_id` with the given TTL.
    async fn set_injection_marker(
        &self,
        session_id: &str,
        marker: &InjectionMarker,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Returns the live injection marker, or `None` if absent or expired.
    async fn injection_marker(&self, session_id: &str)
        -> Result<Option<InjectionMarker>, StoreError>;

    /// Bumps the short-window request counter, returning the count inside the
    /// current window. The window restarts when the cell expires.
    async fn bump_request_counter(&self, session_id: &str) -> Result<u32, StoreError>;
}

/// Async storage for tagged session snapshots.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Stores `checkpoint`, replacing any existing snapshot with the same
    /// `(session_id, tag)` and refreshing its TTL.
    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Fetches a snapshot, or `None` if absent or expired.
    async fn get_checkpoint(
        &self,
        session_id: &str,
        tag: &str,
    ) -> Result<Option<Checkpoint>, StoreError>;

    /// Removes a snapshot, reporting whether one was live.
    async fn remove_checkpoint(&self, session_id: &str, tag: &str) -> Result<bool, StoreError>;
}
