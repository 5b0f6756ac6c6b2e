/*!
Named point-in-time snapshots of session state.

A checkpoint is keyed by `(session_id, tag)` and carries a deep copy of the
session at capture time. Checkpoints expire on their own TTL (longer than the
session TTL by default) so a recovery flow can reconstruct state even after
the live session has lapsed.

[`CheckpointManager`] is a thin orchestrator over the storage seams: capture
reads through [`SessionStore`], restore reads the snapshot back out. Restore
never writes to the session store; callers decide whether to `save` the
restored state.
*/

use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use thiserror::Error;
use tracing::instrument;

use crate::session::SessionState;
use crate::stores::{CheckpointStore, SessionStore, StoreError};

/// Tag used for the automatic snapshot taken before each processed request.
pub const PRE_REQUEST_TAG: &str = "pre_request";

/// A deep, independently-expiring copy of a session's state.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub session_id: String,
    pub tag: String,
    pub state: SessionState,
    pub captured_at: DateTime<Utc>,
}

/// Errors from checkpoint capture and restore.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("no live checkpoint {tag:?} for session {session_id:?}")]
    #[diagnostic(
        code(faultline::checkpoint::not_found),
        help("The checkpoint was never captured, or its TTL has lapsed.")
    )]
    NotFound { session_id: String, tag: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Capture/restore orchestration over the storage seams.
#[derive(Clone)]
pub struct CheckpointManager {
    checkpoints: Arc<dyn CheckpointStore>,
    sessions: Arc<dyn SessionStore>,
}

impl CheckpointManager {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            checkpoints,
            sessions,
        }
    }

    /// Captures the current state of `session_id` under `tag`, overwriting any
    /// prior checkpoint with the same tag.
    #[instrument(skip(self), err)]
    pub async fn capture(
        &self,
        session_id: &str,
        tag: &str,
    ) -> Result<Checkpoint, CheckpointError> {
        let state = self.sessions.load(session_id).await?;
        self.capture_from(session_id, tag, &state).await
    }

    /// Captures a snapshot from state the caller already holds, avoiding a
    /// second load when the harness has the session in hand.
    pub async fn capture_from(
        &self,
        session_id: &str,
        tag: &str,
        state: &SessionState,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            session_id: session_id.to_string(),
            tag: tag.to_string(),
            state: state.clone(),
            captured_at: Utc::now(),
        };
        self.checkpoints.put_checkpoint(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Returns the snapshot stored under `(session_id, tag)`.
    ///
    /// Fails with [`CheckpointError::NotFound`] when absent or expired. The
    /// snapshot stays in place and can be restored again; the live session is
    /// untouched.
    #[instrument(skip(self), err)]
    pub async fn restore(
        &self,
        session_id: &str,
        tag: &str,
    ) -> Result<Checkpoint, CheckpointError> {
        self.checkpoints
            .get_checkpoint(session_id, tag)
            .await?
            .ok_or_else(|| CheckpointError::NotFound {
                session_id: session_id.to_string(),
                tag: tag.to_string(),
            })
    }

    /// Drops the snapshot under `(session_id, tag)`, reporting whether one
    /// was live.
    #[instrument(skip(self), err)]
    pub async fn invalidate(&self, session_id: &str, tag: &str) -> Result<bool, CheckpointError> {
        Ok(self.checkpoints.remove_checkpoint(session_id, tag).await?)
    }
}
