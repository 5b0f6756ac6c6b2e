/*!
SQLite store backend.

Durable implementation of [`SessionStore`] and [`CheckpointStore`] on a shared
`sqlx::SqlitePool`.

## Behavior

- Uses the serde persistence models (see [`crate::persistence`]) for the
  session and checkpoint blobs; this module stays focused on database I/O.
- When the `sqlite-migrations` feature is enabled (default), embedded
  migrations (`sqlx::migrate!("./migrations")`) are executed on connect;
  disabling the feature assumes external migration orchestration.
- Expiry is numeric: every row carries `expires_at_ms` (Unix millis) and
  reads filter on it, so TTL checks never depend on text timestamp ordering.
  Expired rows are skipped lazily and reaped by [`SqliteStateStore::purge_expired`].
- Counter bumps are single upsert statements with `RETURNING`, so concurrent
  increments against the same session serialize inside SQLite.

## Database Schema

- `sessions(session_id, state_json, expires_at_ms, updated_at)` — live blob
- `session_counters(session_id, kind, value, expires_at_ms)` — failure /
  recovery cells, incremented out-of-band from `save`
- `injection_markers(session_id, mode, marked_at, expires_at_ms)` — cooldown
  and anti-repetition marker
- `request_counters(session_id, value, expires_at_ms)` — fixed-window rate cell
- `checkpoints(session_id, tag, checkpoint_json, captured_at, expires_at_ms)`
*/

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::checkpoint::Checkpoint;
use crate::persistence::{
    decode_checkpoint, decode_session, decode_ts, encode_checkpoint, encode_session, encode_ts,
};
use crate::session::SessionState;
use crate::stores::{
    CheckpointStore, DEFAULT_CHECKPOINT_TTL_SECS, DEFAULT_RATE_WINDOW_SECS,
    DEFAULT_SESSION_TTL_SECS, InjectionMarker, SessionStore, StoreError,
};

const FAILURE_KIND: &str = "failure";
const RECOVERY_KIND: &str = "recovery";

/// SQLite-backed [`SessionStore`] + [`CheckpointStore`].
pub struct SqliteStateStore {
    /// Shared connection pool; cloneable into the audit store.
    pool: Arc<SqlitePool>,
    session_ttl: Duration,
    checkpoint_ttl: Duration,
    rate_window: Duration,
}

impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore").finish()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn deadline_ms(ttl: Duration) -> i64 {
    (Utc::now() + ttl).timestamp_millis()
}

impl SqliteStateStore {
    /// Connect (or create) a SQLite database at `database_url`.
    /// Example URL: `"sqlite://faultline.db?mode=rwc"`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| StoreError::backend(format!("connect error: {e}")))?;
        // Run embedded migrations only if the feature is enabled (idempotent).
        #[cfg(feature = "sqlite-migrations")]
        {
            if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
                return Err(StoreError::backend(format!("migration failure: {e}")));
            }
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// Wraps an existing pool (schema assumed to be in place).
    #[must_use]
    pub fn from_pool(pool: Arc<SqlitePool>) -> Self {
        Self {
            pool,
            session_ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECS),
            checkpoint_ttl: Duration::seconds(DEFAULT_CHECKPOINT_TTL_SECS),
            rate_window: Duration::seconds(DEFAULT_RATE_WINDOW_SECS),
        }
    }

    /// Overrides the default TTLs.
    #[must_use]
    pub fn with_ttls(
        mut self,
        session_ttl: Duration,
        checkpoint_ttl: Duration,
        rate_window: Duration,
    ) -> Self {
        self.session_ttl = session_ttl;
        self.checkpoint_ttl = checkpoint_ttl;
        self.rate_window = rate_window;
        self
    }

    /// Handle to the underlying pool, for sharing with the audit store.
    #[must_use]
    pub fn pool(&self) -> Arc<SqlitePool> {
        Arc::clone(&self.pool)
    }

    /// Deletes rows whose TTL has lapsed across all store tables. Returns the
    /// number of rows reaped. Reads already filter on expiry, so this is a
    /// space-reclamation concern only; run it from a periodic maintenance task.
    #[instrument(skip(self), err)]
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = now_ms();
        let mut reaped = 0u64;
        for table in [
            "sessions",
            "session_counters",
            "injection_markers",
            "request_counters",
            "checkpoints",
        ] {
            let result = sqlx::query(&format!("DELETE FROM {table} WHERE expires_at_ms <= ?1"))
                .bind(now)
                .execute(&*self.pool)
                .await
                .map_err(|e| StoreError::backend(format!("purge {table}: {e}")))?;
            reaped += result.rows_affected();
        }
        Ok(reaped)
    }

    async fn bump_counter(&self, session_id: &str, kind: &str) -> Result<u32, StoreError> {
        // Single upsert: restart at 1 when the cell has lapsed, otherwise
        // increment; lifetime counters push their deadline out on every bump.
        let row = sqlx::query(
            r#"
            INSERT INTO session_counters (session_id, kind, value, expires_at_ms)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(session_id, kind) DO UPDATE SET
                value = CASE
                    WHEN session_counters.expires_at_ms <= ?4 THEN 1
                    ELSE session_counters.value + 1
                END,
                expires_at_ms = ?3
            RETURNING value
            "#,
        )
        .bind(session_id)
        .bind(kind)
        .bind(deadline_ms(self.session_ttl))
        .bind(now_ms())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| StoreError::backend(format!("bump {kind} counter: {e}")))?;
        let value: i64 = row.get("value");
        Ok(value as u32)
    }
}

#[async_trait]
impl SessionStore for SqliteStateStore {
    #[instrument(skip(self), err)]
    async fn load(&self, session_id: &str) -> Result<SessionState, StoreError> {
        let now = now_ms();
        let blob: Option<String> = sqlx::query(
            "SELECT state_json FROM sessions WHERE session_id = ?1 AND expires_at_ms > ?2",
        )
        .bind(session_id)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| StoreError::backend(format!("select session: {e}")))?
        .map(|row| row.get("state_json"));

        let mut state = match blob {
            Some(json) => decode_session(&json)?,
            None => SessionState::default(),
        };

        // Live counter cells override whatever the blob carried.
        let cells = sqlx::query(
            "SELECT kind, value FROM session_counters WHERE session_id = ?1 AND expires_at_ms > ?2",
        )
        .bind(session_id)
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| StoreError::backend(format!("select counters: {e}")))?;
        for row in cells {
            let kind: String = row.get("kind");
            let value: i64 = row.get("value");
            match kind.as_str() {
                FAILURE_KIND => state.failure_count = value as u32,
                RECOVERY_KIND => state.recovery_count = value as u32,
                _ => {}
            }
        }
        Ok(state)
    }

    #[instrument(skip(self, state), err)]
    async fn save(&self, session_id: &str, state: &SessionState) -> Result<(), StoreError> {
        let state_json = encode_session(state)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO sessions (session_id, state_json, expires_at_ms, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(session_id)
        .bind(&state_json)
        .bind(deadline_ms(self.session_ttl))
        .bind(encode_ts(Utc::now()))
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::backend(format!("upsert session: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn reset(&self, session_id: &str) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::backend(format!("tx begin: {e}")))?;
        for table in [
            "sessions",
            "session_counters",
            "injection_markers",
            "request_counters",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE session_id = ?1"))
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::backend(format!("reset {table}: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::backend(format!("tx commit: {e}")))?;
        Ok(())
    }

    async fn increment_failure_count(&self, session_id: &str) -> Result<u32, StoreError> {
        self.bump_counter(session_id, FAILURE_KIND).await
    }

    async fn increment_recovery_count(&self, session_id: &str) -> Result<u32, StoreError> {
        self.bump_counter(session_id, RECOVERY_KIND).await
    }

    async fn set_injection_marker(
        &self,
        session_id: &str,
        marker: &InjectionMarker,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO injection_markers (session_id, mode, marked_at, expires_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(session_id)
        .bind(&marker.mode)
        .bind(encode_ts(marker.at))
        .bind(deadline_ms(ttl))
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::backend(format!("upsert marker: {e}")))?;
        Ok(())
    }

    async fn injection_marker(
        &self,
        session_id: &str,
    ) -> Result<Option<InjectionMarker>, StoreError> {
        let row = sqlx::query(
            "SELECT mode, marked_at FROM injection_markers WHERE session_id = ?1 AND expires_at_ms > ?2",
        )
        .bind(session_id)
        .bind(now_ms())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| StoreError::backend(format!("select marker: {e}")))?;
        match row {
            Some(row) => {
                let mode: String = row.get("mode");
                let marked_at: String = row.get("marked_at");
                Ok(Some(InjectionMarker {
                    mode,
                    at: decode_ts(&marked_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn bump_request_counter(&self, session_id: &str) -> Result<u32, StoreError> {
        // Fixed window: the deadline is anchored at the first bump and only
        // moves when the window has lapsed.
        let row = sqlx::query(
            r#"
            INSERT INTO request_counters (session_id, value, expires_at_ms)
            VALUES (?1, 1, ?2)
            ON CONFLICT(session_id) DO UPDATE SET
                value = CASE
                    WHEN request_counters.expires_at_ms <= ?3 THEN 1
                    ELSE request_counters.value + 1
                END,
                expires_at_ms = CASE
                    WHEN request_counters.expires_at_ms <= ?3 THEN ?2
                    ELSE request_counters.expires_at_ms
                END
            RETURNING value
            "#,
        )
        .bind(session_id)
        .bind(deadline_ms(self.rate_window))
        .bind(now_ms())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| StoreError::backend(format!("bump request counter: {e}")))?;
        let value: i64 = row.get("value");
        Ok(value as u32)
    }
}

#[async_trait]
impl CheckpointStore for SqliteStateStore {
    #[instrument(skip(self, checkpoint), err)]
    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let checkpoint_json = encode_checkpoint(checkpoint)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO checkpoints
                (session_id, tag, checkpoint_json, captured_at, expires_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&checkpoint.session_id)
        .bind(&checkpoint.tag)
        .bind(&checkpoint_json)
        .bind(encode_ts(checkpoint.captured_at))
        .bind(deadline_ms(self.checkpoint_ttl))
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::backend(format!("upsert checkpoint: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_checkpoint(
        &self,
        session_id: &str,
        tag: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT checkpoint_json FROM checkpoints
            WHERE session_id = ?1 AND tag = ?2 AND expires_at_ms > ?3
            "#,
        )
        .bind(session_id)
        .bind(tag)
        .bind(now_ms())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| StoreError::backend(format!("select checkpoint: {e}")))?;
        match row {
            Some(row) => {
                let json: String = row.get("checkpoint_json");
                Ok(Some(decode_checkpoint(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn remove_checkpoint(&self, session_id: &str, tag: &str) -> Result<bool, StoreError> {
        let live = sqlx::query(
            "DELETE FROM checkpoints WHERE session_id = ?1 AND tag = ?2 AND expires_at_ms > ?3",
        )
        .bind(session_id)
        .bind(tag)
        .bind(now_ms())
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::backend(format!("delete checkpoint: {e}")))?
        .rows_affected();
        // Clear a leftover expired row (the live delete will not have matched it).
        sqlx::query("DELETE FROM checkpoints WHERE session_id = ?1 AND tag = ?2")
            .bind(session_id)
            .bind(tag)
            .execute(&*self.pool)
            .await
            .map_err(|e| StoreError::backend(format!("delete stale checkpoint: {e}")))?;
        Ok(live > 0)
    }
}
