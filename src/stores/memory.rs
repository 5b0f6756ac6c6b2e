/*!
Process-local store backend.

Everything lives in one `Mutex`-guarded map set with lazy TTL expiry: entries
are dropped when a read finds them past their deadline. This is the default
wiring for tests and demos; durable deployments use the SQLite backend.
*/

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;

use crate::checkpoint::Checkpoint;
use crate::session::SessionState;
use crate::stores::{
    CheckpointStore, DEFAULT_CHECKPOINT_TTL_SECS, DEFAULT_RATE_WINDOW_SECS,
    DEFAULT_SESSION_TTL_SECS, InjectionMarker, SessionStore, StoreError,
};

struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Keyspaces {
    sessions: FxHashMap<String, Expiring<SessionState>>,
    failure_counts: FxHashMap<String, Expiring<u32>>,
    recovery_counts: FxHashMap<String, Expiring<u32>>,
    markers: FxHashMap<String, Expiring<InjectionMarker>>,
    request_counts: FxHashMap<String, Expiring<u32>>,
    checkpoints: FxHashMap<(String, String), Expiring<Checkpoint>>,
}

/// In-memory [`SessionStore`] + [`CheckpointStore`].
pub struct MemoryStateStore {
    session_ttl: Duration,
    checkpoint_ttl: Duration,
    rate_window: Duration,
    inner: Mutex<Keyspaces>,
}

impl MemoryStateStore {
    /// Store with production-default TTLs (1h sessions, 2h checkpoints,
    /// 60s rate window).
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttls(
            Duration::seconds(DEFAULT_SESSION_TTL_SECS),
            Duration::seconds(DEFAULT_CHECKPOINT_TTL_SECS),
            Duration::seconds(DEFAULT_RATE_WINDOW_SECS),
        )
    }

    /// Store with explicit TTLs; tests shrink these to exercise expiry.
    #[must_use]
    pub fn with_ttls(session_ttl: Duration, checkpoint_ttl: Duration, rate_window: Duration) -> Self {
        Self {
            session_ttl,
            checkpoint_ttl,
            rate_window,
            inner: Mutex::new(Keyspaces::default()),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a live value out of a keyspace, dropping it if expired.
fn live<'a, K, T>(
    map: &'a mut FxHashMap<K, Expiring<T>>,
    key: &K,
    now: DateTime<Utc>,
) -> Option<&'a mut Expiring<T>>
where
    K: std::hash::Hash + Eq,
{
    if let Some(entry) = map.get(key) {
        if entry.expires_at <= now {
            map.remove(key);
            return None;
        }
    }
    map.get_mut(key)
}

/// Atomic increment-with-TTL. `refresh_ttl` distinguishes lifetime counters
/// (deadline pushed out on every bump, like the session blob) from
/// fixed-window counters (deadline anchored at the first bump).
fn bump(
    map: &mut FxHashMap<String, Expiring<u32>>,
    key: &str,
    ttl: Duration,
    refresh_ttl: bool,
    now: DateTime<Utc>,
) -> u32 {
    let owned = key.to_string();
    match live(map, &owned, now) {
        Some(entry) => {
            entry.value += 1;
            if refresh_ttl {
                entry.expires_at = now + ttl;
            }
            entry.value
        }
        None => {
            map.insert(
                owned,
                Expiring {
                    value: 1,
                    expires_at: now + ttl,
                },
            );
            1
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStateStore {
    async fn load(&self, session_id: &str) -> Result<SessionState, StoreError> {
        let now = Utc::now();
        let key = session_id.to_string();
        let mut inner = self.inner.lock().unwrap();
        let mut state = live(&mut inner.sessions, &key, now)
            .map(|entry| entry.value.clone())
            .unwrap_or_default();
        if let Some(cell) = live(&mut inner.failure_counts, &key, now) {
            state.failure_count = cell.value;
        }
        if let Some(cell) = live(&mut inner.recovery_counts, &key, now) {
            state.recovery_count = cell.value;
        }
        Ok(state)
    }

    async fn save(&self, session_id: &str, state: &SessionState) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.insert(
            session_id.to_string(),
            Expiring {
                value: state.clone(),
                expires_at: now + self.session_ttl,
            },
        );
        Ok(())
    }

    async fn reset(&self, session_id: &str) -> Result<(), StoreError> {
        let key = session_id.to_string();
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.remove(&key);
        inner.failure_counts.remove(&key);
        inner.recovery_counts.remove(&key);
        inner.markers.remove(&key);
        inner.request_counts.remove(&key);
        Ok(())
    }

    async fn increment_failure_count(&self, session_id: &str) -> Result<u32, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        Ok(bump(&mut inner.failure_counts, session_id, self.session_ttl, true, now))
    }

    async fn increment_recovery_count(&self, session_id: &str) -> Result<u32, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        Ok(bump(&mut inner.recovery_counts, session_id, self.session_ttl, true, now))
    }

    async fn set_injection_marker(
        &self,
        session_id: &str,
        marker: &InjectionMarker,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        inner.markers.insert(
            session_id.to_string(),
            Expiring {
                value: marker.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn injection_marker(
        &self,
        session_id: &str,
    ) -> Result<Option<InjectionMarker>, StoreError> {
        let now = Utc::now();
        let key = session_id.to_string();
        let mut inner = self.inner.lock().unwrap();
        Ok(live(&mut inner.markers, &key, now).map(|entry| entry.value.clone()))
    }

    async fn bump_request_counter(&self, session_id: &str) -> Result<u32, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        Ok(bump(&mut inner.request_counts, session_id, self.rate_window, false, now))
    }
}

#[async_trait]
impl CheckpointStore for MemoryStateStore {
    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let now = Utc::now();
        let key = (checkpoint.session_id.clone(), checkpoint.tag.clone());
        let mut inner = self.inner.lock().unwrap();
        inner.checkpoints.insert(
            key,
            Expiring {
                value: checkpoint.clone(),
                expires_at: now + self.checkpoint_ttl,
            },
        );
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        session_id: &str,
        tag: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let now = Utc::now();
        let key = (session_id.to_string(), tag.to_string());
        let mut inner = self.inner.lock().unwrap();
        Ok(live(&mut inner.checkpoints, &key, now).map(|entry| entry.value.clone()))
    }

    async fn remove_checkpoint(&self, session_id: &str, tag: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        let key = (session_id.to_string(), tag.to_string());
        let mut inner = self.inner.lock().unwrap();
        let was_live = live(&mut inner.checkpoints, &key, now).is_some();
        inner.checkpoints.remove(&key);
        Ok(was_live)
    }
}
