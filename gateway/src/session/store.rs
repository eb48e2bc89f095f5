//! Shared session store.
//!
//! One record per live session, keyed `session:{session_id}`, synchronized
//! across workers. Writes are optimistic: the mutation runs on a copy, the
//! commit checks the version token, and a mismatch retries up to three times
//! before surfacing `Conflict`. Only the owning worker may write live fields;
//! the cancel epoch is the single field any worker may bump (cross-worker
//! barge-in).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::record::{SessionRecord, SessionState};
use crate::errors::{BridgeError, ErrorKind};

/// Attempts before an optimistic write gives up.
pub const MUTATE_RETRIES: usize = 3;

/// Buffered store notifications per subscriber.
const SUBSCRIBER_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session already exists")]
    AlreadyExists,

    #[error("session not found")]
    NotFound,

    #[error("version conflict after {MUTATE_RETRIES} attempts")]
    Conflict,

    #[error("worker does not own this session")]
    NotOwner,

    #[error("mutation rejected: {0}")]
    Invariant(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Backend(_) => ErrorKind::Upstream,
            StoreError::Invariant(_) => ErrorKind::Internal,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<BridgeError> for StoreError {
    fn from(err: BridgeError) -> Self {
        StoreError::Invariant(err.message)
    }
}

/// Best-effort notifications emitted to subscribers of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    CancelEpochBumped { epoch: u64 },
    StateChanged(SessionState),
    Removed,
}

/// Fallible mutation applied to a copy of the record before commit.
pub type MutateFn<'a> =
    &'a (dyn Fn(&mut SessionRecord) -> Result<(), BridgeError> + Send + Sync);

/// Opaque interface over the shared cache.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, record: SessionRecord) -> Result<(), StoreError>;

    async fn load(&self, session_id: &str) -> Result<SessionRecord, StoreError>;

    /// Optimistic read-modify-write by the owning worker.
    async fn mutate(
        &self,
        session_id: &str,
        owner_id: &str,
        mutate_fn: MutateFn<'_>,
    ) -> Result<SessionRecord, StoreError>;

    /// Bump `last_activity_at` without bumping the version token.
    async fn touch(&self, session_id: &str) -> Result<(), StoreError>;

    /// Bump the cancel epoch. Allowed from any worker.
    async fn bump_cancel_epoch(&self, session_id: &str) -> Result<u64, StoreError>;

    /// Best-effort notifications of epoch bumps and state changes.
    async fn subscribe(&self, session_id: &str) -> mpsc::Receiver<StoreEvent>;

    async fn remove(&self, session_id: &str) -> Result<(), StoreError>;

    /// Backend liveness, for the readiness endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}

struct Entry {
    record: SessionRecord,
    expires_at: Instant,
}

/// In-process store: the single-worker deployment shape, and the fixture the
/// test suites run against. Semantics (versioning, ownership, TTL) match the
/// shared-cache implementation.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    subscribers: DashMap<String, Vec<mpsc::Sender<StoreEvent>>>,
    ttl: Duration,
}

impl MemoryStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            subscribers: DashMap::new(),
            ttl,
        }
    }

    fn notify(&self, session_id: &str, event: StoreEvent) {
        if let Some(mut senders) = self.subscribers.get_mut(session_id) {
            senders.retain(|tx| tx.try_send(event.clone()).is_ok() || !tx.is_closed());
        }
    }

    fn evict_if_expired(&self, session_id: &str) {
        let expired = self
            .entries
            .get(session_id)
            .map(|e| e.expires_at <= Instant::now())
            .unwrap_or(false);
        if expired {
            debug!(session_id, "evicting idle session record");
            self.entries.remove(session_id);
            self.notify(session_id, StoreEvent::Removed);
            self.subscribers.remove(session_id);
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.evict_if_expired(&record.session_id);
        let key = record.session_id.clone();
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::AlreadyExists),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Entry {
                    record,
                    expires_at: Instant::now() + self.ttl,
                });
                Ok(())
            }
        }
    }

    async fn load(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        self.evict_if_expired(session_id);
        self.entries
            .get(session_id)
            .map(|e| e.record.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn mutate(
        &self,
        session_id: &str,
        owner_id: &str,
        mutate_fn: MutateFn<'_>,
    ) -> Result<SessionRecord, StoreError> {
        self.evict_if_expired(session_id);

        for _ in 0..MUTATE_RETRIES {
            let snapshot = self
                .entries
                .get(session_id)
                .map(|e| e.record.clone())
                .ok_or(StoreError::NotFound)?;

            if snapshot.owner_id != owner_id {
                return Err(StoreError::NotOwner);
            }

            let prior_state = snapshot.state;
            let mut candidate = snapshot.clone();
            mutate_fn(&mut candidate)?;
            candidate.version = snapshot.version + 1;

            // Commit only if nobody moved the version underneath us.
            let mut entry = self
                .entries
                .get_mut(session_id)
                .ok_or(StoreError::NotFound)?;
            if entry.record.version != snapshot.version {
                drop(entry);
                continue;
            }
            // The epoch may have been bumped concurrently by a non-owner;
            // never let the owner's copy roll it back.
            candidate.cancel_epoch = candidate.cancel_epoch.max(entry.record.cancel_epoch);
            entry.record = candidate.clone();
            entry.expires_at = Instant::now() + self.ttl;
            drop(entry);

            if candidate.state != prior_state {
                self.notify(session_id, StoreEvent::StateChanged(candidate.state));
            }
            return Ok(candidate);
        }

        Err(StoreError::Conflict)
    }

    async fn touch(&self, session_id: &str) -> Result<(), StoreError> {
        let mut entry = self
            .entries
            .get_mut(session_id)
            .ok_or(StoreError::NotFound)?;
        entry.record.last_activity_at = chrono::Utc::now();
        entry.expires_at = Instant::now() + self.ttl;
        Ok(())
    }

    async fn bump_cancel_epoch(&self, session_id: &str) -> Result<u64, StoreError> {
        let epoch = {
            let mut entry = self
                .entries
                .get_mut(session_id)
                .ok_or(StoreError::NotFound)?;
            entry.record.cancel_epoch += 1;
            entry.record.cancel_epoch
        };
        self.notify(session_id, StoreEvent::CancelEpochBumped { epoch });
        Ok(epoch)
    }

    async fn subscribe(&self, session_id: &str) -> mpsc::Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_DEPTH);
        self.subscribers
            .entry(session_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        self.entries
            .remove(session_id)
            .ok_or(StoreError::NotFound)?;
        self.notify(session_id, StoreEvent::Removed);
        self.subscribers.remove(session_id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::record::TransportKind;

    fn store() -> MemoryStore {
        MemoryStore::new(Duration::from_secs(60))
    }

    fn record(id: &str, owner: &str) -> SessionRecord {
        SessionRecord::new(id, TransportKind::Browser, None, owner)
    }

    #[tokio::test]
    async fn test_create_then_load() {
        let store = store();
        store.create(record("s1", "w1")).await.unwrap();

        let loaded = store.load("s1").await.unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.version, 0);
    }

    #[tokio::test]
    async fn test_create_duplicate_rejected() {
        let store = store();
        store.create(record("s1", "w1")).await.unwrap();
        assert!(matches!(
            store.create(record("s1", "w1")).await,
            Err(StoreError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn test_mutate_bumps_version() {
        let store = store();
        store.create(record("s1", "w1")).await.unwrap();

        let updated = store
            .mutate("s1", "w1", &|r| {
                r.active_agent = Some("claims".into());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(updated.version, 1);
        assert_eq!(updated.active_agent.as_deref(), Some("claims"));
    }

    #[tokio::test]
    async fn test_non_owner_write_rejected() {
        let store = store();
        store.create(record("s1", "w1")).await.unwrap();

        let result = store
            .mutate("s1", "other-worker", &|r| {
                r.active_agent = Some("claims".into());
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StoreError::NotOwner)));
        // The record is untouched.
        assert!(store.load("s1").await.unwrap().active_agent.is_none());
    }

    #[tokio::test]
    async fn test_any_worker_may_bump_cancel_epoch() {
        let store = store();
        store.create(record("s1", "w1")).await.unwrap();

        let epoch = store.bump_cancel_epoch("s1").await.unwrap();
        assert_eq!(epoch, 1);
        assert_eq!(store.load("s1").await.unwrap().cancel_epoch, 1);
    }

    #[tokio::test]
    async fn test_owner_mutate_does_not_roll_back_epoch() {
        let store = store();
        store.create(record("s1", "w1")).await.unwrap();
        store.bump_cancel_epoch("s1").await.unwrap();

        let updated = store
            .mutate("s1", "w1", &|r| {
                r.active_agent = Some("claims".into());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(updated.cancel_epoch, 1);
    }

    #[tokio::test]
    async fn test_subscriber_sees_epoch_bump_and_state_change() {
        let store = store();
        store.create(record("s1", "w1")).await.unwrap();
        let mut events = store.subscribe("s1").await;

        store.bump_cancel_epoch("s1").await.unwrap();
        store
            .mutate("s1", "w1", &|r| r.transition(SessionState::Listening))
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::CancelEpochBumped { epoch: 1 }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::StateChanged(SessionState::Listening)
        );
    }

    #[tokio::test]
    async fn test_mutation_error_leaves_record_untouched() {
        let store = store();
        store.create(record("s1", "w1")).await.unwrap();

        // Greeting -> Speaking is off the table.
        let result = store
            .mutate("s1", "w1", &|r| r.transition(SessionState::Speaking))
            .await;

        assert!(matches!(result, Err(StoreError::Invariant(_))));
        let loaded = store.load("s1").await.unwrap();
        assert_eq!(loaded.state, SessionState::Greeting);
        assert_eq!(loaded.version, 0);
    }

    #[tokio::test]
    async fn test_touch_does_not_bump_version() {
        let store = store();
        store.create(record("s1", "w1")).await.unwrap();
        store.touch("s1").await.unwrap();
        assert_eq!(store.load("s1").await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_idle_record_evicted_after_ttl() {
        let store = MemoryStore::new(Duration::from_millis(10));
        store.create(record("s1", "w1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(store.load("s1").await, Err(StoreError::NotFound)));
    }
}
