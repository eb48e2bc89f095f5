//! Redis-backed session store.
//!
//! The cross-worker deployment shape. One JSON record per session under
//! `session:{id}`, a version counter under `session:{id}:ver` for optimistic
//! commits (compare-and-set in a Lua script), and the cancel epoch under its
//! own `session:{id}:epoch` counter so any worker can bump it with a plain
//! INCR. Notifications ride pub/sub on `session-events:{id}`; eviction is the
//! cache's TTL, not ours.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::record::SessionRecord;
use super::store::{MUTATE_RETRIES, MutateFn, SessionStore, StoreError, StoreEvent};

const SUBSCRIBER_DEPTH: usize = 32;

/// CAS commit: write record + version only if the version counter still
/// holds the value the mutation started from.
const COMMIT_SCRIPT: &str = r#"
local ver = redis.call('GET', KEYS[2])
if ver == false then ver = '0' end
if ver ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
redis.call('SET', KEYS[2], ARGV[4], 'EX', ARGV[3])
return 1
"#;

#[derive(Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WireEvent {
    CancelEpoch { epoch: u64 },
    State { state: super::record::SessionState },
    Removed,
}

impl From<WireEvent> for StoreEvent {
    fn from(event: WireEvent) -> Self {
        match event {
            WireEvent::CancelEpoch { epoch } => StoreEvent::CancelEpochBumped { epoch },
            WireEvent::State { state } => StoreEvent::StateChanged(state),
            WireEvent::Removed => StoreEvent::Removed,
        }
    }
}

fn record_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

fn version_key(session_id: &str) -> String {
    format!("session:{session_id}:ver")
}

fn epoch_key(session_id: &str) -> String {
    format!("session:{session_id}:epoch")
}

fn events_channel(session_id: &str) -> String {
    format!("session-events:{session_id}")
}

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    commit: redis::Script,
    ttl: Duration,
}

impl RedisStore {
    /// Connect to the shared cache. Fails fast so startup can exit with the
    /// cache-unreachable code.
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Backend(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Backend(format!("redis unreachable: {e}")))?;
        Ok(Self {
            client,
            conn,
            commit: redis::Script::new(COMMIT_SCRIPT),
            ttl,
        })
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }

    async fn publish(&self, session_id: &str, event: WireEvent) {
        let Ok(payload) = serde_json::to_string(&event) else {
            return;
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .publish::<_, _, ()>(events_channel(session_id), payload)
            .await
        {
            debug!(session_id, error = %e, "event publish failed");
        }
    }

    async fn load_with_version(
        &self,
        session_id: &str,
    ) -> Result<(SessionRecord, u64), StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(record_key(session_id)).await.map_err(backend)?;
        let raw = raw.ok_or(StoreError::NotFound)?;
        let mut record: SessionRecord = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Backend(format!("corrupt session record: {e}")))?;

        let version: Option<u64> = conn.get(version_key(session_id)).await.map_err(backend)?;
        let version = version.unwrap_or(0);

        // The epoch counter is the source of truth; the serialized record
        // only carries the owner's last view of it.
        let epoch: Option<u64> = conn.get(epoch_key(session_id)).await.map_err(backend)?;
        record.cancel_epoch = record.cancel_epoch.max(epoch.unwrap_or(0));
        record.version = version;

        Ok((record, version))
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn create(&self, record: SessionRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&record)
            .map_err(|e| StoreError::Backend(format!("serialize record: {e}")))?;
        let mut conn = self.conn.clone();

        let created: bool = redis::cmd("SET")
            .arg(record_key(&record.session_id))
            .arg(payload)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        if !created {
            return Err(StoreError::AlreadyExists);
        }
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        self.load_with_version(session_id).await.map(|(r, _)| r)
    }

    async fn mutate(
        &self,
        session_id: &str,
        owner_id: &str,
        mutate_fn: MutateFn<'_>,
    ) -> Result<SessionRecord, StoreError> {
        for _ in 0..MUTATE_RETRIES {
            let (snapshot, version) = self.load_with_version(session_id).await?;
            if snapshot.owner_id != owner_id {
                return Err(StoreError::NotOwner);
            }

            let prior_state = snapshot.state;
            let mut candidate = snapshot;
            mutate_fn(&mut candidate)?;
            candidate.version = version + 1;

            let payload = serde_json::to_string(&candidate)
                .map_err(|e| StoreError::Backend(format!("serialize record: {e}")))?;

            let mut conn = self.conn.clone();
            let committed: i64 = self
                .commit
                .key(record_key(session_id))
                .key(version_key(session_id))
                .arg(version.to_string())
                .arg(payload)
                .arg(self.ttl_secs())
                .arg(candidate.version.to_string())
                .invoke_async(&mut conn)
                .await
                .map_err(backend)?;

            if committed == 0 {
                warn!(session_id, "optimistic commit lost the race, retrying");
                continue;
            }

            if candidate.state != prior_state {
                self.publish(
                    session_id,
                    WireEvent::State {
                        state: candidate.state,
                    },
                )
                .await;
            }
            return Ok(candidate);
        }

        Err(StoreError::Conflict)
    }

    async fn touch(&self, session_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let refreshed: bool = conn
            .expire(record_key(session_id), self.ttl_secs() as i64)
            .await
            .map_err(backend)?;
        if !refreshed {
            return Err(StoreError::NotFound);
        }
        let _: bool = conn
            .expire(version_key(session_id), self.ttl_secs() as i64)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn bump_cancel_epoch(&self, session_id: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let epoch: u64 = conn.incr(epoch_key(session_id), 1).await.map_err(backend)?;
        let _: bool = conn
            .expire(epoch_key(session_id), self.ttl_secs() as i64)
            .await
            .map_err(backend)?;
        self.publish(session_id, WireEvent::CancelEpoch { epoch }).await;
        Ok(epoch)
    }

    async fn subscribe(&self, session_id: &str) -> mpsc::Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_DEPTH);
        let client = self.client.clone();
        let channel = events_channel(session_id);

        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    warn!(error = %e, "pubsub connection failed");
                    return;
                }
            };
            if let Err(e) = pubsub.subscribe(&channel).await {
                warn!(error = %e, "pubsub subscribe failed");
                return;
            }

            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<WireEvent>(&payload) else {
                    continue;
                };
                if tx.send(event.into()).await.is_err() {
                    break;
                }
            }
        });

        rx
    }

    async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(vec![
                record_key(session_id),
                version_key(session_id),
                epoch_key(session_id),
            ])
            .await
            .map_err(backend)?;
        if removed == 0 {
            return Err(StoreError::NotFound);
        }
        self.publish(session_id, WireEvent::Removed).await;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(record_key("abc"), "session:abc");
        assert_eq!(version_key("abc"), "session:abc:ver");
        assert_eq!(epoch_key("abc"), "session:abc:epoch");
        assert_eq!(events_channel("abc"), "session-events:abc");
    }

    #[test]
    fn test_wire_event_round_trip() {
        let json = serde_json::to_string(&WireEvent::CancelEpoch { epoch: 3 }).unwrap();
        assert_eq!(json, r#"{"event":"cancel_epoch","epoch":3}"#);

        let back: WireEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            StoreEvent::from(back),
            StoreEvent::CancelEpochBumped { epoch: 3 }
        ));
    }
}
