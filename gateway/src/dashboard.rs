//! Dashboard relay hub.
//!
//! Best-effort fan-out of session activity (transcripts, state changes,
//! agent transfers) to observer WebSockets. Nothing here is persisted and
//! nothing is replayed after a restart; a slow observer just misses events.

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;

/// Buffered envelopes per observer before drops begin.
const OBSERVER_DEPTH: usize = 128;

/// Process-wide registry of dashboard observers, keyed by session id.
#[derive(Default)]
pub struct DashboardHub {
    observers: DashMap<String, Vec<mpsc::Sender<String>>>,
}

impl DashboardHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an observer to a session's event feed.
    pub fn attach(&self, session_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(OBSERVER_DEPTH);
        self.observers
            .entry(session_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Broadcast one envelope to every observer of the session. Closed or
    /// saturated observers are pruned.
    pub fn broadcast(&self, session_id: &str, event: &str, payload: serde_json::Value) {
        let Some(mut senders) = self.observers.get_mut(session_id) else {
            return;
        };
        let envelope = json!({
            "session_id": session_id,
            "event": event,
            "payload": payload,
        })
        .to_string();

        senders.retain(|tx| tx.try_send(envelope.clone()).is_ok());
        if senders.is_empty() {
            drop(senders);
            self.observers.remove(session_id);
        }
    }

    /// Drop every observer of a session (session ended).
    pub fn detach_all(&self, session_id: &str) {
        self.observers.remove(session_id);
    }

    pub fn observer_count(&self, session_id: &str) -> usize {
        self.observers
            .get(session_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_observer() {
        let hub = DashboardHub::new();
        let mut rx = hub.attach("s1");

        hub.broadcast("s1", "transcript", json!({ "text": "hello" }));

        let envelope = rx.recv().await.unwrap();
        assert!(envelope.contains(r#""event":"transcript""#));
        assert!(envelope.contains("hello"));
    }

    #[tokio::test]
    async fn test_broadcast_is_session_scoped() {
        let hub = DashboardHub::new();
        let mut rx = hub.attach("s1");

        hub.broadcast("other-session", "state", json!({}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_observer_is_pruned() {
        let hub = DashboardHub::new();
        let rx = hub.attach("s1");
        drop(rx);

        hub.broadcast("s1", "state", json!({}));
        assert_eq!(hub.observer_count("s1"), 0);
    }
}
