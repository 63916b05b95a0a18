//! Live update bus.
//!
//! Session-scoped broadcaster delivering transcript/changelog/roll
//! deltas to SSE subscribers. Publishing never creates a writer; a
//! subscriber that lags or reconnects reconciles by re-reading the
//! transcript with its last cursor.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

/// Channel depth per session; slow subscribers skip ahead and reconcile.
const CHANNEL_CAPACITY: usize = 64;

/// New log lines appended by a commit or roll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDelta {
    pub lines: Vec<String>,
    /// 1-based position of the last appended line.
    pub position: u64,
}

/// Rolls resolved as part of a commit or ad-hoc roll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollsDelta {
    pub turn: u64,
    pub items: Vec<Value>,
}

/// One `update` event as delivered to subscribers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<LogDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changelog: Option<LogDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolls: Option<RollsDelta>,
    /// Turn number after the write that produced this event.
    pub turn: u64,
}

/// Per-session broadcast hub.
#[derive(Clone, Default)]
pub struct UpdateBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<UpdateEvent>>>>,
}

impl UpdateBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a session's updates, creating the channel on first
    /// use.
    pub async fn subscribe(&self, slug: &str) -> broadcast::Receiver<UpdateEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(slug.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event; a session nobody watches is a no-op.
    pub async fn publish(&self, slug: &str, event: UpdateEvent) {
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(slug) {
            // Send only fails when there are no receivers left.
            let _ = sender.send(event);
        }
    }

    /// Drop channels with no remaining subscribers.
    pub async fn prune(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_then_publish() {
        let bus = UpdateBus::new();
        let mut rx = bus.subscribe("cellar-run").await;

        bus.publish(
            "cellar-run",
            UpdateEvent {
                transcript: Some(LogDelta {
                    lines: vec!["Player looks around.".into()],
                    position: 4,
                }),
                turn: 2,
                ..Default::default()
            },
        )
        .await;

        let event = rx.recv().await.expect("event delivered");
        assert_eq!(event.turn, 2);
        let delta = event.transcript.expect("transcript delta");
        assert_eq!(delta.position, 4);
        assert_eq!(delta.lines.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = UpdateBus::new();
        bus.publish("nobody-home", UpdateEvent::default()).await;
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let bus = UpdateBus::new();
        let mut rx_a = bus.subscribe("a").await;
        let mut rx_b = bus.subscribe("b").await;

        bus.publish("a", UpdateEvent { turn: 1, ..Default::default() }).await;

        assert_eq!(rx_a.recv().await.expect("a gets event").turn, 1);
        assert!(rx_b.try_recv().is_err(), "b must not see a's event");
    }

    #[tokio::test]
    async fn test_prune_drops_dead_channels() {
        let bus = UpdateBus::new();
        {
            let _rx = bus.subscribe("short-lived").await;
        }
        bus.prune().await;
        let channels = bus.channels.read().await;
        assert!(channels.is_empty());
    }
}
