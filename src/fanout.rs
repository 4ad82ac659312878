use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

/// Per-topic broadcast capacity. Slow subscribers past this lag are dropped,
/// not queued: delivery is best-effort and at-most-once.
const TOPIC_CAPACITY: usize = 64;

/// Real-time fan-out over room- and user-scoped topics. A topic is a room id
/// or a user id; FIFO holds within a topic, nothing is ordered across topics.
/// There is no persistence or replay; a client that was away re-fetches
/// state through pagination.
#[derive(Clone, Default)]
pub struct Fanout {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        let mut topics = self.topics.lock().expect("fanout lock poisoned");
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Publish one event to a topic. Called strictly after the owning
    /// transaction has committed; a failed or absent delivery is logged and
    /// dropped, never surfaced to the caller.
    pub fn publish(&self, topic: &str, event: &str, payload: &impl Serialize) {
        let frame = match serde_json::to_string(&Frame { event, data: payload }) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(%topic, %event, %err, "unserializable event payload");
                return;
            }
        };

        let mut topics = self.topics.lock().expect("fanout lock poisoned");
        let Some(tx) = topics.get(topic) else {
            tracing::debug!(%topic, %event, "no subscribers, event dropped");
            return;
        };

        if tx.send(frame).is_err() {
            // every receiver is gone; forget the topic
            tracing::debug!(%topic, %event, "all subscribers gone, event dropped");
            topics.remove(topic);
        }
    }
}

#[derive(Serialize)]
struct Frame<'a, T> {
    event: &'a str,
    data: &'a T,
}

#[derive(Debug, Serialize)]
pub struct MessageDeleted {
    pub message_id: uuid::Uuid,
}

#[derive(Debug, Serialize)]
pub struct MemberUpdate {
    pub room_id: uuid::Uuid,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_admin_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RoomDeleted {
    pub room_id: uuid::Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_topic_subscribers_only() {
        let fanout = Fanout::new();
        let mut room_a = fanout.subscribe("room-a");
        let mut room_b = fanout.subscribe("room-b");

        fanout.publish("room-a", "ping", &serde_json::json!({ "n": 1 }));

        let frame = room_a.recv().await.unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&frame).unwrap()["event"],
            "ping"
        );
        assert!(room_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn fifo_within_one_topic() {
        let fanout = Fanout::new();
        let mut rx = fanout.subscribe("room");

        for n in 0..5 {
            fanout.publish("room", "seq", &serde_json::json!({ "n": n }));
        }

        for n in 0..5 {
            let frame = rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(value["data"]["n"], n);
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let fanout = Fanout::new();
        // must not panic or block
        fanout.publish("nobody-home", "ping", &serde_json::json!({}));
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_fail_publish() {
        let fanout = Fanout::new();
        let rx = fanout.subscribe("room");
        drop(rx);
        fanout.publish("room", "ping", &serde_json::json!({}));
        // topic was pruned; a fresh subscriber sees only new events
        let mut rx = fanout.subscribe("room");
        fanout.publish("room", "pong", &serde_json::json!({}));
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("pong"));
    }
}
