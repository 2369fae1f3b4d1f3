//! Event Bus (spec §4.5): in-process pub/sub plus request/response with
//! correlation.
//!
//! Built on `tokio::sync::broadcast` for fan-out and a correlation map of
//! `oneshot` senders for request/response, matching the spec's "in-process,
//! no external broker" posture. Ordering is FIFO per topic; there is no
//! global ordering across topics, and delivery is at-least-once to
//! subscribers that are up — workflows rely on the Event Store, not this
//! bus, for durability.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::warn;
use uuid::Uuid;

const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub agent_name: String,
    pub status: ResponseStatus,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("request to {0} timed out")]
    Timeout(String),
}

struct Topic {
    sender: broadcast::Sender<BusEvent>,
}

pub struct EventBus {
    topics: Mutex<HashMap<String, Topic>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Response>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    async fn sender_for(&self, topic: &str) -> broadcast::Sender<BusEvent> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic {
                sender: broadcast::channel(SUBSCRIBER_QUEUE_DEPTH).0,
            })
            .sender
            .clone()
    }

    /// Fire-and-forget publish. Subscribers that aren't listening (or whose
    /// bounded queue overflowed) simply miss the message — at-least-once
    /// only to subscribers currently up, per the spec.
    pub async fn publish(&self, topic: &str, payload: Value) {
        let sender = self.sender_for(topic).await;
        let event = BusEvent {
            topic: topic.to_string(),
            payload,
        };
        if sender.send(event).is_err() {
            // No active subscribers; not an error for a fire-and-forget bus.
        }
    }

    /// Subscribe to a topic. The returned handle keeps the subscription
    /// alive; drop it to unsubscribe. If the subscriber falls behind the
    /// bounded queue, `tokio::sync::broadcast` drops the oldest messages,
    /// which is the bus's documented overflow policy.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusEvent> {
        self.sender_for(topic).await.subscribe()
    }

    /// Request/response with a generated correlation id. `target_agent =
    /// "*"` is handled by the caller via `broadcast_request`, not here.
    pub async fn request(
        &self,
        target_agent: &str,
        action: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Response, BusError> {
        let correlation_id = Uuid::now_v7();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation_id, tx);

        self.publish(
            &format!("agent.{target_agent}.request"),
            serde_json::json!({
                "correlation_id": correlation_id,
                "action": action,
                "params": params,
            }),
        )
        .await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.pending.lock().await.remove(&correlation_id);
                Err(BusError::Timeout(target_agent.to_string()))
            }
        }
    }

    /// Called by a response handler when a matching response arrives.
    pub async fn resolve(&self, correlation_id: Uuid, response: Response) {
        if let Some(tx) = self.pending.lock().await.remove(&correlation_id) {
            let _ = tx.send(response);
        } else {
            warn!(%correlation_id, "response for unknown or already-resolved correlation id");
        }
    }

    /// Broadcast a request to every agent satisfying `targets`, collecting a
    /// per-agent status instead of failing on the first error.
    pub async fn broadcast_request(
        &self,
        targets: &[String],
        action: &str,
        params: Value,
        timeout: Duration,
    ) -> Vec<Result<Response, BusError>> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            results.push(self.request(target, action, params.clone(), timeout).await);
        }
        results
    }
}

pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_subscribe_fifo_per_topic() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("workflow.events").await;

        bus.publish("workflow.events", json!({"seq": 1})).await;
        bus.publish("workflow.events", json!({"seq": 2})).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.payload["seq"], 1);
        assert_eq!(second.payload["seq"], 2);
    }

    #[tokio::test]
    async fn request_times_out_without_response() {
        let bus = EventBus::new();
        let result = bus
            .request("nobody", "ping", json!({}), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(BusError::Timeout(_))));
    }

    #[tokio::test]
    async fn request_resolves_when_matching_response_arrives() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe("agent.coder.request").await;

        let bus_clone = bus.clone();
        let responder = tokio::spawn(async move {
            let event = rx.recv().await.unwrap();
            let correlation_id: Uuid =
                serde_json::from_value(event.payload["correlation_id"].clone()).unwrap();
            bus_clone
                .resolve(
                    correlation_id,
                    Response {
                        agent_name: "coder".to_string(),
                        status: ResponseStatus::Ok,
                        payload: json!({"ok": true}),
                    },
                )
                .await;
        });

        let response = bus
            .request("coder", "do_work", json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatus::Ok);
        responder.await.unwrap();
    }
}
