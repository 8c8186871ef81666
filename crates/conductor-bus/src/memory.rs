use crate::{BusMessage, MessageBus, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use conductor_core::{subject_matches, ConductorError, ConductorResult};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Subscriber {
    pattern: String,
    group: Option<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct Inner {
    subscribers: Vec<Subscriber>,
    /// Round-robin cursor per queue group.
    cursors: HashMap<String, usize>,
    published: Vec<(String, Bytes)>,
}

/// In-process message bus.
///
/// Supports `*`/`>` wildcards, queue groups (round robin), request/reply via
/// private inbox subjects, and records every published message so tests can
/// inspect side effects. Durable subscriptions behave like queue groups named
/// after the consumer; there is no persistence or redelivery.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<Inner>>,
    inbox_seq: Arc<AtomicU64>,
}

impl InMemoryBus {
    /// An empty bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(subject, payload)` published so far, in order.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.inner.lock().published.clone()
    }

    /// Payloads published on subjects matching `pattern`, decoded as JSON.
    pub fn published_json(&self, pattern: &str) -> Vec<serde_json::Value> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|(subject, _)| subject_matches(pattern, subject))
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }

    /// Forget every recorded message.
    pub fn clear_published(&self) {
        self.inner.lock().published.clear();
    }

    /// Live subscriptions, including queue members.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
        inner.subscribers.len()
    }

    fn add_subscriber(&self, pattern: &str, group: Option<&str>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(Subscriber {
            pattern: pattern.to_string(),
            group: group.map(str::to_string),
            tx,
        });
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        Subscription::new(pattern, stream.boxed())
    }

    /// Route one message and return how many subscribers received it.
    fn deliver(&self, subject: &str, payload: Bytes, reply: Option<String>) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.subscribers.retain(|s| !s.tx.is_closed());
        if !subject.starts_with("_INBOX.") {
            inner.published.push((subject.to_string(), payload.clone()));
        }

        let message = BusMessage::new(subject, payload, reply);
        let mut delivered = 0;
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, sub) in inner.subscribers.iter().enumerate() {
            if !subject_matches(&sub.pattern, subject) {
                continue;
            }
            match &sub.group {
                Some(group) => groups
                    .entry(format!("{group}\u{0}{}", sub.pattern))
                    .or_default()
                    .push(idx),
                None => {
                    if sub.tx.send(message.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }

        for (key, members) in groups {
            let cursor = inner.cursors.entry(key).or_insert(0);
            let pick = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            if inner.subscribers[pick].tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> ConductorResult<()> {
        let delivered = self.deliver(subject, payload, None);
        tracing::trace!(subject, delivered, "In-memory publish");
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> ConductorResult<Subscription> {
        Ok(self.add_subscriber(subject, None))
    }

    async fn subscribe_queue(&self, subject: &str, group: &str) -> ConductorResult<Subscription> {
        Ok(self.add_subscriber(subject, Some(group)))
    }

    async fn subscribe_durable(
        &self,
        subject: &str,
        consumer: &str,
    ) -> ConductorResult<Subscription> {
        Ok(self.add_subscriber(subject, Some(consumer)))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> ConductorResult<Bytes> {
        let inbox = format!("_INBOX.{}", self.inbox_seq.fetch_add(1, Ordering::Relaxed));
        let mut replies = self.add_subscriber(&inbox, None);

        if self.deliver(subject, payload, Some(inbox)) == 0 {
            return Err(ConductorError::NoResponders(subject.to_string()));
        }

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(reply)) => Ok(reply.payload),
            Ok(None) => Err(ConductorError::Bus(format!("reply inbox closed for {subject}"))),
            Err(_) => Err(ConductorError::Timeout(subject.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::MessageBusExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_wildcard_delivery() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("conductor.task.*.complete").await.unwrap();
        bus.publish("conductor.task.t1.complete", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        bus.publish("conductor.task.t1.error", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let msg = sub.next().await.unwrap();
        assert_eq!(msg.subject, "conductor.task.t1.complete");
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn test_queue_group_round_robin() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe_queue("jobs", "g").await.unwrap();
        let mut b = bus.subscribe_queue("jobs", "g").await.unwrap();
        bus.publish("jobs", Bytes::from_static(b"1")).await.unwrap();
        bus.publish("jobs", Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(a.next().await.unwrap().payload, Bytes::from_static(b"1"));
        assert_eq!(b.next().await.unwrap().payload, Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_request_without_responders_fails_fast() {
        let bus = InMemoryBus::new();
        let err = bus
            .request("nobody.home", Bytes::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::NoResponders(_)));
    }

    #[tokio::test]
    async fn test_request_times_out_when_unanswered() {
        let bus = InMemoryBus::new();
        let _silent = bus.subscribe("slow.service").await.unwrap();
        let err = bus
            .request("slow.service", Bytes::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
        assert!(matches!(err, ConductorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_request_reply_roundtrip() {
        let bus = InMemoryBus::new();
        let mut service = bus.subscribe("echo").await.unwrap();
        let responder = bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = service.next().await {
                let body: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
                responder.respond(&msg, &json!({"echo": body})).await.unwrap();
            }
        });
        let reply: serde_json::Value = bus
            .request_json("echo", &json!("hi"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, json!({"echo": "hi"}));
        // Replies travel on inbox subjects and stay out of the log.
        assert_eq!(bus.published_json("_INBOX.>").len(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe("a.b").await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
