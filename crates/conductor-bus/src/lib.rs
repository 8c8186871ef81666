//! Message bus abstraction for Conductor.
//!
//! The orchestrator talks to workers, supervisors, gateways and the UI only
//! through subjects on a publish/subscribe bus. This crate hides the concrete
//! transport behind the [`MessageBus`] trait.
//!
//! # Main types
//!
//! - [`MessageBus`]: Publish, subscribe (plain, queue group, durable) and
//!   request/reply.
//! - [`MessageBusExt`]: JSON convenience methods for any bus.
//! - [`BusMessage`]: A received message with optional reply subject and ack
//!   handle.
//! - [`InMemoryBus`]: In-process bus for tests and single-node runs.
//! - [`NatsBus`]: async-nats client with JetStream for durable subjects.

/// In-process bus implementation.
pub mod memory;
/// NATS and JetStream bus implementation.
pub mod nats;

pub use memory::InMemoryBus;
pub use nats::{NatsBus, NatsConfig};

use async_trait::async_trait;
use bytes::Bytes;
use conductor_core::{ConductorError, ConductorResult};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Acknowledgement handle for messages delivered from a durable subject.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Mark the message as processed.
    async fn ack(&self) -> ConductorResult<()>;
    /// Ask for redelivery.
    async fn nak(&self) -> ConductorResult<()>;
}

/// A message received from the bus.
#[derive(Clone)]
pub struct BusMessage {
    /// Concrete subject the message was published on.
    pub subject: String,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// Reply subject for request/reply messages.
    pub reply: Option<String>,
    acker: Option<Arc<dyn Acker>>,
}

impl std::fmt::Debug for BusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("reply", &self.reply)
            .field("durable", &self.acker.is_some())
            .finish()
    }
}

impl BusMessage {
    /// A plain (non-durable) message.
    pub fn new(subject: impl Into<String>, payload: Bytes, reply: Option<String>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            reply,
            acker: None,
        }
    }

    /// Attach an ack handle.
    pub fn with_acker(mut self, acker: Arc<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Whether this message came from a durable subscription.
    pub fn is_durable(&self) -> bool {
        self.acker.is_some()
    }

    /// Acknowledge a durable message. No-op for plain messages.
    pub async fn ack(&self) -> ConductorResult<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Request redelivery of a durable message. No-op for plain messages.
    pub async fn nak(&self) -> ConductorResult<()> {
        match &self.acker {
            Some(acker) => acker.nak().await,
            None => Ok(()),
        }
    }
}

/// A stream of messages for one subscription.
pub struct Subscription {
    subject: String,
    inner: BoxStream<'static, BusMessage>,
}

impl Subscription {
    /// Wrap any message stream.
    pub fn new(subject: impl Into<String>, inner: BoxStream<'static, BusMessage>) -> Self {
        Self {
            subject: subject.into(),
            inner,
        }
    }

    /// The (possibly wildcarded) subject this subscription listens on.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.inner.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

/// Transport used by the orchestrator.
///
/// Plain subjects are fire-and-forget. Durable subjects are persisted by the
/// transport and must be acknowledged after handling; unacknowledged messages
/// are redelivered.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message on a plain subject.
    async fn publish(&self, subject: &str, payload: Bytes) -> ConductorResult<()>;

    /// Publish a message on a durable subject.
    async fn publish_durable(&self, subject: &str, payload: Bytes) -> ConductorResult<()> {
        self.publish(subject, payload).await
    }

    /// Every subscriber on a matching subject receives each message.
    async fn subscribe(&self, subject: &str) -> ConductorResult<Subscription>;

    /// Each message goes to exactly one member of `group`.
    async fn subscribe_queue(&self, subject: &str, group: &str) -> ConductorResult<Subscription>;

    /// Competing consumers named `consumer` on a durable subject.
    async fn subscribe_durable(&self, subject: &str, consumer: &str)
        -> ConductorResult<Subscription>;

    /// Send a request and wait up to `timeout` for one reply.
    ///
    /// Fails with [`ConductorError::NoResponders`] when nobody listens and
    /// [`ConductorError::Timeout`] when nobody answers in time.
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration)
        -> ConductorResult<Bytes>;
}

/// JSON helpers available on every [`MessageBus`].
#[async_trait]
pub trait MessageBusExt: MessageBus {
    /// Serialize `value` and publish it.
    async fn publish_json<T: Serialize + Sync + ?Sized>(
        &self,
        subject: &str,
        value: &T,
    ) -> ConductorResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(subject, Bytes::from(payload)).await
    }

    /// Serialize `value` and publish it durably.
    async fn publish_durable_json<T: Serialize + Sync + ?Sized>(
        &self,
        subject: &str,
        value: &T,
    ) -> ConductorResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_durable(subject, Bytes::from(payload)).await
    }

    /// Serialize a request, await the reply and decode it.
    async fn request_json<T, R>(&self, subject: &str, value: &T, timeout: Duration) -> ConductorResult<R>
    where
        T: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Send,
    {
        let payload = serde_json::to_vec(value)?;
        let reply = self.request(subject, Bytes::from(payload), timeout).await?;
        let bytes: &[u8] = if reply.is_empty() { b"{}" } else { &reply };
        serde_json::from_slice(bytes).map_err(|e| ConductorError::payload(subject, e.to_string()))
    }

    /// Answer a request message. Messages without a reply subject are ignored.
    async fn respond<T: Serialize + Sync + ?Sized>(
        &self,
        message: &BusMessage,
        value: &T,
    ) -> ConductorResult<()> {
        match &message.reply {
            Some(reply) => self.publish_json(reply, value).await,
            None => Ok(()),
        }
    }
}

impl<B: MessageBus + ?Sized> MessageBusExt for B {}
