use crate::{Acker, BusMessage, MessageBus, Subscription};
use async_nats::client::RequestErrorKind;
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use conductor_core::{ConductorError, ConductorResult};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Connection settings for [`NatsBus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// Server URL.
    #[serde(default = "default_url")]
    pub url: String,
    /// JetStream stream holding the durable subjects.
    #[serde(default = "default_stream")]
    pub stream: String,
    /// Connection name reported to the server.
    #[serde(default)]
    pub name: Option<String>,
    /// Connect attempts before giving up.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

fn default_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_stream() -> String {
    "CONDUCTOR_TASKS".to_string()
}

fn default_connect_attempts() -> u32 {
    10
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            stream: default_stream(),
            name: None,
            connect_attempts: default_connect_attempts(),
        }
    }
}

fn bus_error(context: &str, e: impl std::fmt::Display) -> ConductorError {
    ConductorError::Bus(format!("{context}: {e}"))
}

/// Backoff before connect attempt `attempt` (1-based): 250ms doubling, capped
/// at 10s.
fn backoff(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(6);
    Duration::from_millis(250 * factor).min(Duration::from_secs(10))
}

/// Whole milliseconds for log fields, saturating at `u64::MAX`.
fn millis_u64(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// NATS-backed bus. Plain subjects use core NATS; durable subjects go through
/// a JetStream stream with pull consumers and explicit acks.
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream: String,
}

impl NatsBus {
    /// Connect with exponential backoff and make sure the stream covering
    /// `durable_subjects` exists.
    pub async fn connect(config: &NatsConfig, durable_subjects: Vec<String>) -> ConductorResult<Self> {
        let attempts = config.connect_attempts.max(1);
        let mut attempt = 0;
        let client = loop {
            attempt += 1;
            let mut options = async_nats::ConnectOptions::new();
            if let Some(name) = &config.name {
                options = options.name(name.clone());
            }
            match options.connect(config.url.as_str()).await {
                Ok(client) => break client,
                Err(e) if attempt < attempts => {
                    let delay = backoff(attempt);
                    tracing::warn!(
                        url = %config.url,
                        attempt,
                        delay_ms = millis_u64(delay),
                        error = %e,
                        "NATS connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(bus_error("NATS connect failed", e)),
            }
        };
        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream.clone(),
                subjects: durable_subjects.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| bus_error("JetStream stream setup failed", e))?;
        tracing::info!(stream = %config.stream, subjects = ?durable_subjects, "JetStream stream ready");

        Ok(Self {
            client,
            jetstream,
            stream: config.stream.clone(),
        })
    }

    /// The underlying client, for callers that need raw NATS access.
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    fn plain_stream(subject: &str, subscriber: async_nats::Subscriber) -> Subscription {
        let stream = subscriber.map(|msg| {
            BusMessage::new(
                msg.subject.to_string(),
                msg.payload,
                msg.reply.map(|r| r.to_string()),
            )
        });
        Subscription::new(subject, stream.boxed())
    }
}

struct JetStreamAcker(jetstream::Message);

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> ConductorResult<()> {
        self.0.ack().await.map_err(|e| bus_error("ack failed", e))
    }

    async fn nak(&self) -> ConductorResult<()> {
        self.0
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| bus_error("nak failed", e))
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> ConductorResult<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| bus_error("publish failed", e))
    }

    async fn publish_durable(&self, subject: &str, payload: Bytes) -> ConductorResult<()> {
        self.jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| bus_error("durable publish failed", e))?
            .await
            .map_err(|e| bus_error("durable publish not acknowledged", e))?;
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> ConductorResult<Subscription> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| bus_error("subscribe failed", e))?;
        tracing::debug!(subject, "Subscribed");
        Ok(Self::plain_stream(subject, subscriber))
    }

    async fn subscribe_queue(&self, subject: &str, group: &str) -> ConductorResult<Subscription> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| bus_error("queue subscribe failed", e))?;
        tracing::debug!(subject, group, "Queue subscribed");
        Ok(Self::plain_stream(subject, subscriber))
    }

    async fn subscribe_durable(
        &self,
        subject: &str,
        consumer: &str,
    ) -> ConductorResult<Subscription> {
        let stream = self
            .jetstream
            .get_stream(&self.stream)
            .await
            .map_err(|e| bus_error("stream lookup failed", e))?;
        let pull_consumer: jetstream::consumer::Consumer<pull::Config> = stream
            .get_or_create_consumer(
                consumer,
                pull::Config {
                    durable_name: Some(consumer.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| bus_error("consumer setup failed", e))?;
        let messages = pull_consumer
            .messages()
            .await
            .map_err(|e| bus_error("consumer stream failed", e))?;
        tracing::debug!(subject, "Durable consumer attached");

        let owned_subject = subject.to_string();
        let stream = messages.filter_map(move |result| {
            let subject = owned_subject.clone();
            async move {
                match result {
                    Ok(msg) => {
                        let bus_msg = BusMessage::new(msg.subject.to_string(), msg.payload.clone(), None);
                        Some(bus_msg.with_acker(Arc::new(JetStreamAcker(msg))))
                    }
                    Err(e) => {
                        tracing::warn!(subject = %subject, error = %e, "Durable delivery error");
                        None
                    }
                }
            }
        });
        Ok(Subscription::new(subject, stream.boxed()))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> ConductorResult<Bytes> {
        let call = self.client.request(subject.to_string(), payload);
        match tokio::time::timeout(timeout, call).await {
            Err(_) => Err(ConductorError::Timeout(subject.to_string())),
            Ok(Ok(reply)) => Ok(reply.payload),
            Ok(Err(e)) => match e.kind() {
                RequestErrorKind::NoResponders => {
                    Err(ConductorError::NoResponders(subject.to_string()))
                }
                RequestErrorKind::TimedOut => Err(ConductorError::Timeout(subject.to_string())),
                _ => Err(bus_error("request failed", e)),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff(1), Duration::from_millis(250));
        assert_eq!(backoff(2), Duration::from_millis(500));
        assert_eq!(backoff(4), Duration::from_secs(2));
        assert_eq!(backoff(30), Duration::from_secs(10));
    }

    #[test]
    fn test_log_millis_saturate() {
        assert_eq!(millis_u64(backoff(3)), 1000);
        assert_eq!(millis_u64(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_config_defaults() {
        let config: NatsConfig = serde_json::from_str(r#"{"url": "nats://bus:4222"}"#).unwrap();
        assert_eq!(config.url, "nats://bus:4222");
        assert_eq!(config.stream, "CONDUCTOR_TASKS");
        assert_eq!(config.connect_attempts, 10);
    }
}
