//! NATS JetStream implementation of the [`Bus`] trait.

use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull, stream, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::consumer::subjects::{STREAM_NAME, STREAM_SUBJECTS};

use super::{Acker, Bus, BusError, BusSubscription, Delivery, Headers};

/// JetStream-backed bus. Durable subscriptions are pull consumers filtered
/// per subject; ephemeral subscriptions use core NATS.
pub struct NatsBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsBus {
    /// Connect to the NATS server at `url`.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let jetstream = jetstream::new(client.clone());
        tracing::info!(url = url, "connected to NATS");
        Ok(Self { client, jetstream })
    }
}

fn to_nats_headers(headers: &Headers) -> async_nats::HeaderMap {
    let mut map = async_nats::HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

fn from_nats_headers(headers: Option<&async_nats::HeaderMap>) -> Headers {
    let mut map = Headers::new();
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            if let Some(value) = values.first() {
                map.insert(name.to_string(), value.as_str().to_string());
            }
        }
    }
    map
}

/// Durable consumer names cannot contain subject separators or wildcards.
fn durable_name(subject: &str) -> String {
    let sanitized: String = subject
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '-',
            other => other,
        })
        .collect();
    format!("codeforge-worker-{sanitized}")
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.jetstream
            .publish(subject.to_string(), Bytes::from(payload))
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn publish_with_headers(
        &self,
        subject: &str,
        headers: &Headers,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.jetstream
            .publish_with_headers(subject.to_string(), to_nats_headers(headers), Bytes::from(payload))
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn BusSubscription>, BusError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        Ok(Box::new(CoreSubscription {
            subscriber: Some(subscriber),
        }))
    }

    async fn durable_subscribe(&self, subject: &str) -> Result<Box<dyn BusSubscription>, BusError> {
        let stream = self
            .jetstream
            .get_stream(STREAM_NAME)
            .await
            .map_err(|e| BusError::Stream(e.to_string()))?;
        let consumer = stream
            .create_consumer(pull::Config {
                durable_name: Some(durable_name(subject)),
                filter_subject: subject.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        Ok(Box::new(DurableSubscription {
            messages,
            closed: false,
        }))
    }

    async fn ensure_stream(&self) -> Result<(), BusError> {
        self.jetstream
            .get_or_create_stream(stream::Config {
                name: STREAM_NAME.to_string(),
                subjects: STREAM_SUBJECTS.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Stream(e.to_string()))?;
        Ok(())
    }

    async fn drain(&self, deadline: Duration) -> Result<(), BusError> {
        match tokio::time::timeout(deadline, self.client.drain()).await {
            Ok(result) => result.map_err(|e| BusError::Connect(e.to_string())),
            Err(_) => {
                tracing::warn!("NATS drain timed out, closing connection");
                Ok(())
            }
        }
    }
}

// ─── Subscriptions ───────────────────────────────────────────────────────────

struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self) {}
    async fn nak(&self) {}
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) {
        if let Err(error) = self.message.ack().await {
            tracing::warn!(error = %error, "message ack failed");
        }
    }

    async fn nak(&self) {
        if let Err(error) = self.message.ack_with(AckKind::Nak(None)).await {
            tracing::warn!(error = %error, "message nak failed");
        }
    }
}

struct CoreSubscription {
    subscriber: Option<async_nats::Subscriber>,
}

#[async_trait]
impl BusSubscription for CoreSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let subscriber = self.subscriber.as_mut()?;
        let message = subscriber.next().await?;
        Some(Delivery::new(
            message.subject.to_string(),
            message.payload.to_vec(),
            from_nats_headers(message.headers.as_ref()),
            std::sync::Arc::new(NoopAcker),
        ))
    }

    async fn unsubscribe(&mut self) {
        if let Some(mut subscriber) = self.subscriber.take() {
            let _ = subscriber.unsubscribe().await;
        }
    }
}

struct DurableSubscription {
    messages: pull::Stream,
    closed: bool,
}

#[async_trait]
impl BusSubscription for DurableSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if self.closed {
                return None;
            }
            match self.messages.next().await? {
                Ok(message) => {
                    let subject = message.subject.to_string();
                    let payload = message.payload.to_vec();
                    let headers = from_nats_headers(message.headers.as_ref());
                    return Some(Delivery::new(
                        subject,
                        payload,
                        headers,
                        std::sync::Arc::new(JetStreamAcker { message }),
                    ));
                }
                Err(error) => {
                    tracing::warn!(error = %error, "error receiving message");
                    continue;
                }
            }
        }
    }

    async fn unsubscribe(&mut self) {
        self.closed = true;
    }
}
