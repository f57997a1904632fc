//! Durable message bus abstraction.
//!
//! The worker talks to the control plane over NATS JetStream, but every
//! subsystem holds an `Arc<dyn Bus>` so tests can swap in the in-process
//! [`MemoryBus`]. Subjects, streams, and header names live in
//! [`crate::consumer::subjects`].

mod memory;
mod nats;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{AckState, MemoryBus, RecordedMessage};
pub use nats::NatsBus;

/// Correlation id header copied onto streaming output messages.
pub const HEADER_REQUEST_ID: &str = "X-Request-ID";
/// Redelivery counter header, default 0 when absent.
pub const HEADER_RETRY_COUNT: &str = "Retry-Count";

/// String key/value message headers.
pub type Headers = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("stream setup failed: {0}")]
    Stream(String),
}

/// Acknowledgement backend for a delivered message.
#[async_trait]
pub(crate) trait Acker: Send + Sync {
    async fn ack(&self);
    async fn nak(&self);
}

/// A message delivered to a subscription.
#[derive(Clone)]
pub struct Delivery {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub(crate) fn new(
        subject: String,
        payload: Vec<u8>,
        headers: Headers,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            subject,
            payload,
            headers,
            acker,
        }
    }

    /// Acknowledge successful processing.
    pub async fn ack(&self) {
        self.acker.ack().await;
    }

    /// Negative-acknowledge for redelivery.
    pub async fn nak(&self) {
        self.acker.nak().await;
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Parsed `Retry-Count` header, defaulting to 0 on absence or garbage.
    pub fn retry_count(&self) -> u32 {
        self.header(HEADER_RETRY_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn request_id(&self) -> String {
        self.header(HEADER_REQUEST_ID).unwrap_or_default().to_string()
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .finish()
    }
}

/// A live subscription yielding deliveries until closed.
#[async_trait]
pub trait BusSubscription: Send {
    /// Next delivery, or `None` when the subscription is closed.
    async fn next(&mut self) -> Option<Delivery>;

    /// Stop receiving messages.
    async fn unsubscribe(&mut self);
}

/// Pub/sub handle shared by all subsystems.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn publish_with_headers(
        &self,
        subject: &str,
        headers: &Headers,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;

    /// Ephemeral subscription (run-protocol responses, cancellation).
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn BusSubscription>, BusError>;

    /// Stream-backed subscription with ack/nak semantics (consumer pumps).
    async fn durable_subscribe(&self, subject: &str) -> Result<Box<dyn BusSubscription>, BusError>;

    /// Ensure the worker stream exists with its declared subjects.
    async fn ensure_stream(&self) -> Result<(), BusError>;

    /// Graceful drain with a bounded deadline.
    async fn drain(&self, deadline: Duration) -> Result<(), BusError>;
}

/// NATS-style subject matching: `*` matches one token, `>` matches the rest.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(subject_matches("runs.start", "runs.start"));
        assert!(!subject_matches("runs.start", "runs.cancel"));
    }

    #[test]
    fn single_token_wildcard() {
        assert!(subject_matches("tasks.agent.*", "tasks.agent.aider"));
        assert!(!subject_matches("tasks.agent.*", "tasks.agent.a.b"));
        assert!(!subject_matches("tasks.agent.*", "tasks.agent"));
    }

    #[test]
    fn tail_wildcard() {
        assert!(subject_matches("runs.>", "runs.toolcall.request"));
        assert!(subject_matches("runs.>", "runs.start"));
        assert!(!subject_matches("runs.>", "tasks.result"));
    }
}
