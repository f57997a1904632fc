//! In-process bus implementation backed by a `tokio::sync::broadcast`
//! channel.
//!
//! Every publish is recorded so tests can assert on what was sent, and each
//! recorded message carries an observable ack state. Durable and ephemeral
//! subscriptions behave identically here.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{subject_matches, Acker, Bus, BusError, BusSubscription, Delivery, Headers};

const CHANNEL_CAPACITY: usize = 1024;

/// Ack outcome of a recorded message: 0 = pending, 1 = acked, 2 = naked.
#[derive(Debug, Default)]
pub struct AckState(AtomicU8);

impl AckState {
    pub fn is_acked(&self) -> bool {
        self.0.load(Ordering::SeqCst) == 1
    }

    pub fn is_naked(&self) -> bool {
        self.0.load(Ordering::SeqCst) == 2
    }
}

#[async_trait]
impl Acker for AckState {
    async fn ack(&self) {
        let _ = self.0.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);
    }

    async fn nak(&self) {
        let _ = self.0.compare_exchange(0, 2, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// A message recorded by [`MemoryBus::publish`].
#[derive(Clone)]
pub struct RecordedMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub ack_state: Arc<AckState>,
}

impl RecordedMessage {
    /// Deserialize the payload as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// In-memory [`Bus`] for tests and single-process setups.
pub struct MemoryBus {
    sender: broadcast::Sender<RecordedMessage>,
    log: Mutex<Vec<RecordedMessage>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            log: Mutex::new(Vec::new()),
        }
    }

    /// All messages published so far on subjects matching `pattern`.
    pub fn published(&self, pattern: &str) -> Vec<RecordedMessage> {
        self.log
            .lock()
            .map(|log| {
                log.iter()
                    .filter(|m| subject_matches(pattern, &m.subject))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn record_and_send(&self, subject: &str, headers: Headers, payload: Vec<u8>) -> RecordedMessage {
        let message = RecordedMessage {
            subject: subject.to_string(),
            payload,
            headers,
            ack_state: Arc::new(AckState::default()),
        };
        if let Ok(mut log) = self.log.lock() {
            log.push(message.clone());
        }
        // Zero receivers is fine; the log still records the publish.
        let _ = self.sender.send(message.clone());
        message
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.record_and_send(subject, Headers::new(), payload);
        Ok(())
    }

    async fn publish_with_headers(
        &self,
        subject: &str,
        headers: &Headers,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.record_and_send(subject, headers.clone(), payload);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn BusSubscription>, BusError> {
        Ok(Box::new(MemorySubscription {
            pattern: subject.to_string(),
            receiver: Some(self.sender.subscribe()),
        }))
    }

    async fn durable_subscribe(&self, subject: &str) -> Result<Box<dyn BusSubscription>, BusError> {
        self.subscribe(subject).await
    }

    async fn ensure_stream(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn drain(&self, _deadline: Duration) -> Result<(), BusError> {
        Ok(())
    }
}

struct MemorySubscription {
    pattern: String,
    receiver: Option<broadcast::Receiver<RecordedMessage>>,
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(message) if subject_matches(&self.pattern, &message.subject) => {
                    return Some(Delivery::new(
                        message.subject.clone(),
                        message.payload.clone(),
                        message.headers.clone(),
                        message.ack_state.clone(),
                    ));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn unsubscribe(&mut self) {
        self.receiver = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_receive() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("runs.start").await.unwrap();
        bus.publish("runs.start", b"hello".to_vec()).await.unwrap();

        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.subject, "runs.start");
        assert_eq!(delivery.payload, b"hello");
    }

    #[tokio::test]
    async fn wildcard_subscription_filters() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("tasks.agent.*").await.unwrap();
        bus.publish("runs.start", b"no".to_vec()).await.unwrap();
        bus.publish("tasks.agent.aider", b"yes".to_vec()).await.unwrap();

        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.subject, "tasks.agent.aider");
    }

    #[tokio::test]
    async fn ack_state_is_observable() {
        let bus = MemoryBus::new();
        let mut sub = bus.durable_subscribe("runs.start").await.unwrap();
        bus.publish("runs.start", b"x".to_vec()).await.unwrap();

        let delivery = sub.next().await.unwrap();
        delivery.ack().await;

        let recorded = bus.published("runs.start");
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].ack_state.is_acked());
        assert!(!recorded[0].ack_state.is_naked());
    }

    #[tokio::test]
    async fn first_ack_wins_over_later_nak() {
        let bus = MemoryBus::new();
        let mut sub = bus.durable_subscribe("runs.start").await.unwrap();
        bus.publish("runs.start", b"x".to_vec()).await.unwrap();

        let delivery = sub.next().await.unwrap();
        delivery.ack().await;
        delivery.nak().await;
        assert!(bus.published("runs.start")[0].ack_state.is_acked());
    }

    #[tokio::test]
    async fn headers_round_trip() {
        let bus = MemoryBus::new();
        let mut headers = Headers::new();
        headers.insert(super::super::HEADER_REQUEST_ID.to_string(), "R-1".to_string());

        let mut sub = bus.subscribe("tasks.output").await.unwrap();
        bus.publish_with_headers("tasks.output", &headers, b"line".to_vec())
            .await
            .unwrap();

        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.request_id(), "R-1");
        assert_eq!(delivery.retry_count(), 0);
    }

    #[tokio::test]
    async fn retry_count_parses_header() {
        let bus = MemoryBus::new();
        let mut headers = Headers::new();
        headers.insert(super::super::HEADER_RETRY_COUNT.to_string(), "3".to_string());

        let mut sub = bus.subscribe("tasks.agent.*").await.unwrap();
        bus.publish_with_headers("tasks.agent.x", &headers, b"p".to_vec())
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().retry_count(), 3);
    }
}
