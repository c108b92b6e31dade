//! In-memory provider for exercising pub/sub wiring in tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::InjectedFailure;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tidings_pubsub::{
    Acker, Context, Error, Message, OutgoingMessage, Provider, Registration, Subscription,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Completion signals recorded for an injected message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AckRecord {
    /// Number of acks.
    pub acks: usize,
    /// Number of nacks.
    pub nacks: usize,
}

#[derive(Debug, Default)]
struct CountingAcker {
    acks: AtomicUsize,
    nacks: AtomicUsize,
}

impl CountingAcker {
    fn record(&self) -> AckRecord {
        AckRecord {
            acks: self.acks.load(Ordering::SeqCst),
            nacks: self.nacks.load(Ordering::SeqCst),
        }
    }
}

impl Acker for CountingAcker {
    fn ack(&self) {
        self.acks.fetch_add(1, Ordering::SeqCst);
    }

    fn nack(&self) {
        self.nacks.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct State {
    published: Mutex<HashMap<String, Vec<OutgoingMessage>>>,
    registrations: Mutex<Vec<Registration>>,
    failures: Mutex<HashMap<String, String>>,
    token: CancellationToken,
}

/// Provider that records publishes and registrations instead of talking to a broker.
///
/// Nothing is delivered automatically; use [`MemoryProvider::inject`] to run
/// the handlers registered for a topic.
#[derive(Clone, Debug, Default)]
pub struct MemoryProvider {
    state: Arc<State>,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published to `topic`, oldest first.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<OutgoingMessage> {
        self.state
            .published
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of messages published across all topics.
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.state.published.lock().values().map(Vec::len).sum()
    }

    /// Topics that received at least one message, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.published.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Forgets every recorded message.
    pub fn clear(&self) {
        self.state.published.lock().clear();
    }

    /// Registrations received through [`Provider::subscribe`].
    #[must_use]
    pub fn registrations(&self) -> Vec<Registration> {
        self.state.registrations.lock().clone()
    }

    /// Makes every later publish to `topic` fail with `reason`.
    pub fn fail_with(&self, topic: impl Into<String>, reason: impl Into<String>) {
        self.state
            .failures
            .lock()
            .insert(topic.into(), reason.into());
    }

    /// Delivers `message` to every handler registered for `topic`.
    ///
    /// Returns the completion signals the message received.
    pub async fn inject(&self, topic: &str, message: OutgoingMessage) -> AckRecord {
        let registrations: Vec<Registration> = self
            .state
            .registrations
            .lock()
            .iter()
            .filter(|registration| registration.topic == topic)
            .cloned()
            .collect();

        let acker = Arc::new(CountingAcker::default());
        for registration in registrations {
            let delivered = Message::new(
                Uuid::new_v4().to_string(),
                message.metadata.clone(),
                message.data.clone(),
                acker.clone(),
            );
            registration.deliver(Context::current(), delivered).await;
        }

        acker.record()
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn publish(
        &self,
        _cx: &Context,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<(), Error> {
        if let Some(reason) = self.state.failures.lock().get(topic) {
            return Err(Error::publish(
                topic,
                InjectedFailure {
                    reason: reason.clone(),
                },
            ));
        }

        debug!(topic = %topic, bytes = message.len(), "recorded message");
        self.state
            .published
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    fn subscribe(&self, registration: Registration) -> Subscription {
        let subscription = Subscription::idle_with_token(
            registration.topic.clone(),
            registration.name(),
            self.state.token.child_token(),
        );
        self.state.registrations.lock().push(registration);
        subscription
    }

    async fn shutdown(&self) {
        self.state.token.cancel();
    }
}
