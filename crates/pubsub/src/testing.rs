use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use parking_lot::Mutex;

use crate::{Acker, Context, Error, Message, OutgoingMessage, Provider, Registration, Subscription};

#[derive(Clone, PartialEq, prost::Message)]
pub struct Account {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub email: String,
}

#[derive(Debug, Default)]
pub struct RecordingAcker {
    acks: AtomicUsize,
    nacks: AtomicUsize,
}

impl RecordingAcker {
    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn nacks(&self) -> usize {
        self.nacks.load(Ordering::SeqCst)
    }
}

impl Acker for RecordingAcker {
    fn ack(&self) {
        self.acks.fetch_add(1, Ordering::SeqCst);
    }

    fn nack(&self) {
        self.nacks.fetch_add(1, Ordering::SeqCst);
    }
}

/// Provider that records publishes and registrations, and can fail publishes.
#[derive(Debug, Default)]
pub struct RecordingProvider {
    published: Mutex<Vec<(String, OutgoingMessage)>>,
    publish_tags: Mutex<Vec<Option<String>>>,
    registrations: Mutex<Vec<Registration>>,
    failing: Mutex<HashMap<String, String>>,
    shutdowns: AtomicUsize,
}

impl RecordingProvider {
    pub fn published(&self) -> Vec<(String, OutgoingMessage)> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<OutgoingMessage> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Value of the `KeyValue` carried by each successful publish's context.
    pub fn publish_tags(&self) -> Vec<Option<String>> {
        self.publish_tags.lock().clone()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.registrations
            .lock()
            .iter()
            .map(|r| r.topic.clone())
            .collect()
    }

    pub fn fail_topic(&self, topic: &str, reason: &str) {
        self.failing
            .lock()
            .insert(topic.to_string(), reason.to_string());
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Delivers `message` through every registration for `topic`.
    pub async fn deliver(&self, topic: &str, message: &Message) {
        let registrations: Vec<Registration> = self
            .registrations
            .lock()
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect();

        for registration in registrations {
            registration.deliver(Context::new(), message.clone()).await;
        }
    }
}

#[async_trait]
impl Provider for RecordingProvider {
    async fn publish(
        &self,
        cx: &Context,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<(), Error> {
        if let Some(reason) = self.failing.lock().get(topic) {
            return Err(Error::publish(topic, reason.clone()));
        }
        self.publish_tags
            .lock()
            .push(cx.get::<KeyValue>().map(|kv| kv.value.to_string()));
        self.published.lock().push((topic.to_string(), message));
        Ok(())
    }

    fn subscribe(&self, registration: Registration) -> Subscription {
        let subscription = Subscription::idle(&registration.topic, registration.name());
        self.registrations.lock().push(registration);
        subscription
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn recording_provider() -> Arc<RecordingProvider> {
    Arc::new(RecordingProvider::default())
}
