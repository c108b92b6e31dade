use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use google_cloud_googleapis::pubsub::v1::{PubsubMessage, ReceivedMessage};
use parking_lot::Mutex;

use crate::{BackendError, PubSubBackend};

/// In-process stand-in for the Pub/Sub service.
#[derive(Debug, Default)]
pub struct FakeBackend {
    topics: Mutex<HashSet<String>>,
    topic_creates: Mutex<HashMap<String, usize>>,
    failing_topic_creates: AtomicUsize,
    subscriptions: Mutex<HashMap<String, String>>,
    subscription_creates: AtomicUsize,
    failing_subscription_creates: AtomicUsize,
    published: Mutex<HashMap<String, Vec<PubsubMessage>>>,
    queues: Mutex<HashMap<String, VecDeque<ReceivedMessage>>>,
    acked: Mutex<HashMap<String, Vec<String>>>,
    nacked: Mutex<HashMap<String, Vec<String>>>,
    publish_delay: Mutex<Option<Duration>>,
    next_id: AtomicUsize,
}

impl FakeBackend {
    pub fn seed_topic(&self, topic: &str) {
        self.topics.lock().insert(topic.to_string());
    }

    pub fn seed_subscription(&self, subscription: &str, topic: &str) {
        self.seed_topic(topic);
        self.subscriptions
            .lock()
            .insert(subscription.to_string(), topic.to_string());
    }

    pub fn fail_topic_creates(&self, count: usize) {
        self.failing_topic_creates.store(count, Ordering::SeqCst);
    }

    pub fn fail_subscription_creates(&self, count: usize) {
        self.failing_subscription_creates
            .store(count, Ordering::SeqCst);
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.lock() = Some(delay);
    }

    pub fn create_topic_calls(&self, topic: &str) -> usize {
        self.topic_creates.lock().get(topic).copied().unwrap_or(0)
    }

    pub fn create_subscription_calls(&self) -> usize {
        self.subscription_creates.load(Ordering::SeqCst)
    }

    pub fn published(&self, topic: &str) -> Vec<PubsubMessage> {
        self.published.lock().get(topic).cloned().unwrap_or_default()
    }

    pub fn queued(&self, subscription: &str) -> usize {
        self.queues.lock().get(subscription).map_or(0, VecDeque::len)
    }

    pub fn acked(&self, subscription: &str) -> Vec<String> {
        self.acked.lock().get(subscription).cloned().unwrap_or_default()
    }

    pub fn nacked(&self, subscription: &str) -> Vec<String> {
        self.nacked.lock().get(subscription).cloned().unwrap_or_default()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PubSubBackend for FakeBackend {
    async fn create_topic(&self, topic: &str) -> Result<(), BackendError> {
        *self
            .topic_creates
            .lock()
            .entry(topic.to_string())
            .or_default() += 1;
        tokio::time::sleep(Duration::from_millis(10)).await;

        if Self::take_failure(&self.failing_topic_creates) {
            return Err(tonic::Status::unavailable("topic service unavailable").into());
        }
        if !self.topics.lock().insert(topic.to_string()) {
            return Err(tonic::Status::already_exists("topic exists").into());
        }
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), BackendError> {
        if self.topics.lock().remove(topic) {
            Ok(())
        } else {
            Err(tonic::Status::not_found("no such topic").into())
        }
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        _ack_deadline: Duration,
    ) -> Result<(), BackendError> {
        self.subscription_creates.fetch_add(1, Ordering::SeqCst);

        if Self::take_failure(&self.failing_subscription_creates) {
            return Err(tonic::Status::unavailable("subscription service unavailable").into());
        }
        if !self.topics.lock().contains(topic) {
            return Err(tonic::Status::not_found("no such topic").into());
        }

        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(subscription) {
            return Err(tonic::Status::already_exists("subscription exists").into());
        }
        subscriptions.insert(subscription.to_string(), topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, message: PubsubMessage) -> Result<String, BackendError> {
        let delay = *self.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let message = PubsubMessage {
            message_id: id.clone(),
            ..message
        };

        let bound: Vec<String> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|(_, t)| t.as_str() == topic)
            .map(|(s, _)| s.clone())
            .collect();
        let mut queues = self.queues.lock();
        for subscription in bound {
            queues
                .entry(subscription)
                .or_default()
                .push_back(ReceivedMessage {
                    ack_id: format!("ack-{id}"),
                    message: Some(message.clone()),
                    ..Default::default()
                });
        }
        drop(queues);

        self.published
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(message);
        Ok(id)
    }

    async fn pull(
        &self,
        subscription: &str,
        max_messages: i32,
    ) -> Result<Vec<ReceivedMessage>, BackendError> {
        let max = usize::try_from(max_messages).unwrap_or(0);
        let batch: Vec<ReceivedMessage> = {
            let mut queues = self.queues.lock();
            let queue = queues.entry(subscription.to_string()).or_default();
            let count = queue.len().min(max);
            queue.drain(..count).collect()
        };

        if batch.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(batch)
    }

    async fn acknowledge(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
    ) -> Result<(), BackendError> {
        self.acked
            .lock()
            .entry(subscription.to_string())
            .or_default()
            .extend(ack_ids);
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        seconds: i32,
    ) -> Result<(), BackendError> {
        if seconds == 0 {
            self.nacked
                .lock()
                .entry(subscription.to_string())
                .or_default()
                .extend(ack_ids);
        }
        Ok(())
    }
}
