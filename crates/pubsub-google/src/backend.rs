use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use google_cloud_googleapis::pubsub::v1::{PubsubMessage, ReceivedMessage};

use crate::BackendError;

/// Wire operations the provider needs from Pub/Sub.
///
/// Topic and subscription arguments are short ids; implementations qualify
/// them with their project.
#[async_trait]
pub trait PubSubBackend: Debug + Send + Sync + 'static {
    /// Creates `topic`.
    async fn create_topic(&self, topic: &str) -> Result<(), BackendError>;

    /// Deletes `topic`.
    async fn delete_topic(&self, topic: &str) -> Result<(), BackendError>;

    /// Creates `subscription` bound to `topic`.
    async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        ack_deadline: Duration,
    ) -> Result<(), BackendError>;

    /// Publishes one message and returns its server-assigned id.
    async fn publish(&self, topic: &str, message: PubsubMessage) -> Result<String, BackendError>;

    /// Pulls up to `max_messages` messages; may return none.
    async fn pull(
        &self,
        subscription: &str,
        max_messages: i32,
    ) -> Result<Vec<ReceivedMessage>, BackendError>;

    /// Acknowledges delivered messages.
    async fn acknowledge(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
    ) -> Result<(), BackendError>;

    /// Changes the ack deadline of delivered messages; zero requests redelivery.
    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        seconds: i32,
    ) -> Result<(), BackendError>;
}

#[async_trait]
impl<B> PubSubBackend for Arc<B>
where
    B: PubSubBackend + ?Sized,
{
    async fn create_topic(&self, topic: &str) -> Result<(), BackendError> {
        (**self).create_topic(topic).await
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), BackendError> {
        (**self).delete_topic(topic).await
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        ack_deadline: Duration,
    ) -> Result<(), BackendError> {
        (**self)
            .create_subscription(subscription, topic, ack_deadline)
            .await
    }

    async fn publish(&self, topic: &str, message: PubsubMessage) -> Result<String, BackendError> {
        (**self).publish(topic, message).await
    }

    async fn pull(
        &self,
        subscription: &str,
        max_messages: i32,
    ) -> Result<Vec<ReceivedMessage>, BackendError> {
        (**self).pull(subscription, max_messages).await
    }

    async fn acknowledge(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
    ) -> Result<(), BackendError> {
        (**self).acknowledge(subscription, ack_ids).await
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        seconds: i32,
    ) -> Result<(), BackendError> {
        (**self)
            .modify_ack_deadline(subscription, ack_ids, seconds)
            .await
    }
}
