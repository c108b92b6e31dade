//! Google Cloud Pub/Sub provider.
//!
//! Topics are created on first publish and subscriptions on first subscribe;
//! both treat "already exists" as success. Each subscription runs a supervised
//! pull loop that retries setup with exponential backoff and carries trace
//! context between publisher and subscriber through message attributes.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod backend;
mod backoff;
mod config;
mod error;
mod grpc;
pub mod propagation;
mod receiver;
mod topics;

#[cfg(test)]
mod testing;

pub use backend::PubSubBackend;
pub use backoff::Backoff;
pub use config::{
    EMULATOR_HOST_ENV, GoogleCloudConfig, GoogleCloudOptions, PROJECT_ID_ENV, provider_from_config,
    provider_from_env,
};
pub use error::{BackendError, Error};
pub use grpc::GrpcBackend;
pub use topics::Topic;

use std::sync::Arc;

use async_trait::async_trait;
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{KeyValue, global};
use tidings_pubsub::{
    Context, Error as PubSubError, Metadata, OutgoingMessage, Provider, Registration, Subscription,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use receiver::Receiver;
use topics::TopicCache;

const TRACER_NAME: &str = "tidings-pubsub-google";

/// Provider backed by Google Cloud Pub/Sub.
#[derive(Debug)]
pub struct GoogleCloud<B = GrpcBackend> {
    backend: Arc<B>,
    topics: Arc<TopicCache<B>>,
    options: GoogleCloudOptions,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl GoogleCloud<GrpcBackend> {
    /// Connects to Pub/Sub over gRPC.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials cannot be loaded or the channel cannot be opened.
    pub async fn connect(
        config: &GoogleCloudConfig,
        options: GoogleCloudOptions,
    ) -> Result<Self, Error> {
        let backend = GrpcBackend::connect(config).await?;
        Ok(Self::with_backend(backend, options))
    }
}

impl<B> GoogleCloud<B>
where
    B: PubSubBackend,
{
    /// Creates a provider over any backend implementation.
    pub fn with_backend(backend: B, options: GoogleCloudOptions) -> Self {
        let backend = Arc::new(backend);

        Self {
            topics: Arc::new(TopicCache::new(backend.clone())),
            backend,
            options,
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Returns the handle for `topic`, creating the topic on first use.
    ///
    /// # Errors
    ///
    /// Returns the backend error if creation fails for a reason other than
    /// the topic already existing.
    pub async fn topic(&self, topic: &str) -> Result<Topic, BackendError> {
        self.topics.get(topic).await
    }

    /// Deletes `topic` and forgets its cached handle.
    ///
    /// # Errors
    ///
    /// Returns the backend error; a missing topic is not an error.
    pub async fn delete_topic(&self, topic: &str) -> Result<(), BackendError> {
        self.topics.evict(topic);
        match self.backend.delete_topic(topic).await {
            Ok(()) => {
                info!(topic = %topic, "deleted topic");
                Ok(())
            }
            Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send(
        &self,
        topic: &str,
        message: OutgoingMessage,
        attributes: Metadata,
    ) -> Result<String, BackendError> {
        let topic = self.topics.get(topic).await?;
        self.backend
            .publish(
                &topic.id,
                PubsubMessage {
                    data: message.data.into(),
                    attributes,
                    ..Default::default()
                },
            )
            .await
    }
}

#[async_trait]
impl<B> Provider for GoogleCloud<B>
where
    B: PubSubBackend,
{
    async fn publish(
        &self,
        cx: &Context,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<(), PubSubError> {
        let tracer = global::tracer(TRACER_NAME);
        let span = tracer
            .span_builder(format!("{topic} publish"))
            .with_kind(SpanKind::Producer)
            .with_attributes([
                KeyValue::new("messaging.system", "gcp_pubsub"),
                KeyValue::new("messaging.destination.name", topic.to_string()),
            ])
            .start_with_context(&tracer, cx);
        let cx = cx.with_span(span);

        let mut attributes = Metadata::new();
        propagation::inject(&cx, &mut attributes);
        attributes.extend(message.metadata.clone());

        let timeout = self.options.publish_timeout;
        let result = tokio::time::timeout(timeout, self.send(topic, message, attributes)).await;

        let span = cx.span();
        match result {
            Ok(Ok(message_id)) => {
                debug!(topic = %topic, message_id = %message_id, "published message");
                span.end();
                Ok(())
            }
            Ok(Err(e)) => {
                span.set_status(Status::error(e.to_string()));
                span.end();
                Err(PubSubError::publish(topic, e))
            }
            Err(_) => {
                span.set_status(Status::error("publish timed out"));
                span.end();
                Err(PubSubError::Timeout {
                    topic: topic.to_string(),
                    timeout,
                })
            }
        }
    }

    fn subscribe(&self, registration: Registration) -> Subscription {
        let topic = registration.topic.clone();
        let name = registration.name();
        let receiver = Receiver {
            backend: self.backend.clone(),
            topics: self.topics.clone(),
            registration,
            options: self.options.clone(),
        };

        Subscription::spawn(
            topic,
            name,
            self.token.child_token(),
            &self.tracker,
            |driver| receiver.run(driver),
        )
    }

    async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Pub/Sub provider shut down");
    }
}
