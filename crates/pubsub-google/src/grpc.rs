use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use google_cloud_auth::project::Config as AuthConfig;
use google_cloud_auth::token::DefaultTokenSourceProvider;
use google_cloud_googleapis::pubsub::v1::{self as pb, PubsubMessage, ReceivedMessage};
use google_cloud_googleapis::pubsub::v1::publisher_client::PublisherClient;
use google_cloud_googleapis::pubsub::v1::subscriber_client::SubscriberClient;
use google_cloud_token::{TokenSource, TokenSourceProvider};
use tonic::Request;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, ClientTlsConfig};
use tracing::debug;

use crate::{BackendError, Error, GoogleCloudConfig, PubSubBackend};

const SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/pubsub",
];

// Pub/Sub accepts ack deadlines between 10 and 600 seconds.
const MIN_ACK_DEADLINE_SECS: u64 = 10;
const MAX_ACK_DEADLINE_SECS: u64 = 600;

fn auth_config() -> AuthConfig<'static> {
    AuthConfig::default().with_scopes(&SCOPES)
}

/// Pub/Sub v1 over gRPC.
#[derive(Clone)]
pub struct GrpcBackend {
    project_id: String,
    publisher: PublisherClient<Channel>,
    subscriber: SubscriberClient<Channel>,
    token_source: Option<Arc<dyn TokenSource>>,
}

impl GrpcBackend {
    /// Opens a channel to the configured endpoint.
    ///
    /// Emulator connections are plaintext and unauthenticated; otherwise TLS
    /// with native roots and Application Default Credentials are used.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials cannot be loaded or the channel cannot be opened.
    pub async fn connect(config: &GoogleCloudConfig) -> Result<Self, Error> {
        let endpoint = config.endpoint();
        let mut builder = Channel::from_shared(endpoint.clone())?;

        let token_source = if config.emulator_host.is_some() {
            None
        } else {
            builder = builder.tls_config(ClientTlsConfig::new().with_native_roots())?;
            let provider = DefaultTokenSourceProvider::new(auth_config()).await?;
            Some(provider.token_source())
        };

        let channel = builder.connect().await?;
        debug!(endpoint = %endpoint, authenticated = token_source.is_some(), "connected to Pub/Sub");

        Ok(Self {
            project_id: config.project_id.clone(),
            publisher: PublisherClient::new(channel.clone()),
            subscriber: SubscriberClient::new(channel),
            token_source,
        })
    }

    fn topic_path(&self, topic: &str) -> String {
        format!("projects/{}/topics/{topic}", self.project_id)
    }

    fn subscription_path(&self, subscription: &str) -> String {
        format!("projects/{}/subscriptions/{subscription}", self.project_id)
    }

    async fn request<T>(&self, message: T) -> Result<Request<T>, BackendError> {
        let mut request = Request::new(message);

        if let Some(token_source) = &self.token_source {
            let token = token_source.token().await.map_err(BackendError::Auth)?;
            let header = if token.starts_with("Bearer ") {
                token
            } else {
                format!("Bearer {token}")
            };
            let value: MetadataValue<Ascii> = header
                .parse()
                .map_err(|e| BackendError::Auth(Box::new(e)))?;
            request.metadata_mut().insert("authorization", value);
        }

        Ok(request)
    }
}

impl Debug for GrpcBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcBackend")
            .field("project_id", &self.project_id)
            .field("authenticated", &self.token_source.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PubSubBackend for GrpcBackend {
    async fn create_topic(&self, topic: &str) -> Result<(), BackendError> {
        let request = self
            .request(pb::Topic {
                name: self.topic_path(topic),
                ..Default::default()
            })
            .await?;
        self.publisher.clone().create_topic(request).await?;
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), BackendError> {
        let request = self
            .request(pb::DeleteTopicRequest {
                topic: self.topic_path(topic),
            })
            .await?;
        self.publisher.clone().delete_topic(request).await?;
        Ok(())
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        ack_deadline: Duration,
    ) -> Result<(), BackendError> {
        let seconds = ack_deadline
            .as_secs()
            .clamp(MIN_ACK_DEADLINE_SECS, MAX_ACK_DEADLINE_SECS);
        let request = self
            .request(pb::Subscription {
                name: self.subscription_path(subscription),
                topic: self.topic_path(topic),
                ack_deadline_seconds: i32::try_from(seconds).unwrap_or(i32::MAX),
                ..Default::default()
            })
            .await?;
        self.subscriber.clone().create_subscription(request).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, message: PubsubMessage) -> Result<String, BackendError> {
        let request = self
            .request(pb::PublishRequest {
                topic: self.topic_path(topic),
                messages: vec![message],
            })
            .await?;
        let response = self.publisher.clone().publish(request).await?.into_inner();
        Ok(response.message_ids.into_iter().next().unwrap_or_default())
    }

    async fn pull(
        &self,
        subscription: &str,
        max_messages: i32,
    ) -> Result<Vec<ReceivedMessage>, BackendError> {
        let request = self
            .request(pb::PullRequest {
                subscription: self.subscription_path(subscription),
                max_messages,
                ..Default::default()
            })
            .await?;
        let response = self.subscriber.clone().pull(request).await?.into_inner();
        Ok(response.received_messages)
    }

    async fn acknowledge(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
    ) -> Result<(), BackendError> {
        let request = self
            .request(pb::AcknowledgeRequest {
                subscription: self.subscription_path(subscription),
                ack_ids,
            })
            .await?;
        self.subscriber.clone().acknowledge(request).await?;
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        seconds: i32,
    ) -> Result<(), BackendError> {
        let request = self
            .request(pb::ModifyAckDeadlineRequest {
                subscription: self.subscription_path(subscription),
                ack_ids,
                ack_deadline_seconds: seconds,
            })
            .await?;
        self.subscriber.clone().modify_ack_deadline(request).await?;
        Ok(())
    }
}
