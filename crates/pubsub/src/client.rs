use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::interceptor::AutoPublishQueue;
use crate::{
    AutoPublishConfig, AutoPublisher, Context, Error, Handler, HandlerOutput, Message, Metadata,
    NoopProvider, OutgoingMessage, Provider, PublishMetrics, RawHandler, Registration,
    SubscribeOptions, Subscription, SubscriptionState, TypedHandler, TypedHandlerWithContext,
    TypedHandlerWithMetadata,
};

const DEFAULT_SERVICE_NAME: &str = "unknown_service";

/// A service that registers all of its handlers in one place.
pub trait Subscriber {
    /// Registers handlers on `client`.
    ///
    /// # Errors
    ///
    /// Returns the first registration error.
    fn setup(&self, client: &Client) -> Result<(), Error>;
}

/// Method short name: the text after the last `/` of a full RPC method path.
pub(crate) fn method_name(full_method: &str) -> &str {
    full_method.rsplit('/').next().unwrap_or(full_method)
}

/// Routing table of RPC method short names to topics.
#[derive(Clone, Debug, Default)]
pub(crate) struct Routes(HashMap<String, String>);

impl Routes {
    fn insert(&mut self, method: &str, topic: &str) -> Result<(), Error> {
        let method = method_name(method);
        if method.is_empty() {
            return Err(Error::Configuration("route method must not be empty".into()));
        }
        if topic.is_empty() {
            return Err(Error::Configuration(format!(
                "route for method {method} has an empty topic"
            )));
        }

        match self.0.get(method) {
            Some(existing) if existing == topic => Ok(()),
            Some(existing) => Err(Error::Configuration(format!(
                "method {method} is already routed to topic {existing}"
            ))),
            None => {
                self.0.insert(method.to_string(), topic.to_string());
                Ok(())
            }
        }
    }

    pub(crate) fn topic_for_method(&self, full_method: &str) -> Option<&str> {
        self.0.get(method_name(full_method)).map(String::as_str)
    }
}

/// Provider wrapper that records publish metrics for a service.
#[derive(Debug)]
pub(crate) struct PublisherCore {
    provider: Arc<dyn Provider>,
    metrics: PublishMetrics,
    service_name: String,
}

impl PublisherCore {
    pub(crate) async fn publish(
        &self,
        cx: &Context,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<(), Error> {
        if topic.is_empty() {
            return Err(Error::Configuration("publish topic must not be empty".into()));
        }

        let bytes = message.len();
        self.provider.publish(cx, topic, message).await?;
        self.metrics.record(topic, &self.service_name, bytes);
        debug!(topic = %topic, bytes, "message published");
        Ok(())
    }
}

struct Inner {
    core: Arc<PublisherCore>,
    subscriber_name: String,
    routes: Arc<Routes>,
    auto_publish: AutoPublishConfig,
    queue: OnceLock<AutoPublishQueue>,
    subscribed: Mutex<HashMap<String, Subscription>>,
}

/// Binds a [`Provider`] to a service's routing table and handlers.
///
/// Clones share the same provider, routes and auto-publish worker.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Starts building a client on top of `provider`.
    pub fn builder<P>(provider: P) -> ClientBuilder
    where
        P: Provider,
    {
        ClientBuilder {
            provider: Arc::new(provider),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            subscriber_name: None,
            routes: Routes::default(),
            auto_publish: AutoPublishConfig::default(),
            metrics: None,
        }
    }

    /// A client backed by [`NoopProvider`] with no routes.
    #[must_use]
    pub fn noop() -> Self {
        Self::builder(NoopProvider::new()).build()
    }

    /// Service name used as the metrics label.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.inner.core.service_name
    }

    /// Identity used to name this client's subscriptions.
    #[must_use]
    pub fn subscriber_name(&self) -> &str {
        &self.inner.subscriber_name
    }

    /// Underlying provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.inner.core.provider
    }

    /// Topic routed for `full_method`, ignoring any `/package.Service/` prefix.
    #[must_use]
    pub fn topic_for_method(&self, full_method: &str) -> Option<&str> {
        self.inner.routes.topic_for_method(full_method)
    }

    /// Serializes and publishes `message` to `topic`.
    ///
    /// # Errors
    ///
    /// Returns the provider's publish error.
    pub async fn publish<M>(&self, cx: &Context, topic: &str, message: &M) -> Result<(), Error>
    where
        M: prost::Message,
    {
        self.publish_raw(cx, topic, OutgoingMessage::encode(message))
            .await
    }

    /// Serializes and publishes `message` to `topic` with extra attributes.
    ///
    /// # Errors
    ///
    /// Returns the provider's publish error.
    pub async fn publish_with_metadata<M>(
        &self,
        cx: &Context,
        topic: &str,
        message: &M,
        metadata: Metadata,
    ) -> Result<(), Error>
    where
        M: prost::Message,
    {
        let mut outgoing = OutgoingMessage::encode(message);
        outgoing.metadata = metadata;
        self.publish_raw(cx, topic, outgoing).await
    }

    /// Publishes an already serialized message.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for an empty topic, otherwise the
    /// provider's publish error.
    pub async fn publish_raw(
        &self,
        cx: &Context,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<(), Error> {
        self.inner.core.publish(cx, topic, message).await
    }

    /// Registers a callback that receives the raw envelope.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the registration is invalid.
    pub fn on_raw<F, Fut, O>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<Subscription, Error>
    where
        F: Fn(Context, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: HandlerOutput + 'static,
    {
        self.register(topic, options, Arc::new(RawHandler::new(callback)))
    }

    /// Registers a callback that receives the decoded payload.
    ///
    /// ```
    /// # use tidings_pubsub::{Client, SubscribeOptions};
    /// # #[derive(Clone, PartialEq, prost::Message)]
    /// # struct AccountCreated { #[prost(string, tag = "1")] id: String }
    /// # fn main() -> Result<(), tidings_pubsub::Error> {
    /// let client = Client::noop();
    /// client.on("account.created", SubscribeOptions::default(), |event: AccountCreated| async move {
    ///     println!("welcome {}", event.id);
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// Callbacks take exactly one argument, the decoded payload:
    ///
    /// ```compile_fail
    /// # use tidings_pubsub::{Client, SubscribeOptions};
    /// let client = Client::noop();
    /// client.on("pings", SubscribeOptions::default(), || async {});
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the registration is invalid.
    pub fn on<T, F, Fut, O>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<Subscription, Error>
    where
        T: prost::Message + Default + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: HandlerOutput + 'static,
    {
        self.register(topic, options, Arc::new(TypedHandler::<T, _>::new(callback)))
    }

    /// Registers a callback that receives the trace context and the decoded payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the registration is invalid.
    pub fn on_with_context<T, F, Fut, O>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<Subscription, Error>
    where
        T: prost::Message + Default + 'static,
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: HandlerOutput + 'static,
    {
        self.register(
            topic,
            options,
            Arc::new(TypedHandlerWithContext::<T, _>::new(callback)),
        )
    }

    /// Registers a callback that receives the trace context, the metadata and
    /// the decoded payload.
    ///
    /// Callbacks take at most three arguments:
    ///
    /// ```compile_fail
    /// # use tidings_pubsub::{Client, Context, Metadata, SubscribeOptions};
    /// # #[derive(Clone, PartialEq, prost::Message)]
    /// # struct Ping { #[prost(string, tag = "1")] id: String }
    /// let client = Client::noop();
    /// client.on_with_metadata(
    ///     "pings",
    ///     SubscribeOptions::default(),
    ///     |_: Context, _: Metadata, _: Ping, _: u32| async {},
    /// );
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the registration is invalid.
    pub fn on_with_metadata<T, F, Fut, O>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<Subscription, Error>
    where
        T: prost::Message + Default + 'static,
        F: Fn(Context, Metadata, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: HandlerOutput + 'static,
    {
        self.register(
            topic,
            options,
            Arc::new(TypedHandlerWithMetadata::<T, _>::new(callback)),
        )
    }

    /// Runs `subscriber`'s setup against this client.
    ///
    /// # Errors
    ///
    /// Returns the first registration error raised by the subscriber.
    pub fn subscribe<S>(&self, subscriber: &S) -> Result<(), Error>
    where
        S: Subscriber + ?Sized,
    {
        subscriber.setup(self)
    }

    /// Interceptor publishing successful RPC responses along the routing table.
    ///
    /// Starts the auto-publish worker on first use, so it must be called from
    /// within a tokio runtime.
    #[must_use]
    pub fn auto_publisher(&self) -> AutoPublisher {
        let queue = self.inner.queue.get_or_init(|| {
            AutoPublishQueue::start(self.inner.core.clone(), &self.inner.auto_publish)
        });
        AutoPublisher::new(self.inner.routes.clone(), queue.clone())
    }

    /// Drains queued auto-publish jobs, then shuts the provider down.
    pub async fn shutdown(&self) {
        if let Some(queue) = self.inner.queue.get() {
            queue.shutdown().await;
        }
        self.inner.core.provider.shutdown().await;
        info!(service = %self.service_name(), "pub/sub client shut down");
    }

    fn register(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: Arc<dyn Handler>,
    ) -> Result<Subscription, Error> {
        if topic.is_empty() {
            return Err(Error::Configuration(
                "subscription topic must not be empty".into(),
            ));
        }
        if self.inner.subscriber_name.is_empty() {
            return Err(Error::Configuration(
                "subscriber name must not be empty".into(),
            ));
        }

        // A stopped subscription frees its topic for a new registration.
        let mut subscribed = self.inner.subscribed.lock();
        if let Some(existing) = subscribed.get(topic) {
            if existing.state() != SubscriptionState::Stopped {
                return Err(Error::Configuration(format!(
                    "topic {topic} is already subscribed by {}",
                    self.inner.subscriber_name
                )));
            }
        }

        let registration = Registration::new(
            topic,
            self.inner.subscriber_name.clone(),
            handler,
            options,
        );
        info!(topic = %topic, subscription = %registration.name(), "subscribing");
        let subscription = self.inner.core.provider.subscribe(registration);
        subscribed.insert(topic.to_string(), subscription.clone());
        Ok(subscription)
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("provider", &self.inner.core.provider)
            .field("service_name", &self.inner.core.service_name)
            .field("subscriber_name", &self.inner.subscriber_name)
            .field("routes", &self.inner.routes)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Client`].
#[derive(Debug)]
pub struct ClientBuilder {
    provider: Arc<dyn Provider>,
    service_name: String,
    subscriber_name: Option<String>,
    routes: Routes,
    auto_publish: AutoPublishConfig,
    metrics: Option<PublishMetrics>,
}

impl ClientBuilder {
    /// Service name used as the metrics label. Defaults to `unknown_service`.
    #[must_use]
    pub fn service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Subscriber identity used in subscription names. Defaults to the service name.
    #[must_use]
    pub fn subscriber_name(mut self, subscriber_name: impl Into<String>) -> Self {
        self.subscriber_name = Some(subscriber_name.into());
        self
    }

    /// Routes successful responses of `method` to `topic`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if either side is empty or `method` is
    /// already routed to a different topic.
    pub fn route(mut self, method: &str, topic: &str) -> Result<Self, Error> {
        self.routes.insert(method, topic)?;
        Ok(self)
    }

    /// Adds several routes at once.
    ///
    /// # Errors
    ///
    /// Returns the first invalid route.
    pub fn routes<I, M, T>(mut self, routes: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (M, T)>,
        M: AsRef<str>,
        T: AsRef<str>,
    {
        for (method, topic) in routes {
            self.routes.insert(method.as_ref(), topic.as_ref())?;
        }
        Ok(self)
    }

    /// Auto-publish queue and failure settings.
    #[must_use]
    pub fn auto_publish(mut self, config: AutoPublishConfig) -> Self {
        self.auto_publish = config;
        self
    }

    /// Metrics to record publishes into. Defaults to [`PublishMetrics::global`].
    #[must_use]
    pub fn metrics(mut self, metrics: PublishMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the client.
    #[must_use]
    pub fn build(self) -> Client {
        let subscriber_name = self
            .subscriber_name
            .unwrap_or_else(|| self.service_name.clone());

        Client {
            inner: Arc::new(Inner {
                core: Arc::new(PublisherCore {
                    provider: self.provider,
                    metrics: self.metrics.unwrap_or_else(PublishMetrics::global),
                    service_name: self.service_name,
                }),
                subscriber_name,
                routes: Arc::new(self.routes),
                auto_publish: self.auto_publish,
                queue: OnceLock::new(),
                subscribed: Mutex::new(HashMap::new()),
            }),
        }
    }
}
