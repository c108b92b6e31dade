use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, trace, warn};

use crate::{Context, Error, Handler, Message, OutgoingMessage, Subscription};

/// Separator between the subscriber name and the topic in subscription names.
pub const SUBSCRIPTION_NAME_SEPARATOR: &str = "--";

/// Deterministic backend subscription name for `subscriber_name` on `topic`.
///
/// The name is stable across restarts so a restarted subscriber resumes the
/// same backlog instead of creating a fresh one.
#[must_use]
pub fn subscription_name(subscriber_name: &str, topic: &str) -> String {
    format!("{subscriber_name}{SUBSCRIPTION_NAME_SEPARATOR}{topic}")
}

/// Per-registration delivery options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// How long the backend waits for a completion signal before redelivering.
    pub ack_deadline: Duration,

    /// Ack automatically after the handler returns successfully.
    pub auto_ack: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            ack_deadline: Duration::from_secs(10),
            auto_ack: true,
        }
    }
}

impl SubscribeOptions {
    /// Sets the ack deadline.
    #[must_use]
    pub const fn ack_deadline(mut self, ack_deadline: Duration) -> Self {
        self.ack_deadline = ack_deadline;
        self
    }

    /// Enables or disables auto-ack.
    #[must_use]
    pub const fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }
}

/// A handler bound to a topic, handed to [`Provider::subscribe`].
#[derive(Clone)]
pub struct Registration {
    /// Topic to consume.
    pub topic: String,

    /// Identity of the consuming service.
    pub subscriber_name: String,

    /// Normalized handler.
    pub handler: Arc<dyn Handler>,

    /// Delivery options.
    pub options: SubscribeOptions,
}

impl Registration {
    /// Creates a registration.
    pub fn new(
        topic: impl Into<String>,
        subscriber_name: impl Into<String>,
        handler: Arc<dyn Handler>,
        options: SubscribeOptions,
    ) -> Self {
        Self {
            topic: topic.into(),
            subscriber_name: subscriber_name.into(),
            handler,
            options,
        }
    }

    /// Backend subscription name for this registration.
    #[must_use]
    pub fn name(&self) -> String {
        subscription_name(&self.subscriber_name, &self.topic)
    }

    /// Runs the handler for one delivered message.
    ///
    /// On success the message is acked when auto-ack is enabled. Failures are
    /// logged and the message is left unacknowledged for the backend to redeliver.
    pub async fn deliver(&self, cx: Context, message: Message) {
        let message_id = message.id.clone();

        match self.handler.handle(cx, message.clone()).await {
            Ok(()) => {
                trace!(topic = %self.topic, message_id = %message_id, "message handled");
                if self.options.auto_ack {
                    if let Err(e) = message.ack() {
                        warn!(topic = %self.topic, message_id = %message_id, error = %e, "handler completed message while auto-ack is enabled");
                    }
                }
            }
            Err(e) => {
                error!(topic = %self.topic, message_id = %message_id, error = %e, "failed to handle message");
            }
        }
    }
}

impl Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("topic", &self.topic)
            .field("subscriber_name", &self.subscriber_name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A message bus backend.
#[async_trait]
pub trait Provider: Debug + Send + Sync + 'static {
    /// Publishes `message` to `topic`, returning once the backend has accepted it.
    async fn publish(&self, cx: &Context, topic: &str, message: OutgoingMessage)
    -> Result<(), Error>;

    /// Starts background delivery for `registration` and returns immediately.
    fn subscribe(&self, registration: Registration) -> Subscription;

    /// Stops every subscription started by this provider and flushes in-flight work.
    async fn shutdown(&self) {}
}

#[async_trait]
impl<P> Provider for Arc<P>
where
    P: Provider + ?Sized,
{
    async fn publish(
        &self,
        cx: &Context,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<(), Error> {
        (**self).publish(cx, topic, message).await
    }

    fn subscribe(&self, registration: Registration) -> Subscription {
        (**self).subscribe(registration)
    }

    async fn shutdown(&self) {
        (**self).shutdown().await;
    }
}
