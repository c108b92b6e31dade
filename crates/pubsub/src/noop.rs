use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Context, Error, OutgoingMessage, Provider, Registration, Subscription};

/// Provider for services running with pub/sub disabled.
///
/// Publishing succeeds without I/O and subscriptions never deliver.
#[derive(Debug, Default)]
pub struct NoopProvider {
    token: CancellationToken,
}

impl NoopProvider {
    /// Creates a new no-op provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Provider for NoopProvider {
    async fn publish(
        &self,
        _cx: &Context,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<(), Error> {
        debug!(topic = %topic, bytes = message.len(), "discarding message (pub/sub disabled)");
        Ok(())
    }

    fn subscribe(&self, registration: Registration) -> Subscription {
        debug!(topic = %registration.topic, "ignoring subscription (pub/sub disabled)");
        Subscription::idle_with_token(
            registration.topic.clone(),
            registration.name(),
            self.token.child_token(),
        )
    }

    async fn shutdown(&self) {
        self.token.cancel();
    }
}
