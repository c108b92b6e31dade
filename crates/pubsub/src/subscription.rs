use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::Error;

/// Lifecycle of a background subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Binding the subscription to its topic on the backend.
    Creating,

    /// Receiving messages.
    Active,

    /// Creation failed; waiting `delay` before attempt number `attempt`.
    Retrying {
        /// Number of failed attempts so far.
        attempt: u32,
        /// Sleep before the next attempt.
        delay: Duration,
    },

    /// The background task has exited.
    Stopped,
}

struct StopOnDrop(Arc<watch::Sender<SubscriptionState>>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.send_replace(SubscriptionState::Stopped);
    }
}

/// Handle to a subscription started by a provider.
///
/// Dropping the handle leaves the subscription running; use [`Subscription::cancel`]
/// or [`Subscription::stop`] to end it.
#[derive(Clone, Debug)]
pub struct Subscription {
    topic: String,
    name: String,
    state: Arc<watch::Sender<SubscriptionState>>,
    token: CancellationToken,
    supervised: bool,
}

impl Subscription {
    /// Spawns `run` on `tracker` as the supervised task behind a new subscription.
    ///
    /// The state moves to [`SubscriptionState::Stopped`] once `run` returns.
    pub fn spawn<F, Fut>(
        topic: impl Into<String>,
        name: impl Into<String>,
        token: CancellationToken,
        tracker: &TaskTracker,
        run: F,
    ) -> Self
    where
        F: FnOnce(SubscriptionDriver) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let topic = topic.into();
        let name = name.into();
        let state = Arc::new(watch::Sender::new(SubscriptionState::Creating));

        let driver = SubscriptionDriver {
            topic: topic.clone(),
            name: name.clone(),
            state: state.clone(),
            token: token.clone(),
        };
        let guard = StopOnDrop(state.clone());
        let fut = run(driver);

        tracker.spawn(async move {
            let _guard = guard;
            fut.await;
        });

        Self {
            topic,
            name,
            state,
            token,
            supervised: true,
        }
    }

    /// Creates a handle with no background task that reports `Active` until cancelled.
    pub fn idle(topic: impl Into<String>, name: impl Into<String>) -> Self {
        Self::idle_with_token(topic, name, CancellationToken::new())
    }

    /// Like [`Subscription::idle`], stopping when `token` is cancelled.
    pub fn idle_with_token(
        topic: impl Into<String>,
        name: impl Into<String>,
        token: CancellationToken,
    ) -> Self {
        Self {
            topic: topic.into(),
            name: name.into(),
            state: Arc::new(watch::Sender::new(SubscriptionState::Active)),
            token,
            supervised: false,
        }
    }

    /// Topic the subscription is bound to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Backend subscription name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        if !self.supervised && self.token.is_cancelled() {
            return SubscriptionState::Stopped;
        }
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Waits until the subscription is receiving messages.
    ///
    /// # Errors
    ///
    /// Returns `Error::Shutdown` if the subscription stops before becoming active.
    pub async fn wait_until_active(&self) -> Result<(), Error> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, SubscriptionState::Active | SubscriptionState::Stopped))
            .await
            .map_err(|_| Error::Shutdown)?
            .clone();

        match state {
            SubscriptionState::Active if self.state() == SubscriptionState::Active => Ok(()),
            _ => Err(Error::Shutdown),
        }
    }

    /// Requests the background task to stop without waiting for it.
    pub fn cancel(&self) {
        self.token.cancel();
        if !self.supervised {
            self.state.send_replace(SubscriptionState::Stopped);
        }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once cancellation has been requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Cancels the subscription and waits for its task to exit.
    pub async fn stop(&self) {
        self.cancel();
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SubscriptionState::Stopped).await;
    }
}

/// The background task's side of a [`Subscription`].
#[derive(Debug)]
pub struct SubscriptionDriver {
    topic: String,
    name: String,
    state: Arc<watch::Sender<SubscriptionState>>,
    token: CancellationToken,
}

impl SubscriptionDriver {
    /// Publishes a new state to every handle.
    pub fn set_state(&self, state: SubscriptionState) {
        debug!(topic = %self.topic, subscription = %self.name, state = ?state, "subscription state changed");
        self.state.send_replace(state);
    }

    /// Topic the subscription is bound to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Backend subscription name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancellation token owned by the subscription.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the subscription has been asked to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the subscription has been asked to stop.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_spawned_subscription_reports_states() {
        let tracker = TaskTracker::new();
        let subscription = Subscription::spawn(
            "orders",
            "billing--orders",
            CancellationToken::new(),
            &tracker,
            |driver| async move {
                driver.set_state(SubscriptionState::Retrying {
                    attempt: 1,
                    delay: Duration::from_millis(5),
                });
                driver.set_state(SubscriptionState::Active);
                driver.cancelled().await;
            },
        );

        subscription.wait_until_active().await.unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Active);
        assert_eq!(subscription.name(), "billing--orders");

        subscription.stop().await;
        assert_eq!(subscription.state(), SubscriptionState::Stopped);
        assert!(subscription.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_until_active_fails_when_task_exits_early() {
        let tracker = TaskTracker::new();
        let subscription = Subscription::spawn(
            "orders",
            "billing--orders",
            CancellationToken::new(),
            &tracker,
            |_driver| async {},
        );

        assert_matches!(subscription.wait_until_active().await, Err(Error::Shutdown));
    }

    #[tokio::test]
    async fn test_dropping_handle_keeps_task_running() {
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let subscription = Subscription::spawn(
            "orders",
            "billing--orders",
            token.clone(),
            &tracker,
            |driver| async move {
                driver.set_state(SubscriptionState::Active);
                driver.cancelled().await;
            },
        );
        let mut state = subscription.watch_state();
        drop(subscription);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*state.borrow_and_update(), SubscriptionState::Active);

        token.cancel();
        tracker.close();
        tracker.wait().await;
        assert_eq!(*state.borrow(), SubscriptionState::Stopped);
    }

    #[tokio::test]
    async fn test_idle_subscription_stops_on_cancel() {
        let token = CancellationToken::new();
        let subscription = Subscription::idle_with_token("audit", "svc--audit", token.clone());

        assert_eq!(subscription.state(), SubscriptionState::Active);
        subscription.wait_until_active().await.unwrap();

        token.cancel();
        assert_eq!(subscription.state(), SubscriptionState::Stopped);
        subscription.stop().await;
    }
}
