use std::sync::Arc;

use google_cloud_googleapis::pubsub::v1::ReceivedMessage;
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use opentelemetry::{KeyValue, global};
use tidings_pubsub::{Acker, Message, Registration, SubscriptionDriver, SubscriptionState};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::topics::TopicCache;
use crate::{Backoff, BackendError, GoogleCloudOptions, PubSubBackend, propagation};

const TRACER_NAME: &str = "tidings-pubsub-google";

#[derive(Debug)]
enum Completion {
    Ack(String),
    Nack(String),
}

/// Forwards completion signals of one pulled message to the flush task.
#[derive(Debug)]
struct PulledAcker {
    ack_id: String,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Acker for PulledAcker {
    fn ack(&self) {
        let _ = self.completions.send(Completion::Ack(self.ack_id.clone()));
    }

    fn nack(&self) {
        let _ = self.completions.send(Completion::Nack(self.ack_id.clone()));
    }
}

/// Supervised task behind one subscription.
pub(crate) struct Receiver<B> {
    pub(crate) backend: Arc<B>,
    pub(crate) topics: Arc<TopicCache<B>>,
    pub(crate) registration: Registration,
    pub(crate) options: GoogleCloudOptions,
}

impl<B> Receiver<B>
where
    B: PubSubBackend,
{
    pub(crate) async fn run(self, driver: SubscriptionDriver) {
        if !self.ensure_subscription(&driver).await {
            return;
        }
        driver.set_state(SubscriptionState::Active);
        info!(topic = %driver.topic(), subscription = %driver.name(), "subscription active");

        let (completions, pending) = mpsc::unbounded_channel();
        let done = CancellationToken::new();
        let flusher = tokio::spawn(flush_completions(
            self.backend.clone(),
            driver.name().to_string(),
            pending,
            done.clone(),
        ));

        self.receive(&driver, &completions).await;

        done.cancel();
        if let Err(e) = flusher.await {
            warn!(subscription = %driver.name(), error = %e, "ack flush task failed");
        }
        info!(topic = %driver.topic(), subscription = %driver.name(), "subscription stopped");
    }

    /// Creates the topic and subscription, retrying until success or cancellation.
    ///
    /// Returns `false` if cancelled first.
    async fn ensure_subscription(&self, driver: &SubscriptionDriver) -> bool {
        let mut backoff = self.backoff();

        loop {
            driver.set_state(SubscriptionState::Creating);
            let attempt = async {
                let topic = self.topics.get(driver.topic()).await?;
                self.backend
                    .create_subscription(driver.name(), &topic.id, self.registration.options.ack_deadline)
                    .await
            };

            let result = tokio::select! {
                () = driver.cancelled() => return false,
                result = attempt => result,
            };

            match result {
                Ok(()) => {
                    info!(topic = %driver.topic(), subscription = %driver.name(), "created subscription");
                    return true;
                }
                Err(BackendError::AlreadyExists(_)) => {
                    debug!(topic = %driver.topic(), subscription = %driver.name(), "subscription already exists");
                    return true;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    driver.set_state(SubscriptionState::Retrying {
                        attempt: backoff.attempt(),
                        delay,
                    });
                    warn!(
                        topic = %driver.topic(),
                        subscription = %driver.name(),
                        attempt = backoff.attempt(),
                        delay = ?delay,
                        error = %e,
                        "failed to create subscription, retrying"
                    );

                    tokio::select! {
                        () = driver.cancelled() => return false,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn receive(
        &self,
        driver: &SubscriptionDriver,
        completions: &mpsc::UnboundedSender<Completion>,
    ) {
        let permits = Arc::new(Semaphore::new(self.options.max_outstanding.max(1)));
        let mut deliveries = JoinSet::new();
        let mut backoff = self.backoff();

        loop {
            while deliveries.try_join_next().is_some() {}

            // Every pulled message must already own a handler slot.
            let leased = tokio::select! {
                () = driver.cancelled() => break,
                leased = self.lease(&permits) => leased,
            };
            let Some(mut leased) = leased else {
                break;
            };
            let max_messages = i32::try_from(leased.len()).unwrap_or(i32::MAX);

            let pulled = tokio::select! {
                () = driver.cancelled() => break,
                pulled = self.backend.pull(driver.name(), max_messages) => pulled,
            };

            let received = match pulled {
                Ok(received) => {
                    backoff.reset();
                    received
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(subscription = %driver.name(), delay = ?delay, error = %e, "pull failed");
                    drop(leased);
                    tokio::select! {
                        () = driver.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            for received in received {
                let permit = match leased.pop() {
                    Some(permit) => permit,
                    None => match permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let Some((cx, message)) = self.envelope(received, completions) else {
                    continue;
                };
                let registration = self.registration.clone();

                deliveries.spawn(async move {
                    let _permit = permit;
                    registration.deliver(cx, message).await;
                });
            }
        }

        while deliveries.join_next().await.is_some() {}
    }

    /// Waits for one free handler slot, then takes as many more as are free,
    /// up to `max_messages`.
    async fn lease(&self, permits: &Arc<Semaphore>) -> Option<Vec<OwnedSemaphorePermit>> {
        let first = permits.clone().acquire_owned().await.ok()?;
        let wanted = usize::try_from(self.options.max_messages)
            .unwrap_or(1)
            .max(1);

        let mut leased = vec![first];
        while leased.len() < wanted {
            let Ok(permit) = permits.clone().try_acquire_owned() else {
                break;
            };
            leased.push(permit);
        }
        Some(leased)
    }

    fn envelope(
        &self,
        received: ReceivedMessage,
        completions: &mpsc::UnboundedSender<Completion>,
    ) -> Option<(opentelemetry::Context, Message)> {
        let ReceivedMessage {
            ack_id, message, ..
        } = received;

        let Some(message) = message else {
            warn!(topic = %self.registration.topic, ack_id = %ack_id, "received empty message");
            return None;
        };

        let acker = Arc::new(PulledAcker {
            ack_id,
            completions: completions.clone(),
        });
        let message = Message::new(message.message_id, message.attributes, message.data, acker);

        let parent = propagation::extract(&message.metadata);
        let tracer = global::tracer(TRACER_NAME);
        let span = tracer
            .span_builder(format!("{} receive", self.registration.subscriber_name))
            .with_kind(SpanKind::Consumer)
            .with_attributes([
                KeyValue::new("messaging.system", "gcp_pubsub"),
                KeyValue::new("messaging.destination.name", self.registration.topic.clone()),
                KeyValue::new("messaging.message.id", message.id.clone()),
            ])
            .start_with_context(&tracer, &parent);

        Some((parent.with_span(span), message))
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.options.backoff_min, self.options.backoff_max)
    }
}

async fn flush_completions<B>(
    backend: Arc<B>,
    subscription: String,
    mut pending: mpsc::UnboundedReceiver<Completion>,
    done: CancellationToken,
) where
    B: PubSubBackend,
{
    let mut acks = Vec::new();
    let mut nacks = Vec::new();

    loop {
        let completion = tokio::select! {
            completion = pending.recv() => completion,
            () = done.cancelled() => None,
        };
        let Some(completion) = completion else {
            break;
        };

        collect(completion, &mut acks, &mut nacks);
        while let Ok(completion) = pending.try_recv() {
            collect(completion, &mut acks, &mut nacks);
        }
        flush(backend.as_ref(), &subscription, &mut acks, &mut nacks).await;
    }

    while let Ok(completion) = pending.try_recv() {
        collect(completion, &mut acks, &mut nacks);
    }
    flush(backend.as_ref(), &subscription, &mut acks, &mut nacks).await;
}

fn collect(completion: Completion, acks: &mut Vec<String>, nacks: &mut Vec<String>) {
    match completion {
        Completion::Ack(ack_id) => acks.push(ack_id),
        Completion::Nack(ack_id) => nacks.push(ack_id),
    }
}

async fn flush<B>(backend: &B, subscription: &str, acks: &mut Vec<String>, nacks: &mut Vec<String>)
where
    B: PubSubBackend,
{
    if !acks.is_empty() {
        let batch = std::mem::take(acks);
        let count = batch.len();
        if let Err(e) = backend.acknowledge(subscription, batch).await {
            warn!(subscription = %subscription, count, error = %e, "failed to acknowledge messages");
        }
    }

    if !nacks.is_empty() {
        let batch = std::mem::take(nacks);
        let count = batch.len();
        if let Err(e) = backend.modify_ack_deadline(subscription, batch, 0).await {
            warn!(subscription = %subscription, count, error = %e, "failed to nack messages");
        }
    }
}
