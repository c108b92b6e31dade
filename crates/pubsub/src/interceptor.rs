use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::client::{PublisherCore, Routes, method_name};
use crate::{Context, OutgoingMessage};

/// Metadata key carrying the topic a dead-lettered message was meant for.
pub const DEAD_LETTER_ORIGINAL_TOPIC: &str = "x-original-topic";

/// Metadata key carrying the RPC method whose response was dead-lettered.
pub const DEAD_LETTER_RPC_METHOD: &str = "x-rpc-method";

/// Metadata key carrying the publish error that caused the dead-lettering.
pub const DEAD_LETTER_PUBLISH_ERROR: &str = "x-publish-error";

/// What to do with an auto-publish job when the queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Drop the new job and log a warning.
    #[default]
    DropNewest,

    /// Wait for queue capacity.
    Wait,
}

/// What to do when an auto-publish fails.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log a warning.
    #[default]
    Log,

    /// Republish the payload to `topic`, annotated with the failure.
    DeadLetter {
        /// Dead-letter topic.
        topic: String,
    },
}

/// Auto-publish queue settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutoPublishConfig {
    /// Maximum number of queued jobs.
    pub queue_capacity: usize,

    /// Maximum number of publishes in flight.
    pub concurrency: usize,

    /// Behaviour when the queue is full.
    pub queue_policy: QueuePolicy,

    /// Behaviour when a publish fails.
    pub failure_policy: FailurePolicy,
}

impl Default for AutoPublishConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            concurrency: 8,
            queue_policy: QueuePolicy::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

#[derive(Debug)]
struct PublishJob {
    cx: Context,
    method: String,
    topic: String,
    message: OutgoingMessage,
}

/// Bounded queue feeding a single auto-publish worker.
#[derive(Clone, Debug)]
pub(crate) struct AutoPublishQueue {
    sender: mpsc::Sender<PublishJob>,
    policy: QueuePolicy,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl AutoPublishQueue {
    pub(crate) fn start(core: Arc<PublisherCore>, config: &AutoPublishConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(run_worker(
            receiver,
            core,
            config.failure_policy.clone(),
            Arc::new(Semaphore::new(config.concurrency.max(1))),
            tracker.clone(),
            token.clone(),
        ));

        Self {
            sender,
            policy: config.queue_policy,
            token,
            tracker,
        }
    }

    async fn enqueue(&self, job: PublishJob) -> bool {
        match self.policy {
            QueuePolicy::DropNewest => match self.sender.try_send(job) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(job)) => {
                    warn!(method = %job.method, topic = %job.topic, "auto-publish queue full, dropping message");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(job)) => {
                    warn!(method = %job.method, topic = %job.topic, "auto-publish queue closed, dropping message");
                    false
                }
            },
            QueuePolicy::Wait => match self.sender.send(job).await {
                Ok(()) => true,
                Err(mpsc::error::SendError(job)) => {
                    warn!(method = %job.method, topic = %job.topic, "auto-publish queue closed, dropping message");
                    false
                }
            },
        }
    }

    /// Stops accepting jobs and waits for queued and in-flight publishes.
    pub(crate) async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<PublishJob>,
    core: Arc<PublisherCore>,
    failure_policy: FailurePolicy,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    token: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            () = token.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        dispatch(job, &core, &failure_policy, &permits, &tracker).await;
    }

    receiver.close();
    while let Some(job) = receiver.recv().await {
        dispatch(job, &core, &failure_policy, &permits, &tracker).await;
    }
    debug!("auto-publish worker stopped");
}

async fn dispatch(
    job: PublishJob,
    core: &Arc<PublisherCore>,
    failure_policy: &FailurePolicy,
    permits: &Arc<Semaphore>,
    tracker: &TaskTracker,
) {
    let Ok(permit) = permits.clone().acquire_owned().await else {
        return;
    };
    let core = core.clone();
    let failure_policy = failure_policy.clone();

    tracker.spawn(async move {
        let _permit = permit;
        publish_job(&core, &failure_policy, job).await;
    });
}

async fn publish_job(core: &PublisherCore, failure_policy: &FailurePolicy, job: PublishJob) {
    let PublishJob {
        cx,
        method,
        topic,
        message,
    } = job;
    let fallback =
        matches!(failure_policy, FailurePolicy::DeadLetter { .. }).then(|| message.clone());

    let error = match core.publish(&cx, &topic, message).await {
        Ok(()) => {
            info!(method = %method, topic = %topic, "auto-published response");
            return;
        }
        Err(e) => e,
    };

    match (failure_policy, fallback) {
        (FailurePolicy::DeadLetter { topic: dead_letter }, Some(message)) => {
            warn!(method = %method, topic = %topic, dead_letter = %dead_letter, error = %error, "auto-publish failed, dead-lettering");
            let message = message
                .with_metadata(DEAD_LETTER_ORIGINAL_TOPIC, topic.as_str())
                .with_metadata(DEAD_LETTER_RPC_METHOD, method.as_str())
                .with_metadata(DEAD_LETTER_PUBLISH_ERROR, error.to_string());
            if let Err(e) = core.publish(&cx, dead_letter, message).await {
                warn!(method = %method, dead_letter = %dead_letter, error = %e, "failed to publish to dead-letter topic");
            }
        }
        _ => {
            warn!(method = %method, topic = %topic, error = %error, "auto-publish failed");
        }
    }
}

/// Publishes successful RPC responses to the topic routed for their method.
///
/// Publishing is detached from the RPC: the response is returned as soon as
/// the job is queued, and publish failures never reach the caller.
#[derive(Clone, Debug)]
pub struct AutoPublisher {
    routes: Arc<Routes>,
    queue: AutoPublishQueue,
}

impl AutoPublisher {
    pub(crate) const fn new(routes: Arc<Routes>, queue: AutoPublishQueue) -> Self {
        Self { routes, queue }
    }

    /// Runs a unary RPC `call` and queues its response for publishing on success.
    ///
    /// The publish carries [`Context::current`], so the RPC future must run
    /// inside its trace context (for example via
    /// `opentelemetry::trace::FutureExt::with_context`). Use
    /// [`AutoPublisher::unary_with_context`] to pass the context explicitly.
    ///
    /// # Errors
    ///
    /// Returns the call's own status unchanged.
    pub async fn unary<M, F>(
        &self,
        full_method: &str,
        call: F,
    ) -> Result<tonic::Response<M>, tonic::Status>
    where
        M: prost::Message,
        F: Future<Output = Result<tonic::Response<M>, tonic::Status>>,
    {
        self.unary_with_context(&Context::current(), full_method, call)
            .await
    }

    /// Like [`AutoPublisher::unary`], publishing under the RPC's context `cx`.
    ///
    /// # Errors
    ///
    /// Returns the call's own status unchanged.
    pub async fn unary_with_context<M, F>(
        &self,
        cx: &Context,
        full_method: &str,
        call: F,
    ) -> Result<tonic::Response<M>, tonic::Status>
    where
        M: prost::Message,
        F: Future<Output = Result<tonic::Response<M>, tonic::Status>>,
    {
        let response = call.await?;
        self.after_success_with_context(cx, full_method, response.get_ref())
            .await;
        Ok(response)
    }

    /// Queues `response` for publishing under [`Context::current`] if
    /// `full_method` is routed.
    ///
    /// Returns whether a job was queued.
    pub async fn after_success<M>(&self, full_method: &str, response: &M) -> bool
    where
        M: prost::Message,
    {
        self.after_success_with_context(&Context::current(), full_method, response)
            .await
    }

    /// Queues `response` for publishing under `cx` if `full_method` is routed.
    ///
    /// Returns whether a job was queued.
    pub async fn after_success_with_context<M>(
        &self,
        cx: &Context,
        full_method: &str,
        response: &M,
    ) -> bool
    where
        M: prost::Message,
    {
        let Some(topic) = self.routes.topic_for_method(full_method) else {
            return false;
        };

        let job = PublishJob {
            cx: cx.clone(),
            method: method_name(full_method).to_string(),
            topic: topic.to_string(),
            message: OutgoingMessage::encode(response),
        };
        self.queue.enqueue(job).await
    }
}
