//! Publish metrics.

use std::sync::OnceLock;

use prometheus::{IntCounterVec, Opts, Registry};
use tracing::warn;

static GLOBAL: OnceLock<PublishMetrics> = OnceLock::new();

const LABELS: &[&str] = &["topic", "service"];

/// Counters incremented by the client after every successful publish.
#[derive(Clone, Debug)]
pub struct PublishMetrics {
    published: IntCounterVec,
    outgoing_bytes: IntCounterVec,
}

impl PublishMetrics {
    /// Metrics registered in the process-wide default registry.
    ///
    /// Falls back to unregistered counters if the names are already taken.
    pub fn global() -> Self {
        GLOBAL
            .get_or_init(|| {
                Self::new(prometheus::default_registry()).unwrap_or_else(|e| {
                    warn!(error = %e, "could not register publish metrics");
                    Self::unregistered()
                })
            })
            .clone()
    }

    /// Creates the counters and registers them in `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric with the same name is already registered.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self::unregistered();
        registry.register(Box::new(metrics.published.clone()))?;
        registry.register(Box::new(metrics.outgoing_bytes.clone()))?;
        Ok(metrics)
    }

    /// Creates counters that are not exposed through any registry.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn unregistered() -> Self {
        // Names and label sets are static and valid.
        let published = IntCounterVec::new(
            Opts::new(
                "pubsub_message_published_total",
                "Number of messages published",
            ),
            LABELS,
        )
        .expect("valid metric definition");
        let outgoing_bytes = IntCounterVec::new(
            Opts::new("pubsub_outgoing_bytes", "Total bytes published"),
            LABELS,
        )
        .expect("valid metric definition");

        Self {
            published,
            outgoing_bytes,
        }
    }

    /// Records one successful publish of `bytes` bytes.
    pub fn record(&self, topic: &str, service: &str, bytes: usize) {
        self.published.with_label_values(&[topic, service]).inc();
        self.outgoing_bytes
            .with_label_values(&[topic, service])
            .inc_by(bytes as u64);
    }

    /// Messages published to `topic` by `service`.
    #[must_use]
    pub fn published(&self, topic: &str, service: &str) -> u64 {
        self.published.with_label_values(&[topic, service]).get()
    }

    /// Bytes published to `topic` by `service`.
    #[must_use]
    pub fn outgoing_bytes(&self, topic: &str, service: &str) -> u64 {
        self.outgoing_bytes.with_label_values(&[topic, service]).get()
    }
}
