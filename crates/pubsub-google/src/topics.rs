use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{BackendError, PubSubBackend};

/// Handle to a topic known to exist on the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topic {
    /// Topic id.
    pub id: String,
}

/// Lazily created topics, created at most once each.
#[derive(Debug)]
pub(crate) struct TopicCache<B> {
    backend: Arc<B>,
    topics: Mutex<HashMap<String, Arc<OnceCell<Topic>>>>,
}

impl<B> TopicCache<B>
where
    B: PubSubBackend,
{
    pub(crate) fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached topic, creating it on first use.
    ///
    /// Concurrent first callers wait on the same creation; a failed creation
    /// leaves the entry empty for the next caller.
    pub(crate) async fn get(&self, id: &str) -> Result<Topic, BackendError> {
        let cell = self.topics.lock().entry(id.to_string()).or_default().clone();

        let topic = cell
            .get_or_try_init(|| async {
                match self.backend.create_topic(id).await {
                    Ok(()) => info!(topic = %id, "created topic"),
                    Err(BackendError::AlreadyExists(_)) => {
                        debug!(topic = %id, "topic already exists");
                    }
                    Err(e) => return Err(e),
                }
                Ok(Topic { id: id.to_string() })
            })
            .await?;

        Ok(topic.clone())
    }

    pub(crate) fn evict(&self, id: &str) {
        self.topics.lock().remove(id);
    }
}
