use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::Error;

/// Key-unique string attributes attached to a message.
pub type Metadata = HashMap<String, String>;

/// Completion signals back to the backend that delivered a message.
///
/// Implementations must not block: backends typically enqueue the signal for
/// a flush task that talks to the broker.
pub trait Acker: Debug + Send + Sync + 'static {
    /// Positive acknowledgement; the backend will not redeliver.
    fn ack(&self);

    /// Negative acknowledgement; the backend may redeliver immediately.
    fn nack(&self);
}

#[derive(Debug)]
struct DetachedAcker;

impl Acker for DetachedAcker {
    fn ack(&self) {}

    fn nack(&self) {}
}

#[derive(Debug)]
struct Completion {
    acker: Arc<dyn Acker>,
    completed: AtomicBool,
}

/// A delivered message.
///
/// Clones share completion state, so exactly one `ack` or `nack` across all
/// clones reaches the backend.
#[derive(Clone)]
pub struct Message {
    /// Backend-assigned identifier.
    pub id: String,

    /// Attributes published alongside the payload.
    pub metadata: Metadata,

    /// Opaque payload bytes.
    pub data: Bytes,

    completion: Arc<Completion>,
}

impl Message {
    /// Creates a message whose completion signals go to `acker`.
    pub fn new(
        id: impl Into<String>,
        metadata: Metadata,
        data: impl Into<Bytes>,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            id: id.into(),
            metadata,
            data: data.into(),
            completion: Arc::new(Completion {
                acker,
                completed: AtomicBool::new(false),
            }),
        }
    }

    /// Creates a message that is not bound to any backend.
    pub fn detached(id: impl Into<String>, metadata: Metadata, data: impl Into<Bytes>) -> Self {
        Self::new(id, metadata, data, Arc::new(DetachedAcker))
    }

    /// Acknowledges the message.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyCompleted` if the message was already acked or nacked.
    pub fn ack(&self) -> Result<(), Error> {
        self.complete()?;
        self.completion.acker.ack();
        Ok(())
    }

    /// Negatively acknowledges the message.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyCompleted` if the message was already acked or nacked.
    pub fn nack(&self) -> Result<(), Error> {
        self.complete()?;
        self.completion.acker.nack();
        Ok(())
    }

    /// Whether `ack` or `nack` has been called.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completion.completed.load(Ordering::Acquire)
    }

    fn complete(&self) -> Result<(), Error> {
        if self.completion.completed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyCompleted {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("metadata", &self.metadata)
            .field("data_len", &self.data.len())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// A serialized message on its way to a provider.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Serialized payload.
    pub data: Bytes,

    /// Attributes published alongside the payload.
    pub metadata: Metadata,
}

impl OutgoingMessage {
    /// Creates a message from raw payload bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata: Metadata::new(),
        }
    }

    /// Serializes a protobuf message.
    pub fn encode<M>(message: &M) -> Self
    where
        M: prost::Message,
    {
        Self::new(message.encode_to_vec())
    }

    /// Adds a metadata attribute, replacing any previous value for `key`.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingAcker;

    use assert_matches::assert_matches;

    #[test]
    fn test_ack_is_one_shot() {
        let acker = Arc::new(RecordingAcker::default());
        let message = Message::new("m-1", Metadata::new(), "data", acker.clone());

        assert!(message.ack().is_ok());
        assert!(message.is_completed());
        assert_matches!(message.ack(), Err(Error::AlreadyCompleted { id }) if id == "m-1");
        assert_matches!(message.nack(), Err(Error::AlreadyCompleted { .. }));

        assert_eq!(acker.acks(), 1);
        assert_eq!(acker.nacks(), 0);
    }

    #[test]
    fn test_clones_share_completion() {
        let acker = Arc::new(RecordingAcker::default());
        let message = Message::new("m-2", Metadata::new(), "data", acker.clone());
        let clone = message.clone();

        clone.nack().unwrap();

        assert!(message.is_completed());
        assert!(message.ack().is_err());
        assert_eq!(acker.acks(), 0);
        assert_eq!(acker.nacks(), 1);
    }

    #[test]
    fn test_outgoing_metadata_is_key_unique() {
        let message = OutgoingMessage::new("payload")
            .with_metadata("source", "a")
            .with_metadata("source", "b");

        assert_eq!(message.metadata.len(), 1);
        assert_eq!(message.metadata["source"], "b");
        assert_eq!(message.len(), 7);
    }
}
