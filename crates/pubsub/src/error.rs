use std::time::Duration;

use thiserror::Error;

/// Boxed error used at the seams where backends and applications plug in.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by the client, providers and message envelopes.
#[derive(Debug, Error)]
pub enum Error {
    /// The message was already acknowledged or negatively acknowledged.
    #[error("message {id} was already acknowledged")]
    AlreadyCompleted {
        /// Identifier of the message.
        id: String,
    },

    /// Invalid registration or routing configuration.
    #[error("invalid pub/sub configuration: {0}")]
    Configuration(String),

    /// The backend rejected or failed the publish.
    #[error("failed to publish to topic {topic}: {source}")]
    Publish {
        /// Topic the message was destined for.
        topic: String,
        /// Backend error.
        #[source]
        source: BoxError,
    },

    /// The provider has been shut down.
    #[error("pub/sub provider is shut down")]
    Shutdown,

    /// The backend did not confirm the publish in time.
    #[error("publish to topic {topic} timed out after {timeout:?}")]
    Timeout {
        /// Topic the message was destined for.
        topic: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
}

impl Error {
    /// Wraps a backend error as a publish failure for `topic`.
    pub fn publish<E>(topic: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Publish {
            topic: topic.into(),
            source: source.into(),
        }
    }
}

/// Errors produced while handling a delivered message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload did not decode into the handler's message type.
    #[error("could not decode message {message_id}: {source}")]
    Decode {
        /// Identifier of the message that failed to decode.
        message_id: String,
        /// Decoder error.
        #[source]
        source: prost::DecodeError,
    },

    /// The application callback returned an error.
    #[error(transparent)]
    Callback(BoxError),
}
