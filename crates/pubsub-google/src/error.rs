use tidings_pubsub::BoxError;
use thiserror::Error;

/// Errors returned while connecting to Google Cloud Pub/Sub.
#[derive(Debug, Error)]
pub enum Error {
    /// Application Default Credentials could not be loaded.
    #[error("failed to load Google Cloud credentials: {0}")]
    Credentials(#[from] google_cloud_auth::error::Error),

    /// The endpoint URI is malformed.
    #[error("invalid Pub/Sub endpoint: {0}")]
    Endpoint(#[from] tonic::codegen::http::uri::InvalidUri),

    /// The gRPC channel could not be established.
    #[error("failed to connect to Pub/Sub: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Errors returned by a [`crate::PubSubBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// The resource already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other gRPC status.
    #[error("pub/sub request failed: {0}")]
    Status(Box<tonic::Status>),

    /// Fetching or encoding the access token failed.
    #[error("failed to authorize request: {0}")]
    Auth(BoxError),
}

impl From<tonic::Status> for BackendError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::AlreadyExists => Self::AlreadyExists(status.message().to_string()),
            tonic::Code::NotFound => Self::NotFound(status.message().to_string()),
            _ => Self::Status(Box::new(status)),
        }
    }
}
