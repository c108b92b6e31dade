use std::sync::Arc;
use std::time::Duration;

use tidings_pubsub::{NoopProvider, Provider};
use tracing::{info, warn};

use crate::{Error, GoogleCloud};

/// Environment variable naming the Google Cloud project; selects this backend.
pub const PROJECT_ID_ENV: &str = "GOOGLE_PUBSUB_PROJECT_ID";

/// Environment variable pointing at a local Pub/Sub emulator (`host:port`).
pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";

const PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Where to find Pub/Sub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GoogleCloudConfig {
    /// Project owning topics and subscriptions.
    pub project_id: String,

    /// Emulator `host:port`; when set, connections are plaintext and unauthenticated.
    pub emulator_host: Option<String>,
}

impl GoogleCloudConfig {
    /// Config for `project_id` against the production endpoint.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            emulator_host: None,
        }
    }

    /// Targets an emulator instead of the production endpoint.
    #[must_use]
    pub fn with_emulator_host(mut self, host: impl Into<String>) -> Self {
        self.emulator_host = Some(host.into());
        self
    }

    /// Reads the config from the process environment.
    ///
    /// Returns `None` when no project is configured.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the config through `lookup`, which maps variable names to values.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let project_id = lookup(PROJECT_ID_ENV).filter(|value| !value.is_empty())?;
        let emulator_host = lookup(EMULATOR_HOST_ENV).filter(|value| !value.is_empty());

        Some(Self {
            project_id,
            emulator_host,
        })
    }

    /// gRPC endpoint URI.
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.emulator_host.as_ref().map_or_else(
            || PUBSUB_ENDPOINT.to_string(),
            |host| format!("http://{host}"),
        )
    }
}

/// Tuning for publishes and pull loops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GoogleCloudOptions {
    /// Deadline for the backend to confirm a publish.
    pub publish_timeout: Duration,

    /// Maximum messages returned by one pull.
    pub max_messages: i32,

    /// Maximum messages being handled at once per subscription.
    pub max_outstanding: usize,

    /// First retry delay.
    pub backoff_min: Duration,

    /// Longest retry delay.
    pub backoff_max: Duration,
}

impl Default for GoogleCloudOptions {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(10),
            max_messages: 32,
            max_outstanding: 16,
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
        }
    }
}

/// Selects a provider from the process environment.
///
/// # Errors
///
/// Returns an error if a project is configured but the connection fails.
pub async fn provider_from_env() -> Result<Arc<dyn Provider>, Error> {
    provider_from_config(GoogleCloudConfig::from_env(), GoogleCloudOptions::default()).await
}

/// Connects to Pub/Sub when `config` is present, otherwise returns a [`NoopProvider`].
///
/// # Errors
///
/// Returns an error if the connection fails.
pub async fn provider_from_config(
    config: Option<GoogleCloudConfig>,
    options: GoogleCloudOptions,
) -> Result<Arc<dyn Provider>, Error> {
    let Some(config) = config else {
        warn!("{PROJECT_ID_ENV} is not set, pub/sub is disabled");
        return Ok(Arc::new(NoopProvider::new()));
    };

    let provider = GoogleCloud::connect(&config, options).await?;
    info!(
        project_id = %config.project_id,
        emulator = config.emulator_host.is_some(),
        "using Google Cloud Pub/Sub"
    );
    Ok(Arc::new(provider))
}
