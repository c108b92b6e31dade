//! CLI for publishing to and tailing pub/sub topics.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use clap::{Parser, Subcommand};
use tidings_pubsub::{Client, Context, Message, OutgoingMessage, SubscribeOptions, Subscriber};
use tidings_pubsub_google::{GoogleCloudConfig, GoogleCloudOptions, provider_from_config};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid command line argument
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Provider connection error
    #[error(transparent)]
    Google(#[from] tidings_pubsub_google::Error),

    /// Pub/sub error
    #[error(transparent)]
    PubSub(#[from] tidings_pubsub::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Google Cloud project; pub/sub is disabled when unset
    #[arg(long, env = "GOOGLE_PUBSUB_PROJECT_ID", global = true)]
    project_id: Option<String>,

    /// Pub/Sub emulator address, e.g. localhost:8085
    #[arg(long, env = "PUBSUB_EMULATOR_HOST", global = true)]
    emulator_host: Option<String>,

    /// Service name used for metrics labels and subscription names
    #[arg(
        long,
        default_value = "tidings",
        env = "TIDINGS_SERVICE_NAME",
        global = true
    )]
    service_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Publish one message
    Publish {
        /// Destination topic
        #[arg(long)]
        topic: String,

        /// Payload, sent as UTF-8 bytes
        #[arg(long)]
        data: String,

        /// Attribute as key=value, may be repeated
        #[arg(long = "metadata", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },

    /// Print messages arriving on a topic until interrupted
    Tail {
        /// Topic to subscribe to
        #[arg(long)]
        topic: String,
    },
}

/// Logs every message on one topic.
struct TailSubscriber {
    topic: String,
}

impl Subscriber for TailSubscriber {
    fn setup(&self, client: &Client) -> Result<(), tidings_pubsub::Error> {
        client.on_raw(
            &self.topic,
            SubscribeOptions::default(),
            |_cx: Context, message: Message| async move {
                info!(
                    id = %message.id,
                    metadata = ?message.metadata,
                    data = %String::from_utf8_lossy(&message.data),
                    "received message"
                );
            },
        )?;
        Ok(())
    }
}

fn parse_metadata(pairs: &[String]) -> Result<Vec<(String, String)>, Error> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| Error::Argument(format!("expected KEY=VALUE, got {pair:?}")))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let config = args.project_id.clone().map(|project_id| {
        let config = GoogleCloudConfig::new(project_id);
        match args.emulator_host.clone() {
            Some(host) => config.with_emulator_host(host),
            None => config,
        }
    });
    let provider = provider_from_config(config, GoogleCloudOptions::default()).await?;

    let client = Client::builder(provider)
        .service_name(args.service_name)
        .build();

    match args.command {
        Command::Publish {
            topic,
            data,
            metadata,
        } => {
            let message = parse_metadata(&metadata)?
                .into_iter()
                .fold(OutgoingMessage::new(data), |message, (key, value)| {
                    message.with_metadata(key, value)
                });
            client.publish_raw(&Context::current(), &topic, message).await?;
            info!(topic = %topic, "published message");
        }
        Command::Tail { topic } => {
            client.subscribe(&TailSubscriber { topic })?;

            let shutdown_token = CancellationToken::new();
            let signal_shutdown_token = shutdown_token.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("Received interrupt signal");
                signal_shutdown_token.cancel();
            });

            shutdown_token.cancelled().await;
        }
    }

    info!("Shutting down");
    client.shutdown().await;

    Ok(())
}
