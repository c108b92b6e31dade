use std::sync::Arc;

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tidings_pubsub::{
    BoxError, Client, Context, Error, Message, Metadata, OutgoingMessage, PublishMetrics,
    SubscribeOptions, Subscriber,
};
use tidings_pubsub_memory::{AckRecord, MemoryProvider};

#[derive(Clone, PartialEq, prost::Message)]
struct CreateAccountResponse {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, tag = "2")]
    email: String,
}

const CREATE_ACCOUNT: &str = "/identity.v1.Accounts/CreateAccount";

fn response(id: &str) -> CreateAccountResponse {
    CreateAccountResponse {
        id: id.to_string(),
        email: format!("{id}@example.com"),
    }
}

fn client(provider: &MemoryProvider) -> Client {
    let _ = tracing_subscriber::fmt::try_init();

    Client::builder(provider.clone())
        .service_name("identity")
        .subscriber_name("mailer")
        .route("CreateAccount", "account.created")
        .unwrap()
        .metrics(PublishMetrics::unregistered())
        .build()
}

#[tokio::test]
async fn test_create_account_success_publishes_once() {
    let provider = MemoryProvider::new();
    let client = client(&provider);
    let publisher = client.auto_publisher();

    let result = publisher
        .unary(CREATE_ACCOUNT, async {
            Ok(tonic::Response::new(response("acc-1")))
        })
        .await
        .unwrap();
    assert_eq!(result.into_inner(), response("acc-1"));

    client.shutdown().await;

    assert_eq!(provider.published_count(), 1);
    assert_eq!(
        provider.messages("account.created"),
        vec![OutgoingMessage::encode(&response("acc-1"))]
    );
}

#[tokio::test]
async fn test_create_account_failure_publishes_nothing() {
    let provider = MemoryProvider::new();
    let client = client(&provider);

    let result = client
        .auto_publisher()
        .unary(CREATE_ACCOUNT, async {
            Err::<tonic::Response<CreateAccountResponse>, _>(tonic::Status::invalid_argument(
                "email missing",
            ))
        })
        .await;
    assert!(result.is_err());

    client.shutdown().await;
    assert_eq!(provider.published_count(), 0);
}

#[tokio::test]
async fn test_handler_shapes_receive_decoded_payload() {
    let provider = MemoryProvider::new();
    let client = client(&provider);
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();

    let sink = seen.clone();
    client
        .on_raw(
            "raw",
            SubscribeOptions::default(),
            move |_: Context, message: Message| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(format!("raw:{}", message.data.len()));
                }
            },
        )
        .unwrap();

    let sink = seen.clone();
    client
        .on(
            "typed",
            SubscribeOptions::default(),
            move |event: CreateAccountResponse| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(format!("typed:{}", event.id));
                    Ok::<(), BoxError>(())
                }
            },
        )
        .unwrap();

    let sink = seen.clone();
    client
        .on_with_context(
            "with-context",
            SubscribeOptions::default(),
            move |cx: Context, event: CreateAccountResponse| {
                let sink = sink.clone();
                async move {
                    let request = cx
                        .get::<KeyValue>()
                        .map(|kv| kv.value.to_string())
                        .unwrap_or_default();
                    sink.lock().push(format!("context:{}:{request}", event.id));
                }
            },
        )
        .unwrap();

    let sink = seen.clone();
    client
        .on_with_metadata(
            "with-metadata",
            SubscribeOptions::default(),
            move |_: Context, metadata: Metadata, event: CreateAccountResponse| {
                let sink = sink.clone();
                async move {
                    sink.lock()
                        .push(format!("metadata:{}:{}", event.id, metadata["tenant"]));
                }
            },
        )
        .unwrap();

    let payload = OutgoingMessage::encode(&response("acc-2")).with_metadata("tenant", "acme");
    let len = payload.len();
    let cx = Context::current_with_value(KeyValue::new("request", "req-9"));
    let _attach = cx.attach();

    for topic in ["raw", "typed", "with-context", "with-metadata"] {
        let record = provider.inject(topic, payload.clone()).await;
        assert_eq!(record, AckRecord { acks: 1, nacks: 0 });
    }

    assert_eq!(
        *seen.lock(),
        vec![
            format!("raw:{len}"),
            "typed:acc-2".to_string(),
            "context:acc-2:req-9".to_string(),
            "metadata:acc-2:acme".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_failing_handler_is_not_acked() {
    let provider = MemoryProvider::new();
    let client = client(&provider);

    client
        .on(
            "account.created",
            SubscribeOptions::default(),
            |_: CreateAccountResponse| async { Err::<(), _>("smtp unavailable") },
        )
        .unwrap();

    let record = provider
        .inject(
            "account.created",
            OutgoingMessage::encode(&response("acc-3")),
        )
        .await;
    assert_eq!(record, AckRecord { acks: 0, nacks: 0 });

    let garbage = provider
        .inject("account.created", OutgoingMessage::new(vec![0xff, 0xff]))
        .await;
    assert_eq!(garbage, AckRecord { acks: 0, nacks: 0 });
}

#[tokio::test]
async fn test_manual_completion_without_auto_ack() {
    let provider = MemoryProvider::new();
    let client = client(&provider);

    client
        .on_raw(
            "account.created",
            SubscribeOptions::default().auto_ack(false),
            |_: Context, message: Message| async move { message.nack() },
        )
        .unwrap();

    let record = provider
        .inject("account.created", OutgoingMessage::new("x"))
        .await;
    assert_eq!(record, AckRecord { acks: 0, nacks: 1 });
}

#[tokio::test]
async fn test_published_message_round_trips_to_subscriber() {
    let provider = MemoryProvider::new();
    let client = client(&provider);
    let received: Arc<Mutex<Option<(Metadata, CreateAccountResponse)>>> = Arc::default();

    let sink = received.clone();
    client
        .on_with_metadata(
            "account.created",
            SubscribeOptions::default(),
            move |_: Context, metadata: Metadata, event: CreateAccountResponse| {
                let sink = sink.clone();
                async move {
                    *sink.lock() = Some((metadata, event));
                }
            },
        )
        .unwrap();

    let metadata = Metadata::from([("tenant".to_string(), "acme".to_string())]);
    client
        .publish_with_metadata(
            &Context::new(),
            "account.created",
            &response("acc-4"),
            metadata.clone(),
        )
        .await
        .unwrap();

    let sent = provider.messages("account.created").remove(0);
    provider.inject("account.created", sent).await;

    let (got_metadata, event) = received.lock().clone().unwrap();
    assert_eq!(event, response("acc-4"));
    assert!(metadata.iter().all(|(k, v)| got_metadata.get(k) == Some(v)));
}

struct Mailer;

impl Subscriber for Mailer {
    fn setup(&self, client: &Client) -> Result<(), Error> {
        client.on(
            "account.created",
            SubscribeOptions::default(),
            |_: CreateAccountResponse| async {},
        )?;
        client.on(
            "account.created",
            SubscribeOptions::default(),
            |_: CreateAccountResponse| async {},
        )?;
        Ok(())
    }
}

#[tokio::test]
async fn test_duplicate_subscription_aborts_setup() {
    let provider = MemoryProvider::new();
    let client = client(&provider);

    let result = client.subscribe(&Mailer);

    assert!(matches!(result, Err(Error::Configuration(_))));
    assert_eq!(provider.registrations().len(), 1);
    assert_eq!(provider.registrations()[0].name(), "mailer--account.created");
}
