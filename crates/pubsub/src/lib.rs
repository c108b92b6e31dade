//! Backend-agnostic publish/subscribe for RPC services.
//!
//! A [`Client`] binds one [`Provider`] (the message bus backend) to a routing
//! table of RPC methods to topics. Services publish domain events through the
//! client, register typed callbacks with the `on*` family of methods, and wrap
//! unary RPC handlers with an [`AutoPublisher`] so successful responses are
//! published without any extra code at the call site.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod error;
mod handler;
mod interceptor;
mod message;
mod metrics;
mod noop;
mod provider;
mod subscription;

#[cfg(test)]
mod testing;

pub use client::{Client, ClientBuilder, Subscriber};
pub use error::{BoxError, Error, HandlerError};
pub use handler::{
    Handler, HandlerOutput, RawHandler, TypedHandler, TypedHandlerWithContext,
    TypedHandlerWithMetadata,
};
pub use interceptor::{
    AutoPublishConfig, AutoPublisher, DEAD_LETTER_ORIGINAL_TOPIC, DEAD_LETTER_PUBLISH_ERROR,
    DEAD_LETTER_RPC_METHOD, FailurePolicy, QueuePolicy,
};
pub use message::{Acker, Message, Metadata, OutgoingMessage};
pub use metrics::PublishMetrics;
pub use noop::NoopProvider;
pub use provider::{
    Provider, Registration, SUBSCRIPTION_NAME_SEPARATOR, SubscribeOptions, subscription_name,
};
pub use subscription::{Subscription, SubscriptionDriver, SubscriptionState};

/// Trace-carrying context passed to handlers and publish calls.
pub use opentelemetry::Context;
