use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use opentelemetry::Context;

use crate::{BoxError, HandlerError, Message, Metadata};

/// Normalized message handler invoked by every provider.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handles one delivered message.
    async fn handle(&self, cx: Context, message: Message) -> Result<(), HandlerError>;
}

/// Return types accepted from application callbacks.
///
/// Callbacks may return nothing or `Result<(), E>` for any error convertible
/// into a boxed error.
pub trait HandlerOutput: Send {
    /// Converts the callback output into a handler result.
    ///
    /// # Errors
    ///
    /// Returns the callback's own error.
    fn into_result(self) -> Result<(), BoxError>;
}

impl HandlerOutput for () {
    fn into_result(self) -> Result<(), BoxError> {
        Ok(())
    }
}

impl<E> HandlerOutput for Result<(), E>
where
    E: Into<BoxError> + Send,
{
    fn into_result(self) -> Result<(), BoxError> {
        self.map_err(Into::into)
    }
}

fn decode<T>(message: &Message) -> Result<T, HandlerError>
where
    T: prost::Message + Default,
{
    T::decode(message.data.clone()).map_err(|source| HandlerError::Decode {
        message_id: message.id.clone(),
        source,
    })
}

/// Raw handler: receives the envelope untouched.
pub struct RawHandler<F> {
    callback: F,
}

impl<F> RawHandler<F> {
    /// Wraps a `Fn(Context, Message)` callback.
    pub const fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F, Fut, O> Handler for RawHandler<F>
where
    F: Fn(Context, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: HandlerOutput + 'static,
{
    async fn handle(&self, cx: Context, message: Message) -> Result<(), HandlerError> {
        (self.callback)(cx, message)
            .await
            .into_result()
            .map_err(HandlerError::Callback)
    }
}

/// Typed handler: decodes the payload into `T` and ignores context and metadata.
pub struct TypedHandler<T, F> {
    callback: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> TypedHandler<T, F> {
    /// Wraps a `Fn(T)` callback.
    pub const fn new(callback: F) -> Self {
        Self {
            callback,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut, O> Handler for TypedHandler<T, F>
where
    T: prost::Message + Default + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: HandlerOutput + 'static,
{
    async fn handle(&self, _cx: Context, message: Message) -> Result<(), HandlerError> {
        let payload = decode::<T>(&message)?;
        (self.callback)(payload)
            .await
            .into_result()
            .map_err(HandlerError::Callback)
    }
}

/// Typed handler that also receives the trace context.
pub struct TypedHandlerWithContext<T, F> {
    callback: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> TypedHandlerWithContext<T, F> {
    /// Wraps a `Fn(Context, T)` callback.
    pub const fn new(callback: F) -> Self {
        Self {
            callback,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut, O> Handler for TypedHandlerWithContext<T, F>
where
    T: prost::Message + Default + 'static,
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: HandlerOutput + 'static,
{
    async fn handle(&self, cx: Context, message: Message) -> Result<(), HandlerError> {
        let payload = decode::<T>(&message)?;
        (self.callback)(cx, payload)
            .await
            .into_result()
            .map_err(HandlerError::Callback)
    }
}

/// Typed handler that receives the trace context and the message metadata.
pub struct TypedHandlerWithMetadata<T, F> {
    callback: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> TypedHandlerWithMetadata<T, F> {
    /// Wraps a `Fn(Context, Metadata, T)` callback.
    pub const fn new(callback: F) -> Self {
        Self {
            callback,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut, O> Handler for TypedHandlerWithMetadata<T, F>
where
    T: prost::Message + Default + 'static,
    F: Fn(Context, Metadata, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: HandlerOutput + 'static,
{
    async fn handle(&self, cx: Context, message: Message) -> Result<(), HandlerError> {
        let payload = decode::<T>(&message)?;
        (self.callback)(cx, message.metadata, payload)
            .await
            .into_result()
            .map_err(HandlerError::Callback)
    }
}
