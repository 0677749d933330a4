//! Message handlers: the untyped [`MessageHandler`] the router drives, and the
//! typed [`EventHandler`] / [`CommandHandler`] traits business code implements.
//!
//! Typed handlers are bridged to the router by [`EventHandlerAdapter`] and
//! [`CommandHandlerAdapter`], which check the envelope `type`, decode the
//! payload and classify decode failures as permanent.

use async_trait::async_trait;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use ticketflow_core::marshal::{self, MarshalError};
use ticketflow_core::payload::{Command, Event, Payload};
use ticketflow_core::{Context, Message};

/// Boxed error type carried by [`HandlerError`].
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Boxed future returned by [`MessageHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Failure of a handler invocation, classified for the router.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Infrastructure or ordering failure; worth retrying.
    #[error("transient failure: {0}")]
    Transient(BoxError),

    /// Bad input or business rejection; retrying cannot help.
    #[error("permanent failure: {0}")]
    Permanent(BoxError),

    /// The handler panicked; recovered at the router boundary.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Wrap a retryable failure.
    pub fn transient(error: impl Into<BoxError>) -> Self {
        Self::Transient(error.into())
    }

    /// Wrap a non-retryable failure.
    pub fn permanent(error: impl Into<BoxError>) -> Self {
        Self::Permanent(error.into())
    }

    /// Whether the retry middleware should re-invoke the handler.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether redelivery is pointless (dead-letter immediately).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<MarshalError> for HandlerError {
    fn from(error: MarshalError) -> Self {
        Self::permanent(error)
    }
}

/// Untyped handler invoked by the router for every delivered message.
pub trait MessageHandler: Send + Sync {
    /// Process one message.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when the message was not processed.
    fn handle<'a>(&'a self, ctx: &'a Context, message: &'a Message) -> HandlerFuture<'a>;
}

/// Handler for one event type.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    /// Handle a decoded event.
    async fn handle(&self, ctx: &Context, event: E) -> Result<(), HandlerError>;
}

/// Handler for one command type.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    /// Handle a decoded command.
    async fn handle(&self, ctx: &Context, command: C) -> Result<(), HandlerError>;
}

/// Decode a message for a typed handler.
///
/// Returns `Ok(None)` when the envelope names another type: such messages are
/// skipped, not failed.
fn decode<P: Payload>(ctx: &Context, message: &Message) -> Result<Option<P>, HandlerError> {
    if !marshal::is_type::<P>(message) {
        tracing::debug!(
            handler = ctx.handler().unwrap_or_default(),
            message_id = %message.id,
            expected = P::NAME,
            found = message.payload_type().unwrap_or_default(),
            "Skipping message of unexpected type"
        );
        return Ok(None);
    }
    Ok(Some(marshal::unmarshal::<P>(message)?))
}

/// Bridges an [`EventHandler`] to the router.
pub struct EventHandlerAdapter<E, H> {
    handler: Arc<H>,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> EventHandlerAdapter<E, H> {
    /// Wrap a typed event handler.
    #[must_use]
    pub const fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            _event: PhantomData,
        }
    }
}

impl<E: Event, H: EventHandler<E>> MessageHandler for EventHandlerAdapter<E, H> {
    fn handle<'a>(&'a self, ctx: &'a Context, message: &'a Message) -> HandlerFuture<'a> {
        Box::pin(async move {
            match decode::<E>(ctx, message)? {
                Some(event) => self.handler.handle(ctx, event).await,
                None => Ok(()),
            }
        })
    }
}

/// Bridges a [`CommandHandler`] to the router.
pub struct CommandHandlerAdapter<C, H> {
    handler: Arc<H>,
    _command: PhantomData<fn() -> C>,
}

impl<C, H> CommandHandlerAdapter<C, H> {
    /// Wrap a typed command handler.
    #[must_use]
    pub const fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            _command: PhantomData,
        }
    }
}

impl<C: Command, H: CommandHandler<C>> MessageHandler for CommandHandlerAdapter<C, H> {
    fn handle<'a>(&'a self, ctx: &'a Context, message: &'a Message) -> HandlerFuture<'a> {
        Box::pin(async move {
            match decode::<C>(ctx, message)? {
                Some(command) => self.handler.handle(ctx, command).await,
                None => Ok(()),
            }
        })
    }
}

/// A [`MessageHandler`] built from a closure over owned context and message.
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Build a raw [`MessageHandler`] from a closure.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Context, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Context, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle<'a>(&'a self, ctx: &'a Context, message: &'a Message) -> HandlerFuture<'a> {
        Box::pin((self.f)(ctx.clone(), message.clone()))
    }
}
