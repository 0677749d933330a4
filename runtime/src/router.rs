//! Message router: dispatches broker deliveries to registered handlers.
//!
//! Each registered handler gets its own subscription (consumer group
//! `<prefix><handler name>`) and its own task running a
//! subscribe-process-reconnect loop. Every delivery flows through the fixed
//! middleware chain (see [`crate::middleware`]) and ends in exactly one
//! acknowledgement:
//!
//! ```text
//!   handler result                      broker outcome
//!   ──────────────                      ──────────────
//!   Ok                               ─► ack
//!   Permanent                        ─► dead-letter sink ─► ack   (sink error ─► nack)
//!   Transient / Panicked, attempt<max ─► nack (redelivered)
//!   Transient / Panicked, attempt≥max ─► dead-letter sink ─► ack
//!   any error while shutting down    ─► nack
//! ```
//!
//! # Handler State Machine
//!
//! ```text
//!   Idle ──run()──► Subscribed ──delivery──► Processing ──outcome──► Idle
//!                        │                                            │
//!                        └──────────────── close() ──────────────► Closed
//! ```

use crate::dead_letter::{DeadLetter, DeadLetterSink, LoggingDeadLetterSink};
use crate::handler::{
    CommandHandler, CommandHandlerAdapter, EventHandler, EventHandlerAdapter, MessageHandler,
};
use crate::metrics::RouterMetrics;
use crate::middleware::{apply, default_chain};
use crate::retry::RetryPolicy;
use chrono::Utc;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use ticketflow_core::Context;
use ticketflow_core::broker::{Broker, BrokerError, Delivery, Subscription};
use ticketflow_core::payload::{Command, Event};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Errors from router setup and lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// `run` was called with no registered handler.
    #[error("No handlers registered")]
    NoHandlers,

    /// Two handlers were registered under the same name.
    #[error("Duplicate handler name: {0}")]
    DuplicateHandler(String),

    /// A command topic has more than one handler.
    #[error("Command topic '{topic}' has more than one handler: {handlers:?}")]
    AmbiguousCommand {
        /// The command topic
        topic: String,
        /// Names of the competing handlers
        handlers: Vec<String>,
    },

    /// A required command has no handler.
    #[error("No handler registered for command topic '{0}'")]
    MissingHandler(String),

    /// `run` was called twice.
    #[error("Router is already running")]
    AlreadyRunning,

    /// A subscription could not be opened.
    #[error(transparent)]
    Subscribe(#[from] BrokerError),

    /// Handlers did not finish within the close timeout.
    #[error("Router close timed out after {0:?}")]
    CloseTimeout(Duration),
}

/// Lifecycle state of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Registered, or waiting for the next delivery.
    Idle,
    /// Subscription open, no delivery seen yet.
    Subscribed,
    /// A delivery is going through the middleware chain.
    Processing,
    /// The handler task has stopped.
    Closed,
}

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Prefix of every handler's consumer group.
    pub consumer_group_prefix: String,
    /// Deliveries after which a still-failing message is dead-lettered.
    pub max_deliveries: u32,
    /// Policy of the retry middleware.
    pub retry: RetryPolicy,
    /// Upper bound on waiting for in-flight handlers in `close`.
    pub close_timeout: Duration,
    /// Pause before reopening a subscription whose stream ended.
    pub resubscribe_delay: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            consumer_group_prefix: "svc-tickets.".to_string(),
            max_deliveries: 5,
            retry: RetryPolicy::default(),
            close_timeout: Duration::from_secs(10),
            resubscribe_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Event,
    Command,
}

struct Registration {
    name: String,
    topic: String,
    kind: Kind,
    handler: Arc<dyn MessageHandler>,
}

type States = Arc<RwLock<HashMap<String, HandlerState>>>;

fn set_state(states: &States, name: &str, state: HandlerState) {
    if let Ok(mut states) = states.write() {
        states.insert(name.to_string(), state);
    }
}

/// One-shot signal that fires once every subscription is open.
#[derive(Debug, Clone)]
pub struct RunningSignal {
    rx: watch::Receiver<bool>,
}

impl RunningSignal {
    /// Whether the router has opened all subscriptions.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the router is running. Returns `false` if the router was
    /// dropped before it started.
    pub async fn wait(mut self) -> bool {
        loop {
            if *self.rx.borrow_and_update() {
                return true;
            }
            if self.rx.changed().await.is_err() {
                return false;
            }
        }
    }
}

/// Dispatches broker deliveries to handlers.
///
/// # Example
///
/// ```rust,ignore
/// let mut router = Router::new(broker, RouterConfig::default());
/// router.add_event_handler::<TicketBookingConfirmed, _>("issue-receipt", handler)?;
/// router.run().await?;
/// router.running().wait().await;
/// // ...
/// router.close().await?;
/// ```
pub struct Router {
    broker: Arc<dyn Broker>,
    config: RouterConfig,
    dead_letters: Arc<dyn DeadLetterSink>,
    registrations: Vec<Registration>,
    required_commands: Vec<String>,
    states: States,
    shutdown: watch::Sender<bool>,
    running: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Router {
    /// Create a router consuming from `broker`, dead-lettering to the log.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: RouterConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (running, _) = watch::channel(false);
        Self {
            broker,
            config,
            dead_letters: Arc::new(LoggingDeadLetterSink),
            registrations: Vec::new(),
            required_commands: Vec::new(),
            states: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
            running,
            tasks: Vec::new(),
        }
    }

    /// Replace the dead-letter sink.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    /// Register a handler for event `E`, subscribed to `events.<E::NAME>`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateHandler`] if `name` is taken.
    pub fn add_event_handler<E, H>(&mut self, name: &str, handler: Arc<H>) -> Result<&mut Self, RouterError>
    where
        E: Event,
        H: EventHandler<E>,
    {
        let adapter: Arc<dyn MessageHandler> = Arc::new(EventHandlerAdapter::<E, H>::new(handler));
        self.register(name, E::topic(), Kind::Event, adapter)
    }

    /// Register a handler for command `C`, subscribed to `commands.<C::NAME>`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateHandler`] if `name` is taken.
    pub fn add_command_handler<C, H>(&mut self, name: &str, handler: Arc<H>) -> Result<&mut Self, RouterError>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let adapter: Arc<dyn MessageHandler> = Arc::new(CommandHandlerAdapter::<C, H>::new(handler));
        self.register(name, C::topic(), Kind::Command, adapter)
    }

    /// Register an untyped handler for an arbitrary topic.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateHandler`] if `name` is taken.
    pub fn add_handler(
        &mut self,
        name: &str,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<&mut Self, RouterError> {
        self.register(name, topic.into(), Kind::Event, handler)
    }

    /// Demand that command `C` has a handler by the time `run` is called.
    pub fn require_command<C: Command>(&mut self) -> &mut Self {
        self.required_commands.push(C::topic());
        self
    }

    fn register(
        &mut self,
        name: &str,
        topic: String,
        kind: Kind,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<&mut Self, RouterError> {
        if self.registrations.iter().any(|r| r.name == name) {
            return Err(RouterError::DuplicateHandler(name.to_string()));
        }
        set_state(&self.states, name, HandlerState::Idle);
        self.registrations.push(Registration {
            name: name.to_string(),
            topic,
            kind,
            handler,
        });
        Ok(self)
    }

    fn validate(&self) -> Result<(), RouterError> {
        if self.registrations.is_empty() {
            return Err(RouterError::NoHandlers);
        }

        let mut names = HashSet::new();
        for registration in &self.registrations {
            if !names.insert(registration.name.as_str()) {
                return Err(RouterError::DuplicateHandler(registration.name.clone()));
            }
        }

        let mut command_handlers: HashMap<&str, Vec<String>> = HashMap::new();
        for registration in self.registrations.iter().filter(|r| r.kind == Kind::Command) {
            command_handlers
                .entry(registration.topic.as_str())
                .or_default()
                .push(registration.name.clone());
        }
        if let Some((topic, handlers)) = command_handlers.iter().find(|(_, h)| h.len() > 1) {
            return Err(RouterError::AmbiguousCommand {
                topic: (*topic).to_string(),
                handlers: handlers.clone(),
            });
        }

        if let Some(topic) = self
            .required_commands
            .iter()
            .find(|topic| !command_handlers.contains_key(topic.as_str()))
        {
            return Err(RouterError::MissingHandler(topic.clone()));
        }

        Ok(())
    }

    /// Validate registrations, open every subscription and spawn the handler
    /// tasks. Returns once all handlers are consuming.
    ///
    /// # Errors
    ///
    /// Returns a validation error, [`RouterError::AlreadyRunning`], or
    /// [`RouterError::Subscribe`] if a subscription cannot be opened (no task
    /// is left running in that case).
    pub async fn run(&mut self) -> Result<(), RouterError> {
        if !self.tasks.is_empty() || *self.running.borrow() {
            return Err(RouterError::AlreadyRunning);
        }
        self.validate()?;

        let mut subscriptions = Vec::with_capacity(self.registrations.len());
        for registration in &self.registrations {
            let group = format!("{}{}", self.config.consumer_group_prefix, registration.name);
            let subscription = self.broker.subscribe(&registration.topic, &group).await?;
            tracing::info!(
                handler = %registration.name,
                topic = %registration.topic,
                consumer_group = %group,
                "Handler subscribed"
            );
            subscriptions.push((group, subscription));
        }

        for (registration, (group, subscription)) in self.registrations.iter().zip(subscriptions) {
            set_state(&self.states, &registration.name, HandlerState::Subscribed);
            let worker = Worker {
                name: registration.name.clone(),
                topic: registration.topic.clone(),
                group,
                handler: apply(&default_chain(self.config.retry.clone()), Arc::clone(&registration.handler)),
                broker: Arc::clone(&self.broker),
                dead_letters: Arc::clone(&self.dead_letters),
                states: Arc::clone(&self.states),
                max_deliveries: self.config.max_deliveries,
                resubscribe_delay: self.config.resubscribe_delay,
            };
            let shutdown = self.shutdown.subscribe();
            self.tasks.push(tokio::spawn(worker.run(subscription, shutdown)));
        }

        self.running.send_replace(true);
        tracing::info!(handlers = self.registrations.len(), "Router running");
        Ok(())
    }

    /// Signal that fires once [`Router::run`] has opened every subscription.
    #[must_use]
    pub fn running(&self) -> RunningSignal {
        RunningSignal {
            rx: self.running.subscribe(),
        }
    }

    /// Whether the router is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Current state of a handler, `None` for unknown names.
    #[must_use]
    pub fn handler_state(&self, name: &str) -> Option<HandlerState> {
        self.states.read().ok().and_then(|states| states.get(name).copied())
    }

    /// Stop consuming, wait for in-flight messages (bounded by
    /// `close_timeout`) and release the subscriptions.
    ///
    /// In-flight retry sleeps are cancelled; their messages are nacked.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::CloseTimeout`] if handlers did not stop in time;
    /// the remaining tasks are aborted.
    pub async fn close(&mut self) -> Result<(), RouterError> {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut self.tasks);
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();

        let timeout = self.config.close_timeout;
        let joined = tokio::time::timeout(timeout, futures::future::join_all(tasks)).await;

        self.running.send_replace(false);
        for registration in &self.registrations {
            set_state(&self.states, &registration.name, HandlerState::Closed);
        }

        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Handler task failed");
                    }
                }
                tracing::info!("Router closed");
                Ok(())
            },
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                tracing::warn!(timeout = ?timeout, "Router close timed out, handler tasks aborted");
                Err(RouterError::CloseTimeout(timeout))
            },
        }
    }
}

/// Per-handler consuming task.
struct Worker {
    name: String,
    topic: String,
    group: String,
    handler: Arc<dyn MessageHandler>,
    broker: Arc<dyn Broker>,
    dead_letters: Arc<dyn DeadLetterSink>,
    states: States,
    max_deliveries: u32,
    resubscribe_delay: Duration,
}

impl Worker {
    async fn run(self, mut subscription: Subscription, shutdown: watch::Receiver<bool>) {
        let ctx = Context::background()
            .with_handler(self.name.clone())
            .with_shutdown(shutdown);

        loop {
            let next = tokio::select! {
                biased;
                () = ctx.cancelled() => break,
                next = subscription.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(&ctx, delivery).await,
                Some(Err(e)) => {
                    tracing::error!(handler = %self.name, error = %e, "Error receiving message");
                },
                None => match self.resubscribe(&ctx).await {
                    Some(fresh) => subscription = fresh,
                    None => break,
                },
            }
        }

        set_state(&self.states, &self.name, HandlerState::Closed);
        tracing::info!(handler = %self.name, "Handler stopped");
    }

    /// Reopen the subscription after its stream ended. Returns `None` when
    /// shutdown was requested meanwhile.
    async fn resubscribe(&self, ctx: &Context) -> Option<Subscription> {
        loop {
            tracing::warn!(
                handler = %self.name,
                delay = ?self.resubscribe_delay,
                "Subscription ended, resubscribing"
            );
            tokio::select! {
                () = ctx.cancelled() => return None,
                () = tokio::time::sleep(self.resubscribe_delay) => {},
            }
            match self.broker.subscribe(&self.topic, &self.group).await {
                Ok(subscription) => return Some(subscription),
                Err(e) => {
                    tracing::error!(handler = %self.name, error = %e, "Failed to resubscribe");
                },
            }
        }
    }

    async fn process(&self, ctx: &Context, delivery: Delivery) {
        set_state(&self.states, &self.name, HandlerState::Processing);
        let started = Instant::now();
        let attempt = delivery.attempt();

        let result = self.handler.handle(ctx, delivery.message()).await;

        match result {
            Ok(()) => {
                delivery.ack();
                RouterMetrics::record_handled(&self.name, started.elapsed());
            },
            Err(error) if ctx.is_cancelled() => {
                tracing::info!(
                    handler = %self.name,
                    error = %error,
                    "Shutting down, message will be redelivered"
                );
                delivery.nack();
                RouterMetrics::record_nack(&self.name);
            },
            Err(error) if error.is_permanent() || attempt >= self.max_deliveries => {
                let letter = DeadLetter {
                    handler: self.name.clone(),
                    topic: self.topic.clone(),
                    message: delivery.message().clone(),
                    reason: error.to_string(),
                    attempts: attempt,
                    failed_at: Utc::now(),
                };
                match self.dead_letters.dead_letter(&letter).await {
                    Ok(()) => delivery.ack(),
                    Err(e) => {
                        tracing::error!(
                            handler = %self.name,
                            error = %e,
                            "Dead-letter sink failed, message will be redelivered"
                        );
                        delivery.nack();
                        RouterMetrics::record_nack(&self.name);
                    },
                }
            },
            Err(error) => {
                tracing::warn!(
                    handler = %self.name,
                    attempt,
                    error = %error,
                    "Message nacked for redelivery"
                );
                delivery.nack();
                RouterMetrics::record_nack(&self.name);
            },
        }

        set_state(&self.states, &self.name, HandlerState::Idle);
    }
}
