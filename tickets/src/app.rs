//! Composition root.
//!
//! Every component of the service is constructed here and handed its
//! dependencies explicitly:
//!
//! ```text
//! Config ─► PgPool ─┬─ PostgresOutbox ─────────► Forwarder ─► broker
//!                   ├─ PostgresDedupLedger ─┐
//!                   ├─ repositories ────────┼─► handlers ─► Router ◄─ broker
//!                   ├─ ops read model ──────┘              └─ DeadLetterQueue
//!                   └─ BookingAllocator ─► TicketService
//! ```
//!
//! [`register_handlers`] is shared with the tests, which wire the same
//! handlers over in-memory dependencies.

use crate::booking::BookingAllocator;
use crate::capabilities::{Capabilities, InMemoryServices};
use crate::config::Config;
use crate::entities::{
    BookingMade, RefundTicket, TicketBookingCanceled, TicketBookingConfirmed, TicketPrinted,
    TicketReceiptIssued, TicketRefunded,
};
use crate::handlers::{
    APPEND_TO_REFUNDS, APPEND_TO_TRACKER, AppendToRefundsHandler, AppendToTrackerHandler,
    BOOK_EXTERNAL_SEAT, BookExternalSeatHandler, ISSUE_RECEIPT, IssueReceiptHandler, PRINT_TICKET,
    PrintTicketHandler, REFUND_TICKET, REMOVE_TICKET, RefundTicketHandler, RemoveTicketHandler,
    STORE_TICKET, StoreTicketHandler,
};
use crate::read_model::{OPS_BOOKINGS_KEY, OPS_BOOKINGS_TABLE, OpsBookingReadModel};
use crate::repository::{
    self, PostgresShowsRepository, PostgresTicketsRepository, ShowsRepository, TicketsRepository,
};
use crate::service::TicketService;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use ticketflow_core::broker::Broker;
use ticketflow_core::dedup::DedupLedger;
use ticketflow_core::environment::{Clock, SystemClock};
use ticketflow_postgres::{DeadLetterQueue, PostgresDedupLedger, PostgresOutbox};
use ticketflow_projections::{DocumentStore, PostgresDocumentStore};
use ticketflow_redpanda::RedpandaBroker;
use ticketflow_runtime::{
    CommandBus, EventBus, Forwarder, ForwarderError, ForwarderHandle, Router, RouterError,
};

/// Boxed error of application startup and shutdown.
pub type AppError = Box<dyn std::error::Error + Send + Sync>;

/// What [`register_handlers`] wires the handlers from.
pub struct Dependencies<L, S> {
    /// Dedup ledger of effectful handlers
    pub ledger: Arc<L>,
    /// Outbound capabilities
    pub capabilities: Capabilities,
    /// Ticket storage
    pub tickets: Arc<dyn TicketsRepository>,
    /// Show storage
    pub shows: Arc<dyn ShowsRepository>,
    /// Ops read model
    pub read_model: Arc<OpsBookingReadModel<S>>,
    /// Bus handlers publish follow-up events on
    pub events: EventBus,
    /// Clock stamping follow-up events
    pub clock: Arc<dyn Clock>,
}

/// Register every handler of the service on `router`.
///
/// # Errors
///
/// Returns [`RouterError::DuplicateHandler`] if a handler is registered twice.
pub fn register_handlers<L, S>(router: &mut Router, deps: &Dependencies<L, S>) -> Result<(), RouterError>
where
    L: DedupLedger + 'static,
    S: DocumentStore + 'static,
{
    let caps = &deps.capabilities;

    router
        .add_event_handler::<TicketBookingConfirmed, _>(
            ISSUE_RECEIPT,
            Arc::new(IssueReceiptHandler::new(
                Arc::clone(&deps.ledger),
                Arc::clone(&caps.receipts),
                deps.events.clone(),
                Arc::clone(&deps.clock),
            )),
        )?
        .add_event_handler::<TicketBookingConfirmed, _>(
            APPEND_TO_TRACKER,
            Arc::new(AppendToTrackerHandler::new(
                Arc::clone(&deps.ledger),
                Arc::clone(&caps.spreadsheets),
            )),
        )?
        .add_event_handler::<TicketBookingConfirmed, _>(
            PRINT_TICKET,
            Arc::new(PrintTicketHandler::new(
                Arc::clone(&deps.ledger),
                Arc::clone(&caps.files),
                deps.events.clone(),
                Arc::clone(&deps.clock),
            )),
        )?
        .add_event_handler::<TicketBookingConfirmed, _>(
            STORE_TICKET,
            Arc::new(StoreTicketHandler::new(Arc::clone(&deps.tickets))),
        )?
        .add_event_handler::<TicketBookingCanceled, _>(
            APPEND_TO_REFUNDS,
            Arc::new(AppendToRefundsHandler::new(
                Arc::clone(&deps.ledger),
                Arc::clone(&caps.spreadsheets),
            )),
        )?
        .add_event_handler::<TicketBookingCanceled, _>(
            REMOVE_TICKET,
            Arc::new(RemoveTicketHandler::new(Arc::clone(&deps.tickets))),
        )?
        .add_event_handler::<BookingMade, _>(
            BOOK_EXTERNAL_SEAT,
            Arc::new(BookExternalSeatHandler::new(
                Arc::clone(&deps.ledger),
                Arc::clone(&deps.shows),
                Arc::clone(&caps.partner),
            )),
        )?
        .add_command_handler::<RefundTicket, _>(
            REFUND_TICKET,
            Arc::new(RefundTicketHandler::new(
                Arc::clone(&deps.ledger),
                Arc::clone(&caps.receipt_voids),
                Arc::clone(&caps.payments),
                deps.events.clone(),
                Arc::clone(&deps.clock),
            )),
        )?
        .require_command::<RefundTicket>();

    let model = &deps.read_model;
    router
        .add_event_handler::<BookingMade, _>("ops-read-model.booking-made", Arc::clone(model))?
        .add_event_handler::<TicketBookingConfirmed, _>(
            "ops-read-model.ticket-booking-confirmed",
            Arc::clone(model),
        )?
        .add_event_handler::<TicketPrinted, _>("ops-read-model.ticket-printed", Arc::clone(model))?
        .add_event_handler::<TicketReceiptIssued, _>(
            "ops-read-model.ticket-receipt-issued",
            Arc::clone(model),
        )?
        .add_event_handler::<TicketRefunded, _>("ops-read-model.ticket-refunded", Arc::clone(model))?;

    Ok(())
}

/// The assembled service.
pub struct Application {
    config: Config,
    pool: PgPool,
    broker: Arc<dyn Broker>,
    router: Router,
    service: TicketService,
    read_model: Arc<OpsBookingReadModel<PostgresDocumentStore>>,
    dead_letters: DeadLetterQueue,
    services: Arc<InMemoryServices>,
}

impl Application {
    /// Connect to the database and broker, run migrations and wire every
    /// component.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or broker is unreachable, a migration
    /// fails or handler registration is invalid.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        tracing::info!(
            postgres_url = %config.postgres.url,
            redpanda_brokers = %config.redpanda.brokers,
            "Building application"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.postgres.max_connections)
            .min_connections(config.postgres.min_connections)
            .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
            .connect(&config.postgres.url)
            .await?;
        ticketflow_postgres::migrate(&pool).await?;
        repository::migrate(&pool).await?;
        tracing::info!("Database ready");

        let broker: Arc<dyn Broker> = Arc::new(
            RedpandaBroker::builder()
                .brokers(&config.redpanda.brokers)
                .producer_acks(&config.redpanda.producer_acks)
                .compression(&config.redpanda.compression)
                .timeout(Duration::from_millis(config.redpanda.timeout_ms))
                .auto_offset_reset(&config.redpanda.auto_offset_reset)
                .session_timeout(Duration::from_millis(config.redpanda.session_timeout_ms))
                .build()?,
        );
        tracing::info!("Broker connected");

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = EventBus::with_outbox_topic(Arc::clone(&broker), &config.forwarder.outbox_topic);
        let commands = CommandBus::with_outbox_topic(Arc::clone(&broker), &config.forwarder.outbox_topic);

        let services = Arc::new(InMemoryServices::with_clock(Arc::clone(&clock)));
        let read_model = Arc::new(OpsBookingReadModel::new(Arc::new(PostgresDocumentStore::new(
            pool.clone(),
            OPS_BOOKINGS_TABLE,
            OPS_BOOKINGS_KEY,
        ))));
        let dead_letters = DeadLetterQueue::new(pool.clone());

        let mut router = Router::new(Arc::clone(&broker), config.router_config())
            .with_dead_letter_sink(Arc::new(dead_letters.clone()));
        register_handlers(
            &mut router,
            &Dependencies {
                ledger: Arc::new(PostgresDedupLedger::new(pool.clone())),
                capabilities: Capabilities::in_memory(&services),
                tickets: Arc::new(PostgresTicketsRepository::new(pool.clone())),
                shows: Arc::new(PostgresShowsRepository::new(pool.clone())),
                read_model: Arc::clone(&read_model),
                events: events.clone(),
                clock: Arc::clone(&clock),
            },
        )?;

        let allocator = BookingAllocator::new(pool.clone(), events.clone(), Arc::clone(&clock), config.retry_policy());
        let service = TicketService::new(events, commands, Arc::new(allocator), clock);

        Ok(Self {
            config,
            pool,
            broker,
            router,
            service,
            read_model,
            dead_letters,
            services,
        })
    }

    /// Inbound operations.
    #[must_use]
    pub const fn service(&self) -> &TicketService {
        &self.service
    }

    /// Ops read model queries.
    #[must_use]
    pub fn read_model(&self) -> &OpsBookingReadModel<PostgresDocumentStore> {
        &self.read_model
    }

    /// Operator access to dead-lettered messages.
    #[must_use]
    pub const fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// The in-process external services.
    #[must_use]
    pub const fn external_services(&self) -> &Arc<InMemoryServices> {
        &self.services
    }

    /// Start the router and the forwarder and [`serve`] until `shutdown`
    /// resolves or the forwarder fails, then close the database pool.
    ///
    /// # Errors
    ///
    /// See [`serve`].
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<(), AppError> {
        let forwarder = Forwarder::new(
            Arc::new(PostgresOutbox::new(self.pool.clone())),
            Arc::clone(&self.broker),
            self.config.forwarder_config(),
        )
        .spawn();

        let timeout = Duration::from_secs(self.config.server.shutdown_timeout);
        let result = serve(&mut self.router, forwarder, shutdown, timeout).await;

        self.pool.close().await;
        tracing::info!("Ticket service stopped");
        result
    }

    /// Run until Ctrl+C or SIGTERM.
    ///
    /// # Errors
    ///
    /// See [`Application::run_until`].
    pub async fn run(self) -> Result<(), AppError> {
        self.run_until(shutdown_signal()).await
    }
}

/// Run `router` next to a spawned `forwarder` until `shutdown` resolves, then
/// stop both within `shutdown_timeout`.
///
/// A forwarder that ends on its own has lost the outbox; the router is closed
/// and the forwarder's error returned, so the process exits and its
/// supervisor restarts it.
///
/// # Errors
///
/// Returns an error if the router cannot start, the forwarder fails while
/// running or a component fails to stop cleanly.
pub async fn serve(
    router: &mut Router,
    mut forwarder: ForwarderHandle,
    shutdown: impl Future<Output = ()>,
    shutdown_timeout: Duration,
) -> Result<(), AppError> {
    if let Err(error) = router.run().await {
        tracing::error!(%error, "Router failed to start");
        forwarder.stop().await?;
        return Err(error.into());
    }
    tracing::info!("Ticket service running");

    let failed = tokio::select! {
        () = shutdown => None,
        ended = forwarder.join() => Some(ended.err().unwrap_or_else(|| {
            ForwarderError::Join("forwarder exited before shutdown".to_string())
        })),
    };

    if let Some(error) = failed {
        tracing::error!(%error, "Forwarder failed, shutting down");
        if let Err(close) = router.close().await {
            tracing::warn!(error = %close, "Router did not close cleanly");
        }
        return Err(error.into());
    }

    tracing::info!("Shutting down");
    let stopped = tokio::time::timeout(shutdown_timeout, async {
        let router = router.close().await;
        let forwarder = forwarder.stop().await;
        (router, forwarder)
    })
    .await;

    match stopped {
        Ok((router, forwarder)) => {
            router?;
            forwarder?;
        },
        Err(_) => {
            tracing::warn!(timeout_secs = shutdown_timeout.as_secs(), "Shutdown timed out");
        },
    }
    Ok(())
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(error) => {
                tracing::error!(%error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}
