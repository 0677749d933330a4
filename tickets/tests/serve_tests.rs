//! Router and forwarder running side by side, as the service runs them.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ticketflow_core::Context;
use ticketflow_core::outbox::{OutboxError, OutboxReader, OutboxRow};
use ticketflow_runtime::{
    EventBus, EventHandler, Forwarder, ForwarderConfig, HandlerError, RetryPolicy, Router,
    RouterConfig,
};
use ticketflow_testing::{InMemoryBroker, InMemoryOutbox, init_test_tracing, test_clock};
use tickets::entities::{Header, TicketPrinted};
use tickets::serve;
use tokio::sync::oneshot;

/// Outbox whose database is gone.
struct UnreachableOutbox;

impl OutboxReader for UnreachableOutbox {
    fn poll<'a>(
        &'a self,
        _topic: &'a str,
        _after_offset: i64,
        _limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRow>, OutboxError>> + Send + 'a>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn cursor<'a>(
        &'a self,
        _forwarder_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i64, OutboxError>> + Send + 'a>> {
        Box::pin(async { Err(OutboxError::Storage("connection refused".to_string())) })
    }

    fn advance_cursor<'a>(
        &'a self,
        _forwarder_id: &'a str,
        _offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Default)]
struct PrintLog {
    printed: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl EventHandler<TicketPrinted> for PrintLog {
    async fn handle(&self, _ctx: &Context, event: TicketPrinted) -> Result<(), HandlerError> {
        self.printed.lock().unwrap().push(event.ticket_id);
        Ok(())
    }
}

fn router(broker: &Arc<InMemoryBroker>, log: &Arc<PrintLog>) -> Router {
    let mut router = Router::new(
        broker.clone(),
        RouterConfig {
            close_timeout: Duration::from_secs(1),
            resubscribe_delay: Duration::from_millis(5),
            ..RouterConfig::default()
        },
    );
    router
        .add_event_handler::<TicketPrinted, _>("print-log", Arc::clone(log))
        .unwrap();
    router
}

fn forwarder_config() -> ForwarderConfig {
    ForwarderConfig {
        poll_interval: Duration::from_millis(2),
        backoff: RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build(),
        ..ForwarderConfig::default()
    }
}

#[tokio::test]
async fn forwarder_storage_failure_ends_serving_with_error() {
    init_test_tracing();
    let broker = Arc::new(InMemoryBroker::new());
    let log = Arc::new(PrintLog::default());
    let mut router = router(&broker, &log);
    let forwarder = Forwarder::new(Arc::new(UnreachableOutbox), broker.clone(), forwarder_config()).spawn();

    let served = tokio::time::timeout(
        Duration::from_secs(2),
        serve(&mut router, forwarder, std::future::pending(), Duration::from_secs(1)),
    )
    .await
    .expect("serving should end when the forwarder fails");

    let error = served.expect_err("forwarder failure must be surfaced");
    assert!(error.to_string().contains("connection refused"), "unexpected error: {error}");
    assert!(!router.is_running());
}

#[tokio::test]
async fn committed_events_reach_handlers_until_shutdown() {
    init_test_tracing();
    let broker = Arc::new(InMemoryBroker::new());
    let outbox = Arc::new(InMemoryOutbox::new());
    let log = Arc::new(PrintLog::default());
    let mut router = router(&broker, &log);
    let forwarder = Forwarder::new(outbox.clone(), broker.clone(), forwarder_config()).spawn();

    let mut tx = outbox.begin();
    EventBus::new(broker.clone())
        .publish_in_tx(
            &Context::background(),
            outbox.as_ref(),
            &mut tx,
            &TicketPrinted {
                header: Header::new(&test_clock(), "5:req-1t-1"),
                ticket_id: "t-1".to_string(),
                file_name: "t-1-ticket.html".to_string(),
            },
        )
        .await
        .unwrap();
    outbox.commit(tx);

    let (stop, stopped) = oneshot::channel::<()>();
    let watched = Arc::clone(&log);
    tokio::spawn(async move {
        for _ in 0..400 {
            if !watched.printed.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _ = stop.send(());
    });

    let served = serve(
        &mut router,
        forwarder,
        async {
            let _ = stopped.await;
        },
        Duration::from_secs(1),
    )
    .await;

    assert!(served.is_ok(), "unexpected error: {served:?}");
    assert_eq!(*log.printed.lock().unwrap(), vec!["t-1".to_string()]);
    assert_eq!(outbox.cursor("forwarder").await.unwrap(), 1);
    assert!(!router.is_running());
}
