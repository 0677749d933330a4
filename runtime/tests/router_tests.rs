//! Router behavior against the in-memory broker.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ticketflow_core::Context;
use ticketflow_core::payload::{Command, Event, Payload};
use ticketflow_runtime::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use ticketflow_runtime::{
    CommandBus, CommandHandler, EventBus, EventHandler, HandlerError, HandlerState, RetryPolicy,
    Router, RouterConfig, RouterError,
};
use ticketflow_testing::InMemoryBroker;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TicketPrinted {
    ticket_id: String,
}

impl Payload for TicketPrinted {
    const NAME: &'static str = "TicketPrinted";
}
impl Event for TicketPrinted {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RefundTicket {
    ticket_id: String,
}

impl Payload for RefundTicket {
    const NAME: &'static str = "RefundTicket";
}
impl Command for RefundTicket {}

/// What the scripted handler does on its n-th call (1-based).
#[derive(Clone, Copy)]
enum Step {
    Succeed,
    FailTransient,
    FailPermanent,
    Panic,
}

struct Scripted {
    calls: AtomicUsize,
    script: Vec<Step>,
    seen: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn step(&self) -> Step {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.get(call).copied().unwrap_or(Step::Succeed)
    }
}

#[async_trait]
impl EventHandler<TicketPrinted> for Scripted {
    async fn handle(&self, _ctx: &Context, event: TicketPrinted) -> Result<(), HandlerError> {
        match self.step() {
            Step::Succeed => {
                self.seen.lock().unwrap().push(event.ticket_id);
                Ok(())
            },
            Step::FailTransient => Err(HandlerError::transient("not yet projectable")),
            Step::FailPermanent => Err(HandlerError::permanent("invalid ticket")),
            Step::Panic => panic!("handler exploded"),
        }
    }
}

#[async_trait]
impl CommandHandler<RefundTicket> for Scripted {
    async fn handle(&self, _ctx: &Context, command: RefundTicket) -> Result<(), HandlerError> {
        self.step();
        self.seen.lock().unwrap().push(command.ticket_id);
        Ok(())
    }
}

/// Blocks inside `handle` until released.
#[derive(Default)]
struct Gated {
    entered: Notify,
    release: Notify,
    handled: AtomicUsize,
}

#[async_trait]
impl EventHandler<TicketPrinted> for Gated {
    async fn handle(&self, _ctx: &Context, _event: TicketPrinted) -> Result<(), HandlerError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    letters: Mutex<Vec<DeadLetter>>,
    fail: bool,
}

impl DeadLetterSink for RecordingSink {
    fn dead_letter<'a>(
        &'a self,
        letter: &'a DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail {
                return Err(DeadLetterError::Storage("dlq down".to_string()));
            }
            self.letters.lock().unwrap().push(letter.clone());
            Ok(())
        })
    }
}

fn config() -> RouterConfig {
    RouterConfig {
        max_deliveries: 3,
        retry: RetryPolicy::builder()
            .max_retries(0)
            .initial_delay(Duration::from_millis(1))
            .build(),
        close_timeout: Duration::from_secs(2),
        resubscribe_delay: Duration::from_millis(5),
        ..RouterConfig::default()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(condition(), "condition not met in time");
}

async fn publish_printed(broker: &Arc<InMemoryBroker>, ticket_id: &str) {
    EventBus::new(broker.clone())
        .publish(
            &Context::background(),
            &TicketPrinted {
                ticket_id: ticket_id.to_string(),
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn handled_message_is_acked() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = Scripted::new(vec![]);
    let mut router = Router::new(broker.clone(), config());
    router
        .add_event_handler::<TicketPrinted, _>("print-log", handler.clone())
        .unwrap();

    let running = router.running();
    router.run().await.unwrap();
    assert!(running.wait().await);

    publish_printed(&broker, "t-1").await;
    eventually(|| broker.acked("events.TicketPrinted", "svc-tickets.print-log") == 1).await;
    router.close().await.unwrap();

    assert_eq!(*handler.seen.lock().unwrap(), vec!["t-1".to_string()]);
    assert_eq!(router.handler_state("print-log"), Some(HandlerState::Closed));
}

#[tokio::test]
async fn permanent_failure_is_dead_lettered_and_acked() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = Scripted::new(vec![Step::FailPermanent]);
    let sink = Arc::new(RecordingSink::default());
    let mut router = Router::new(broker.clone(), config()).with_dead_letter_sink(sink.clone());
    router
        .add_event_handler::<TicketPrinted, _>("print-log", handler.clone())
        .unwrap();
    router.run().await.unwrap();

    publish_printed(&broker, "t-bad").await;
    eventually(|| broker.acked("events.TicketPrinted", "svc-tickets.print-log") == 1).await;
    router.close().await.unwrap();

    assert_eq!(handler.calls(), 1);
    let letters = sink.letters.lock().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].handler, "print-log");
    assert_eq!(letters[0].attempts, 1);
}

#[tokio::test]
async fn transient_failure_is_redelivered_until_delivery_budget() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = Scripted::new(vec![Step::FailTransient; 10]);
    let sink = Arc::new(RecordingSink::default());
    let mut router = Router::new(broker.clone(), config()).with_dead_letter_sink(sink.clone());
    router
        .add_event_handler::<TicketPrinted, _>("print-log", handler.clone())
        .unwrap();
    router.run().await.unwrap();

    publish_printed(&broker, "t-never-projectable").await;
    eventually(|| broker.acked("events.TicketPrinted", "svc-tickets.print-log") == 1).await;
    router.close().await.unwrap();

    assert_eq!(handler.calls(), 3);
    let letters = sink.letters.lock().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 3);
}

#[tokio::test]
async fn transient_failure_recovers_on_redelivery() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = Scripted::new(vec![Step::FailTransient, Step::Succeed]);
    let sink = Arc::new(RecordingSink::default());
    let mut router = Router::new(broker.clone(), config()).with_dead_letter_sink(sink.clone());
    router
        .add_event_handler::<TicketPrinted, _>("print-log", handler.clone())
        .unwrap();
    router.run().await.unwrap();

    publish_printed(&broker, "t-late").await;
    eventually(|| broker.acked("events.TicketPrinted", "svc-tickets.print-log") == 1).await;
    router.close().await.unwrap();

    assert_eq!(handler.calls(), 2);
    assert!(sink.letters.lock().unwrap().is_empty());
}

#[tokio::test]
async fn panic_is_recovered_and_redelivered() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = Scripted::new(vec![Step::Panic, Step::Succeed]);
    let mut router = Router::new(broker.clone(), config());
    router
        .add_event_handler::<TicketPrinted, _>("print-log", handler.clone())
        .unwrap();
    router.run().await.unwrap();

    publish_printed(&broker, "t-1").await;
    eventually(|| broker.acked("events.TicketPrinted", "svc-tickets.print-log") == 1).await;
    router.close().await.unwrap();

    assert_eq!(handler.calls(), 2);
    assert_eq!(*handler.seen.lock().unwrap(), vec!["t-1".to_string()]);
}

#[tokio::test]
async fn failing_dead_letter_sink_nacks() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = Scripted::new(vec![Step::FailPermanent, Step::Succeed]);
    let sink = Arc::new(RecordingSink {
        fail: true,
        ..RecordingSink::default()
    });
    let mut router = Router::new(broker.clone(), config()).with_dead_letter_sink(sink);
    router
        .add_event_handler::<TicketPrinted, _>("print-log", handler.clone())
        .unwrap();
    router.run().await.unwrap();

    publish_printed(&broker, "t-1").await;
    eventually(|| broker.acked("events.TicketPrinted", "svc-tickets.print-log") == 1).await;
    router.close().await.unwrap();

    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn each_handler_receives_every_event() {
    let broker = Arc::new(InMemoryBroker::new());
    let first = Scripted::new(vec![]);
    let second = Scripted::new(vec![]);
    let mut router = Router::new(broker.clone(), config());
    router
        .add_event_handler::<TicketPrinted, _>("first", first.clone())
        .unwrap()
        .add_event_handler::<TicketPrinted, _>("second", second.clone())
        .unwrap();
    router.run().await.unwrap();

    publish_printed(&broker, "t-1").await;
    eventually(|| {
        broker.acked("events.TicketPrinted", "svc-tickets.first") == 1
            && broker.acked("events.TicketPrinted", "svc-tickets.second") == 1
    })
    .await;
    router.close().await.unwrap();

    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 1);
}

#[tokio::test]
async fn commands_reach_their_handler() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = Scripted::new(vec![]);
    let mut router = Router::new(broker.clone(), config());
    router
        .add_command_handler::<RefundTicket, _>("refund-ticket", handler.clone())
        .unwrap()
        .require_command::<RefundTicket>();
    router.run().await.unwrap();

    CommandBus::new(broker.clone())
        .send(
            &Context::background(),
            &RefundTicket {
                ticket_id: "t-9".to_string(),
            },
        )
        .await
        .unwrap();
    eventually(|| broker.acked("commands.RefundTicket", "svc-tickets.refund-ticket") == 1).await;
    router.close().await.unwrap();

    assert_eq!(*handler.seen.lock().unwrap(), vec!["t-9".to_string()]);
}

#[tokio::test]
async fn run_rejects_invalid_registrations() {
    let broker = Arc::new(InMemoryBroker::new());

    let mut empty = Router::new(broker.clone(), config());
    assert_eq!(empty.run().await, Err(RouterError::NoHandlers));

    let mut duplicate = Router::new(broker.clone(), config());
    duplicate
        .add_event_handler::<TicketPrinted, _>("h", Scripted::new(vec![]))
        .unwrap();
    assert!(matches!(
        duplicate.add_event_handler::<TicketPrinted, _>("h", Scripted::new(vec![])),
        Err(RouterError::DuplicateHandler(name)) if name == "h"
    ));

    let mut ambiguous = Router::new(broker.clone(), config());
    ambiguous
        .add_command_handler::<RefundTicket, _>("a", Scripted::new(vec![]))
        .unwrap()
        .add_command_handler::<RefundTicket, _>("b", Scripted::new(vec![]))
        .unwrap();
    assert!(matches!(
        ambiguous.run().await,
        Err(RouterError::AmbiguousCommand { topic, .. }) if topic == "commands.RefundTicket"
    ));

    let mut missing = Router::new(broker, config());
    missing
        .add_event_handler::<TicketPrinted, _>("h", Scripted::new(vec![]))
        .unwrap();
    missing.require_command::<RefundTicket>();
    assert_eq!(
        missing.run().await,
        Err(RouterError::MissingHandler("commands.RefundTicket".to_string()))
    );
}

#[tokio::test]
async fn handler_states_follow_lifecycle() {
    let broker = Arc::new(InMemoryBroker::new());
    let mut router = Router::new(broker.clone(), config());
    router
        .add_event_handler::<TicketPrinted, _>("print-log", Scripted::new(vec![]))
        .unwrap();

    assert_eq!(router.handler_state("print-log"), Some(HandlerState::Idle));
    assert_eq!(router.handler_state("unknown"), None);

    router.run().await.unwrap();
    assert!(router.is_running());
    assert_eq!(router.handler_state("print-log"), Some(HandlerState::Subscribed));
    assert_eq!(router.run().await, Err(RouterError::AlreadyRunning));

    router.close().await.unwrap();
    assert!(!router.is_running());
    assert_eq!(router.handler_state("print-log"), Some(HandlerState::Closed));
}

#[tokio::test]
async fn close_waits_for_in_flight_handler() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = Arc::new(Gated::default());
    let mut router = Router::new(broker.clone(), config());
    router
        .add_event_handler::<TicketPrinted, _>("print-log", handler.clone())
        .unwrap();
    router.run().await.unwrap();

    publish_printed(&broker, "t-1").await;
    handler.entered.notified().await;

    let closing = router.close();
    tokio::pin!(closing);
    let early = tokio::time::timeout(Duration::from_millis(50), &mut closing).await;
    assert!(early.is_err(), "close returned while a handler was in flight");
    assert_eq!(broker.acked("events.TicketPrinted", "svc-tickets.print-log"), 0);

    handler.release.notify_one();
    let closed = tokio::time::timeout(Duration::from_secs(1), closing)
        .await
        .expect("close should return once the handler finished");

    assert_eq!(closed, Ok(()));
    assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    assert_eq!(broker.acked("events.TicketPrinted", "svc-tickets.print-log"), 1);
}

#[tokio::test]
async fn close_gives_up_on_stuck_handler_after_timeout() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = Arc::new(Gated::default());
    let close_timeout = Duration::from_millis(100);
    let mut router = Router::new(
        broker.clone(),
        RouterConfig {
            close_timeout,
            ..config()
        },
    );
    router
        .add_event_handler::<TicketPrinted, _>("print-log", handler.clone())
        .unwrap();
    router.run().await.unwrap();

    publish_printed(&broker, "t-1").await;
    handler.entered.notified().await;

    let closed = tokio::time::timeout(Duration::from_secs(1), router.close())
        .await
        .expect("close should return after its timeout");

    assert_eq!(closed, Err(RouterError::CloseTimeout(close_timeout)));
    assert!(!router.is_running());
    assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
    assert_eq!(broker.acked("events.TicketPrinted", "svc-tickets.print-log"), 0);
}
