//! Ops read model convergence under arbitrary delivery order.
//!
//! Events that arrive before the document they update are not yet
//! projectable; they are retried after the others, the way the router's
//! redelivery does.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use chrono::Duration;
use proptest::prelude::*;
use std::sync::Arc;
use ticketflow_core::environment::Clock;
use ticketflow_testing::{InMemoryDocumentStore, test_clock};
use tickets::TicketingError;
use tickets::entities::{
    BookingMade, Header, Money, OpsBooking, TicketBookingConfirmed, TicketPrinted,
    TicketReceiptIssued, TicketRefunded,
};
use tickets::read_model::OpsBookingReadModel;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum Lifecycle {
    Booked(BookingMade),
    Confirmed(TicketBookingConfirmed),
    Printed(TicketPrinted),
    ReceiptIssued(TicketReceiptIssued),
    Refunded(TicketRefunded),
}

fn header(key: &str, minutes: i64) -> Header {
    let mut header = Header::new(&test_clock(), key);
    header.published_at = test_clock().now() + Duration::minutes(minutes);
    header
}

fn lifecycle(booking_id: Uuid) -> Vec<Lifecycle> {
    vec![
        Lifecycle::Booked(BookingMade {
            header: header(&booking_id.to_string(), 0),
            number_of_tickets: 1,
            booking_id,
            customer_email: "fan@example.com".to_string(),
            show_id: Uuid::nil(),
        }),
        Lifecycle::Confirmed(TicketBookingConfirmed {
            header: header("req-1t-1", 1),
            ticket_id: "t-1".to_string(),
            customer_email: "fan@example.com".to_string(),
            price: Money::new("50.00", ""),
            booking_id: Some(booking_id.to_string()),
        }),
        Lifecycle::ReceiptIssued(TicketReceiptIssued {
            header: header("req-1t-1", 2),
            ticket_id: "t-1".to_string(),
            receipt_number: "receipt-1".to_string(),
            issued_at: test_clock().now() + Duration::minutes(2),
        }),
        Lifecycle::Printed(TicketPrinted {
            header: header("req-1t-1", 3),
            ticket_id: "t-1".to_string(),
            file_name: "t-1-ticket.html".to_string(),
        }),
        Lifecycle::Refunded(TicketRefunded {
            header: header("refund-1", 4),
            ticket_id: "t-1".to_string(),
        }),
    ]
}

async fn apply(
    model: &OpsBookingReadModel<InMemoryDocumentStore>,
    event: &Lifecycle,
) -> Result<(), TicketingError> {
    match event {
        Lifecycle::Booked(e) => model.on_booking_made(e).await,
        Lifecycle::Confirmed(e) => model.on_ticket_booking_confirmed(e).await,
        Lifecycle::Printed(e) => model.on_ticket_printed(e).await,
        Lifecycle::ReceiptIssued(e) => model.on_ticket_receipt_issued(e).await,
        Lifecycle::Refunded(e) => model.on_ticket_refunded(e).await,
    }
}

/// Deliver `events` in order, redelivering not yet projectable ones until
/// every event is applied.
async fn project(events: Vec<Lifecycle>, booking_id: Uuid) -> OpsBooking {
    let model = OpsBookingReadModel::new(Arc::new(InMemoryDocumentStore::new()));
    let mut pending = events;

    for _ in 0..pending.len() + 1 {
        let mut deferred = Vec::new();
        for event in pending {
            match apply(&model, &event).await {
                Ok(()) => {},
                Err(TicketingError::NotYetProjectable(_)) => deferred.push(event),
                Err(other) => panic!("unexpected projection error: {other}"),
            }
        }
        pending = deferred;
        if pending.is_empty() {
            break;
        }
    }
    assert!(pending.is_empty(), "events never became projectable: {pending:?}");

    model
        .reservation(&booking_id.to_string())
        .await
        .unwrap()
        .expect("booking projected")
}

fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut all = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let first = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, first.clone());
            all.push(tail);
        }
    }
    all
}

#[tokio::test]
async fn booking_confirmation_and_receipt_converge_in_every_order() {
    let booking_id = Uuid::new_v4();
    let events: Vec<Lifecycle> = lifecycle(booking_id).into_iter().take(3).collect();

    let orders = permutations(&events);
    assert_eq!(orders.len(), 6);

    let mut documents = Vec::new();
    for order in orders {
        documents.push(project(order, booking_id).await);
    }

    let expected = &documents[0];
    let ticket = &expected.tickets["t-1"];
    assert_eq!(ticket.status, "confirmed");
    assert_eq!(ticket.price_currency, "USD");
    assert_eq!(ticket.receipt_number, "receipt-1");
    assert_eq!(expected.last_update, test_clock().now() + Duration::minutes(2));
    for document in &documents {
        assert_eq!(document, expected);
    }
}

#[tokio::test]
async fn redelivered_events_do_not_change_the_document() {
    let booking_id = Uuid::new_v4();
    let once = project(lifecycle(booking_id), booking_id).await;

    let mut twice = lifecycle(booking_id);
    twice.extend(lifecycle(booking_id));
    let replayed = project(twice, booking_id).await;

    assert_eq!(once, replayed);
    assert!(once.tickets["t-1"].is_refunded());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn full_lifecycle_converges_in_any_order(order in Just((0..5_usize).collect::<Vec<_>>()).prop_shuffle()) {
        let booking_id = Uuid::new_v4();
        let events = lifecycle(booking_id);

        let in_order = tokio_test::block_on(project(events.clone(), booking_id));
        let shuffled = tokio_test::block_on(project(
            order.iter().map(|&i| events[i].clone()).collect(),
            booking_id,
        ));

        prop_assert_eq!(&shuffled, &in_order);
        let ticket = &shuffled.tickets["t-1"];
        prop_assert!(ticket.is_refunded());
        prop_assert_eq!(&ticket.printed_file_name, "t-1-ticket.html");
        prop_assert_eq!(shuffled.last_update, test_clock().now() + Duration::minutes(4));
    }
}
