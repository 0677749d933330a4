//! Ticket payloads through the wire envelope.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use ticketflow_core::Context;
use ticketflow_core::environment::Clock;
use ticketflow_core::marshal::{is_type, marshal, unmarshal};
use ticketflow_core::message::{CORRELATION_ID_KEY, Message, TYPE_KEY};
use ticketflow_core::payload::Payload;
use ticketflow_testing::test_clock;
use tickets::entities::{
    BookingMade, Header, Money, RefundTicket, TicketBookingCanceled, TicketBookingConfirmed,
    TicketPrinted, TicketReceiptIssued, TicketRefunded,
};
use uuid::Uuid;

fn through_envelope<P>(payload: &P) -> P
where
    P: Payload + Serialize + DeserializeOwned + PartialEq + Debug,
{
    let message = marshal(&Context::background().with_correlation_id("corr-1"), payload).unwrap();
    assert!(is_type::<P>(&message));
    assert_eq!(message.metadata.get(CORRELATION_ID_KEY), Some("corr-1"));
    unmarshal(&message).unwrap()
}

#[test]
fn every_payload_survives_the_envelope() {
    let header = || Header::new(&test_clock(), "req-1t-1");
    let price = Money::new("120.50", "EUR");

    let booking = BookingMade {
        header: header(),
        number_of_tickets: 3,
        booking_id: Uuid::new_v4(),
        customer_email: "fan@example.com".to_string(),
        show_id: Uuid::new_v4(),
    };
    assert_eq!(through_envelope(&booking), booking);

    let confirmed = TicketBookingConfirmed {
        header: header(),
        ticket_id: "t-1".to_string(),
        customer_email: "fan@example.com".to_string(),
        price: price.clone(),
        booking_id: Some(booking.booking_id.to_string()),
    };
    assert_eq!(through_envelope(&confirmed), confirmed);

    let canceled = TicketBookingCanceled {
        header: header(),
        ticket_id: "t-1".to_string(),
        customer_email: "fan@example.com".to_string(),
        price,
    };
    assert_eq!(through_envelope(&canceled), canceled);

    let printed = TicketPrinted {
        header: header(),
        ticket_id: "t-1".to_string(),
        file_name: "t-1-ticket.html".to_string(),
    };
    assert_eq!(through_envelope(&printed), printed);

    let receipt = TicketReceiptIssued {
        header: header(),
        ticket_id: "t-1".to_string(),
        receipt_number: "receipt-1".to_string(),
        issued_at: test_clock().now(),
    };
    assert_eq!(through_envelope(&receipt), receipt);

    let refunded = TicketRefunded {
        header: header(),
        ticket_id: "t-1".to_string(),
    };
    assert_eq!(through_envelope(&refunded), refunded);

    let refund = RefundTicket {
        header: header(),
        ticket_id: "t-1".to_string(),
    };
    assert_eq!(through_envelope(&refund), refund);
}

#[test]
fn empty_currency_is_defaulted_once_at_decoding() {
    let body = serde_json::json!({
        "header": {
            "id": Uuid::new_v4(),
            "published_at": "2025-01-01T00:00:00Z",
            "idempotency_key": "req-1t-1",
        },
        "ticket_id": "t-1",
        "customer_email": "fan@example.com",
        "price": {"amount": "50.00", "currency": ""},
    });
    let mut message = Message::new(serde_json::to_vec(&body).unwrap());
    message.metadata.set(TYPE_KEY, TicketBookingConfirmed::NAME);

    let decoded: TicketBookingConfirmed = unmarshal(&message).unwrap();
    assert_eq!(decoded.price.currency(), "USD");
    assert_eq!(decoded.booking_id, None);

    let again = through_envelope(&decoded);
    assert_eq!(again.price, Money::new("50.00", "USD"));
}

#[test]
fn payload_of_another_type_is_rejected() {
    let printed = TicketPrinted {
        header: Header::new(&test_clock(), ""),
        ticket_id: "t-1".to_string(),
        file_name: "t-1-ticket.html".to_string(),
    };
    let message = marshal(&Context::background(), &printed).unwrap();

    assert!(!is_type::<TicketRefunded>(&message));
    assert!(unmarshal::<TicketRefunded>(&message).is_err());
}
