//! JSON marshaling of typed payloads into [`Message`] envelopes.
//!
//! Marshaling records the payload's [`Payload::NAME`] under the `type` metadata
//! key and the context's correlation id (minting one when absent).
//! Unmarshaling refuses envelopes whose `type` does not match the target, so a
//! consumer never decodes a payload that merely happens to be shape-compatible.

use crate::context::Context;
use crate::message::{CORRELATION_ID_KEY, Message, TYPE_KEY};
use crate::payload::Payload;
use thiserror::Error;

/// Errors from marshaling payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    /// The payload could not be serialized.
    #[error("Failed to serialize {name}: {reason}")]
    Serialize {
        /// Payload name
        name: &'static str,
        /// Serializer error
        reason: String,
    },

    /// The envelope carries a different payload type.
    #[error("Envelope type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Type the consumer expected
        expected: &'static str,
        /// Type recorded on the envelope (empty when absent)
        found: String,
    },

    /// The payload bytes could not be decoded.
    #[error("Failed to deserialize {name}: {reason}")]
    Deserialize {
        /// Payload name
        name: &'static str,
        /// Deserializer error
        reason: String,
    },
}

/// Serialize a payload into a new message.
///
/// # Errors
///
/// Returns [`MarshalError::Serialize`] if serde fails.
pub fn marshal<P: Payload>(ctx: &Context, payload: &P) -> Result<Message, MarshalError> {
    let bytes = serde_json::to_vec(payload).map_err(|e| MarshalError::Serialize {
        name: P::NAME,
        reason: e.to_string(),
    })?;

    let mut message = Message::new(bytes);
    message.metadata.set(TYPE_KEY, P::NAME);
    message
        .metadata
        .set(CORRELATION_ID_KEY, ctx.correlation_id_or_new());
    Ok(message)
}

/// Whether the envelope's `type` names `P`.
#[must_use]
pub fn is_type<P: Payload>(message: &Message) -> bool {
    message.payload_type() == Some(P::NAME)
}

/// Deserialize a message into `P`.
///
/// # Errors
///
/// Returns [`MarshalError::TypeMismatch`] when the envelope names another type,
/// or [`MarshalError::Deserialize`] when the bytes do not decode.
pub fn unmarshal<P: Payload>(message: &Message) -> Result<P, MarshalError> {
    if !is_type::<P>(message) {
        return Err(MarshalError::TypeMismatch {
            expected: P::NAME,
            found: message.payload_type().unwrap_or_default().to_string(),
        });
    }

    serde_json::from_slice(&message.payload).map_err(|e| MarshalError::Deserialize {
        name: P::NAME,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TicketPrinted {
        ticket_id: String,
        file_name: String,
    }

    impl Payload for TicketPrinted {
        const NAME: &'static str = "TicketPrinted";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct TicketRefunded {
        ticket_id: String,
    }

    impl Payload for TicketRefunded {
        const NAME: &'static str = "TicketRefunded";
    }

    fn printed() -> TicketPrinted {
        TicketPrinted {
            ticket_id: "t-1".to_string(),
            file_name: "t-1-ticket.html".to_string(),
        }
    }

    #[test]
    fn marshal_records_type_and_correlation() {
        let ctx = Context::background().with_correlation_id("corr-7");
        let message = marshal(&ctx, &printed()).map_err(|e| e.to_string());

        let Ok(message) = message else {
            unreachable!("serializing a plain struct cannot fail");
        };
        assert_eq!(message.payload_type(), Some("TicketPrinted"));
        assert_eq!(message.correlation_id(), Some("corr-7"));
    }

    #[test]
    fn unmarshal_round_trips() {
        let ctx = Context::background();
        let decoded = marshal(&ctx, &printed()).and_then(|m| unmarshal::<TicketPrinted>(&m));
        assert_eq!(decoded, Ok(printed()));
    }

    #[test]
    fn unmarshal_rejects_other_type() {
        let ctx = Context::background();
        let result = marshal(&ctx, &printed()).and_then(|m| unmarshal::<TicketRefunded>(&m));

        assert!(matches!(
            result,
            Err(MarshalError::TypeMismatch { expected: "TicketRefunded", ref found })
                if found == "TicketPrinted"
        ));
    }

    #[test]
    fn unmarshal_reports_bad_bytes() {
        let mut message = Message::new(b"not json".to_vec());
        message.metadata.set(TYPE_KEY, "TicketPrinted");

        assert!(matches!(
            unmarshal::<TicketPrinted>(&message),
            Err(MarshalError::Deserialize { .. })
        ));
    }
}
