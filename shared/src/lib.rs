pub mod allocation;
pub mod clock;
pub mod db;
pub mod error;
pub mod models;
pub mod order_state;
pub mod promotion;
pub mod release;
pub mod schema;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use clock::{lottery_rng, Clock, FixedClock, SharedClock, SystemClock};
pub use error::{escalate_invariant, TicketError, TicketResult};
pub use order_state::{OrderEvent, OrderStatus};
pub use release::{ReleaseMethod, RequestDraft};

/// Payloads written to the outbox and published for the notification side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    ReleaseAllocated {
        release_id: Uuid,
        allocated: usize,
        reserves: usize,
        at: DateTime<Utc>,
    },
    TicketPromoted {
        ticket_id: Uuid,
        request_id: Uuid,
        user_id: Uuid,
        release_id: Uuid,
        at: DateTime<Utc>,
    },
    /// A completed payment found fewer live tickets than the order covered;
    /// someone has to refund the difference.
    PaidTicketsMissing {
        order_id: Uuid,
        gateway_order_id: String,
        user_id: Uuid,
        payment_id: Option<String>,
        linked: usize,
        paid: usize,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ReleaseAllocated { .. } => "ReleaseAllocated",
            DomainEvent::TicketPromoted { .. } => "TicketPromoted",
            DomainEvent::PaidTicketsMissing { .. } => "PaidTicketsMissing",
        }
    }

    pub fn aggregate_id(&self) -> Uuid {
        match self {
            DomainEvent::ReleaseAllocated { release_id, .. } => *release_id,
            DomainEvent::TicketPromoted { ticket_id, .. } => *ticket_id,
            DomainEvent::PaidTicketsMissing { order_id, .. } => *order_id,
        }
    }

    pub fn to_outbox(&self) -> TicketResult<models::NewOutboxEvent> {
        Ok(models::NewOutboxEvent {
            id: Uuid::new_v4(),
            aggregate_id: self.aggregate_id(),
            event_type: self.event_type().to_string(),
            event_data: serde_json::to_value(self)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promoted_event_is_tagged() {
        let event = DomainEvent::TicketPromoted {
            ticket_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            release_id: Uuid::new_v4(),
            at: Utc::now(),
        };
        let row = event.to_outbox().unwrap();
        assert_eq!(row.event_type, "TicketPromoted");
        assert_eq!(row.event_data["type"], "TicketPromoted");
        let back: DomainEvent = serde_json::from_value(row.event_data).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn missing_paid_tickets_are_keyed_by_order() {
        let order_id = Uuid::new_v4();
        let event = DomainEvent::PaidTicketsMissing {
            order_id,
            gateway_order_id: "ord-1".to_string(),
            user_id: Uuid::new_v4(),
            payment_id: Some("pay-1".to_string()),
            linked: 2,
            paid: 0,
            at: Utc::now(),
        };
        let row = event.to_outbox().unwrap();
        assert_eq!(row.aggregate_id, order_id);
        assert_eq!(row.event_type, "PaidTicketsMissing");
        assert_eq!(row.event_data["linked"], 2);
    }
}
