//! Payment order lifecycle driven by gateway webhook events.
//!
//! `PENDING -> INITIATED -> PROCESSED -> COMPLETED` is the happy path. Any
//! non-terminal order can drop to `FAILED`, `CANCELLED` or `VOIDED`, which
//! frees its tickets for reserve promotion. Terminal orders never change.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{TicketError, TicketResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Initiated,
    Processed,
    Completed,
    Failed,
    Cancelled,
    Voided,
}

impl OrderStatus {
    pub const NON_TERMINAL: [OrderStatus; 3] =
        [OrderStatus::Pending, OrderStatus::Initiated, OrderStatus::Processed];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Initiated => "INITIATED",
            OrderStatus::Processed => "PROCESSED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Voided => "VOIDED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !Self::NON_TERMINAL.contains(self)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "INITIATED" => Ok(OrderStatus::Initiated),
            "PROCESSED" => Ok(OrderStatus::Processed),
            "COMPLETED" => Ok(OrderStatus::Completed),
            "FAILED" => Ok(OrderStatus::Failed),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "VOIDED" => Ok(OrderStatus::Voided),
            other => Err(TicketError::Invariant(format!("unknown order status {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderEvent {
    #[serde(rename = "order.paymentinitiated")]
    PaymentInitiated,
    #[serde(rename = "order.paymentprocessed")]
    PaymentProcessed,
    #[serde(rename = "order.paymentcompleted")]
    PaymentCompleted,
    #[serde(rename = "order.paymentfailed")]
    PaymentFailed,
    #[serde(rename = "order.paymentcancelled")]
    PaymentCancelled,
    #[serde(rename = "order.cancelled")]
    Cancelled,
    #[serde(rename = "order.paymentvoided")]
    PaymentVoided,
    #[serde(rename = "order.updated")]
    Updated,
    #[serde(rename = "order.deleted")]
    Deleted,
    #[serde(rename = "order.terminal.event")]
    TerminalEvent,
}

impl OrderEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEvent::PaymentInitiated => "order.paymentinitiated",
            OrderEvent::PaymentProcessed => "order.paymentprocessed",
            OrderEvent::PaymentCompleted => "order.paymentcompleted",
            OrderEvent::PaymentFailed => "order.paymentfailed",
            OrderEvent::PaymentCancelled => "order.paymentcancelled",
            OrderEvent::Cancelled => "order.cancelled",
            OrderEvent::PaymentVoided => "order.paymentvoided",
            OrderEvent::Updated => "order.updated",
            OrderEvent::Deleted => "order.deleted",
            OrderEvent::TerminalEvent => "order.terminal.event",
        }
    }

    pub fn is_audit_only(&self) -> bool {
        matches!(self, OrderEvent::Updated | OrderEvent::Deleted | OrderEvent::TerminalEvent)
    }
}

impl fmt::Display for OrderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderEvent {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| TicketError::InvalidRequest(format!("unknown webhook event type {}", s)))
    }
}

/// What applying an event to an order requires of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub frees_tickets: bool,
    pub marks_paid: bool,
    pub sends_receipt: bool,
    pub records_payment: bool,
}

impl Transition {
    fn audit(status: OrderStatus) -> Self {
        Self {
            from: status,
            to: status,
            frees_tickets: false,
            marks_paid: false,
            sends_receipt: false,
            records_payment: false,
        }
    }

    fn to(from: OrderStatus, to: OrderStatus) -> Self {
        Self { to, ..Self::audit(from) }
    }

    pub fn changes_status(&self) -> bool {
        self.from != self.to
    }
}

pub fn transition(order_id: &str, status: OrderStatus, event: OrderEvent) -> TicketResult<Transition> {
    if event.is_audit_only() {
        return Ok(Transition::audit(status));
    }
    if status.is_terminal() {
        return Err(TicketError::NotUpdatable {
            order_id: order_id.to_string(),
            status: status.to_string(),
        });
    }

    use OrderStatus::*;
    let next = match (event, status) {
        (OrderEvent::PaymentInitiated, Pending) => Transition {
            records_payment: true,
            ..Transition::to(status, Initiated)
        },
        (OrderEvent::PaymentProcessed, Initiated) => Transition::to(status, Processed),
        (OrderEvent::PaymentCompleted, Processed | Initiated) => Transition {
            marks_paid: true,
            sends_receipt: true,
            ..Transition::to(status, Completed)
        },
        (OrderEvent::PaymentFailed, _) => Transition {
            frees_tickets: true,
            ..Transition::to(status, Failed)
        },
        (OrderEvent::PaymentCancelled | OrderEvent::Cancelled, _) => Transition {
            frees_tickets: true,
            ..Transition::to(status, Cancelled)
        },
        (OrderEvent::PaymentVoided, _) => Transition {
            frees_tickets: true,
            ..Transition::to(status, Voided)
        },
        _ => {
            return Err(TicketError::IllegalTransition {
                from: status.to_string(),
                event: event.to_string(),
            })
        }
    };
    Ok(next)
}

/// The event that lands an order in `target` in one step, if there is one.
pub fn event_into(target: OrderStatus) -> Option<OrderEvent> {
    match target {
        OrderStatus::Pending => None,
        OrderStatus::Initiated => Some(OrderEvent::PaymentInitiated),
        OrderStatus::Processed => Some(OrderEvent::PaymentProcessed),
        OrderStatus::Completed => Some(OrderEvent::PaymentCompleted),
        OrderStatus::Failed => Some(OrderEvent::PaymentFailed),
        OrderStatus::Cancelled => Some(OrderEvent::Cancelled),
        OrderStatus::Voided => Some(OrderEvent::PaymentVoided),
    }
}

/// Events that walk an order from `from` to `target` using only legal transitions.
/// Returns `None` when the target cannot be reached.
pub fn path_to(order_id: &str, from: OrderStatus, target: OrderStatus) -> Option<Vec<OrderEvent>> {
    if from == target {
        return Some(Vec::new());
    }

    let mut path = Vec::new();
    let mut current = from;
    for step in [OrderStatus::Initiated, OrderStatus::Processed, target] {
        if current == target {
            break;
        }
        // Try to jump straight to the target before stepping along the happy path.
        if let Some(event) = event_into(target) {
            if let Ok(t) = transition(order_id, current, event) {
                path.push(event);
                current = t.to;
                continue;
            }
        }
        let event = event_into(step)?;
        match transition(order_id, current, event) {
            Ok(t) if t.changes_status() => {
                path.push(event);
                current = t.to;
            }
            _ => continue,
        }
    }

    (current == target).then_some(path)
}
