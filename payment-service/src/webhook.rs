//! Inbound order webhooks from the payment gateway.

use serde::{Deserialize, Serialize};

use shared::{OrderEvent, TicketError, TicketResult};

use crate::orders::IncomingEvent;

pub const CERTIFICATE_HEADER: &str = "X-Webhook-Certificate";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMetadata {
    pub event_id: String,
    pub created: String,
    #[serde(default)]
    pub retry_attempt: i32,
    pub webhook_event_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOrderData {
    pub order_id: String,
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderWebhookData {
    pub event_type: String,
    pub metadata: WebhookMetadata,
    pub data: WebhookOrderData,
}

impl OrderWebhookData {
    /// Parses a raw body. Malformed JSON and unknown event types are both
    /// `InvalidRequest`.
    pub fn parse(body: &[u8]) -> TicketResult<(Self, OrderEvent)> {
        let raw: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| TicketError::InvalidRequest(format!("malformed webhook body: {}", e)))?;
        let webhook: OrderWebhookData = serde_json::from_value(raw)
            .map_err(|e| TicketError::InvalidRequest(format!("malformed webhook body: {}", e)))?;
        let event = webhook.event_type.parse::<OrderEvent>()?;
        Ok((webhook, event))
    }

    pub fn into_incoming(self, event: OrderEvent) -> TicketResult<IncomingEvent> {
        let payload = serde_json::to_value(&self)?;
        Ok(IncomingEvent {
            event_id: self.metadata.event_id,
            order_id: self.data.order_id,
            event,
            retry_attempt: self.metadata.retry_attempt,
            payment_id: self.data.payment_id,
            payment_method: self.data.payment_method,
            payload,
        })
    }
}

/// Compares the presented certificate with the configured one in constant time.
pub fn certificate_matches(presented: Option<&str>, expected: &str) -> bool {
    presented.is_some_and(|presented| constant_time_eq::constant_time_eq(presented.as_bytes(), expected.as_bytes()))
}
