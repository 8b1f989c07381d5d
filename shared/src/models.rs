use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::allocation::Candidate;
use crate::error::TicketResult;
use crate::order_state::OrderStatus;
use crate::promotion::TicketSlot;
use crate::release::{ReleaseMethod, ReleaseWindow};
use crate::schema::*;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = releases)]
pub struct Release {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub open_at: DateTime<Utc>,
    pub close_at: DateTime<Utc>,
    pub tickets_available: i32,
    pub method: String,
    pub open_window_duration: i32,
    pub max_tickets_per_user: i32,
    pub has_allocated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Release {
    pub fn window(&self) -> TicketResult<ReleaseWindow> {
        Ok(ReleaseWindow {
            release_id: self.id,
            open_at: self.open_at,
            close_at: self.close_at,
            method: self.method.parse::<ReleaseMethod>()?,
            open_window_duration: Duration::seconds(i64::from(self.open_window_duration)),
            max_tickets_per_user: i64::from(self.max_tickets_per_user),
            has_allocated: self.has_allocated,
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = releases)]
pub struct NewRelease {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub open_at: DateTime<Utc>,
    pub close_at: DateTime<Utc>,
    pub tickets_available: i32,
    pub method: String,
    pub open_window_duration: i32,
    pub max_tickets_per_user: i32,
    pub has_allocated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = ticket_types)]
pub struct TicketType {
    pub id: Uuid,
    pub release_id: Uuid,
    pub name: String,
    pub price: BigDecimal,
    pub quantity_total: i32,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = ticket_requests)]
pub struct TicketRequest {
    pub id: Uuid,
    pub release_id: Uuid,
    pub ticket_type_id: Uuid,
    pub user_id: Uuid,
    pub amount: i32,
    pub is_handled: bool,
    pub is_after_window: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<TicketRequest> for Candidate {
    fn from(request: TicketRequest) -> Self {
        Self {
            request_id: request.id,
            user_id: request.user_id,
            ticket_type_id: request.ticket_type_id,
            amount: request.amount,
            created_at: request.created_at,
        }
    }
}

#[derive(Debug, Clone, Insertable, Serialize)]
#[diesel(table_name = ticket_requests)]
pub struct NewTicketRequest {
    pub id: Uuid,
    pub release_id: Uuid,
    pub ticket_type_id: Uuid,
    pub user_id: Uuid,
    pub amount: i32,
    pub is_handled: bool,
    pub is_after_window: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = tickets)]
pub struct Ticket {
    pub id: Uuid,
    pub release_id: Uuid,
    pub request_id: Uuid,
    pub ticket_type_id: Uuid,
    pub user_id: Uuid,
    pub is_reserve: bool,
    pub reserve_number: Option<i32>,
    pub is_paid: bool,
    pub purchasable_at: Option<DateTime<Utc>>,
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<&Ticket> for TicketSlot {
    fn from(ticket: &Ticket) -> Self {
        Self {
            ticket_id: ticket.id,
            request_id: ticket.request_id,
            user_id: ticket.user_id,
            is_reserve: ticket.is_reserve,
            reserve_number: ticket.reserve_number,
            is_paid: ticket.is_paid,
            updated_at: ticket.updated_at,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = tickets)]
pub struct NewTicket {
    pub id: Uuid,
    pub release_id: Uuid,
    pub request_id: Uuid,
    pub ticket_type_id: Uuid,
    pub user_id: Uuid,
    pub is_reserve: bool,
    pub reserve_number: Option<i32>,
    pub is_paid: bool,
    pub purchasable_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = orders)]
pub struct Order {
    pub id: Uuid,
    pub order_id: String,
    pub merchant_id: String,
    pub store_id: String,
    pub user_id: Uuid,
    pub email: String,
    pub payment_page_link: String,
    pub total: BigDecimal,
    pub currency: String,
    pub status: String,
    pub payment_id: Option<String>,
    pub payment_method: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn status(&self) -> TicketResult<OrderStatus> {
        self.status.parse()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub order_id: String,
    pub merchant_id: String,
    pub store_id: String,
    pub user_id: Uuid,
    pub email: String,
    pub payment_page_link: String,
    pub total: BigDecimal,
    pub currency: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = webhook_events)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub event_id: String,
    pub order_id: String,
    pub event_type: String,
    pub retry_attempt: i32,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = merchants)]
pub struct Merchant {
    pub id: Uuid,
    pub network_id: Uuid,
    pub application_id: String,
    pub application_status: String,
    pub web_kyb_url: Option<String>,
    pub merchant_id: Option<String>,
    pub default_store_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = stores)]
pub struct Store {
    pub id: Uuid,
    pub merchant_id: String,
    pub organization_id: Uuid,
    pub store_id: String,
    pub terminal_id: Option<String>,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = organizations)]
pub struct Organization {
    pub id: Uuid,
    pub network_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = outbox_events)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
}
