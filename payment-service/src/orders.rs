use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use shared::db::{retry_on_conflict, DbPool};
use shared::models::*;
use shared::order_state::{transition, Transition};
use shared::schema::*;
use shared::{DomainEvent, OrderEvent, OrderStatus, SharedClock, TicketError, TicketResult};

use crate::gateway::{CreateOrderRequest, GatewayClient, OrderLine, TaxLine, UnitPrice, VoidOutcome};

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub email: String,
    pub ticket_ids: Vec<Uuid>,
}

/// A state-machine input, from a webhook delivery or the reconciler.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub event_id: String,
    pub order_id: String,
    pub event: OrderEvent,
    pub retry_attempt: i32,
    pub payment_id: Option<String>,
    pub payment_method: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied { from: OrderStatus, to: OrderStatus },
    Recorded,
    Duplicate,
}

/// How one delivery lands on an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The event id is already recorded; nothing changes.
    Duplicate,
    Apply(Transition),
}

impl Delivery {
    pub fn sends_receipt(&self) -> bool {
        matches!(self, Delivery::Apply(step) if step.changes_status() && step.sends_receipt)
    }
}

/// Dedupe comes first so a redelivery after the order went terminal is still absorbed.
pub fn classify_delivery(
    order_id: &str,
    status: OrderStatus,
    already_recorded: bool,
    event: OrderEvent,
) -> TicketResult<Delivery> {
    if already_recorded {
        return Ok(Delivery::Duplicate);
    }
    transition(order_id, status, event).map(Delivery::Apply)
}

pub struct PaymentOrders {
    pool: DbPool,
    gateway: Arc<GatewayClient>,
    clock: SharedClock,
    currency: String,
}

/// Converts a major-unit price to the gateway's integer minor units.
pub fn minor_units(price: &BigDecimal) -> TicketResult<i64> {
    (price * BigDecimal::from(100))
        .round(0)
        .to_i64()
        .ok_or_else(|| TicketError::InvalidRequest(format!("price {} out of range", price)))
}

/// One line per ticket, no tax.
pub fn order_lines(rows: &[(Ticket, TicketType)]) -> TicketResult<Vec<OrderLine>> {
    rows.iter()
        .map(|(_, ticket_type)| {
            let amount = minor_units(&ticket_type.price)?;
            Ok(OrderLine {
                name: ticket_type.name.clone(),
                quantity: 1,
                quantity_unit: "pcs".to_string(),
                unit_price: UnitPrice { regular: amount },
                total: amount,
                tax_lines: vec![TaxLine { tax_rate_percent: 0, amount: 0 }],
            })
        })
        .collect()
}

/// Checks the loaded rows cover every requested ticket and that each one can
/// be bought by `user_id`. Returns the release the tickets belong to.
pub fn validate_selection(user_id: Uuid, requested: &[Uuid], rows: &[(Ticket, TicketType)]) -> TicketResult<Uuid> {
    let wanted: HashSet<Uuid> = requested.iter().copied().collect();
    if wanted.is_empty() {
        return Err(TicketError::InvalidRequest("no tickets selected".to_string()));
    }

    let found: HashSet<Uuid> = rows
        .iter()
        .filter(|(t, _)| t.user_id == user_id && t.deleted_at.is_none())
        .map(|(t, _)| t.id)
        .collect();
    if let Some(missing) = wanted.iter().find(|id| !found.contains(id)) {
        return Err(TicketError::NotFound(format!("ticket {}", missing)));
    }

    let mut release_id = None;
    for (ticket, _) in rows.iter().filter(|(t, _)| wanted.contains(&t.id)) {
        if ticket.is_reserve {
            return Err(TicketError::InvalidRequest(format!("ticket {} is a reserve", ticket.id)));
        }
        if ticket.is_paid {
            return Err(TicketError::InvalidRequest(format!("ticket {} is already paid", ticket.id)));
        }
        match release_id {
            None => release_id = Some(ticket.release_id),
            Some(id) if id != ticket.release_id => {
                return Err(TicketError::InvalidRequest("tickets span several releases".to_string()))
            }
            Some(_) => {}
        }
    }
    release_id.ok_or_else(|| TicketError::InvalidRequest("no tickets selected".to_string()))
}

impl PaymentOrders {
    pub fn new(pool: DbPool, gateway: Arc<GatewayClient>, clock: SharedClock, currency: String) -> Self {
        Self { pool, gateway, clock, currency }
    }

    pub async fn checkout(&self, request: CheckoutRequest) -> TicketResult<Order> {
        let mut conn = self.pool.get().await?;

        let rows = tickets::table
            .inner_join(ticket_types::table)
            .filter(tickets::id.eq_any(&request.ticket_ids))
            .select((Ticket::as_select(), TicketType::as_select()))
            .load::<(Ticket, TicketType)>(&mut conn)
            .await?;
        let release_id = validate_selection(request.user_id, &request.ticket_ids, &rows)?;

        let organization_id = releases::table
            .inner_join(events::table)
            .filter(releases::id.eq(release_id))
            .select(events::organization_id)
            .first::<Uuid>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| TicketError::NotFound(format!("release {}", release_id)))?;

        let store = stores::table
            .filter(stores::organization_id.eq(organization_id))
            .filter(stores::terminal_id.is_not_null())
            .order(stores::created_at.asc())
            .select(Store::as_select())
            .first::<Store>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| TicketError::NotFound(format!("payment store for organization {}", organization_id)))?;
        let terminal_id = store
            .terminal_id
            .clone()
            .ok_or_else(|| TicketError::Invariant(format!("store {} lost its terminal", store.id)))?;

        let lines = order_lines(&rows)?;
        let total: BigDecimal = rows.iter().map(|(_, tt)| tt.price.clone()).sum();
        let created = self
            .gateway
            .create_order(&store.merchant_id, &store.store_id, &CreateOrderRequest::purchase(terminal_id, lines))
            .await?;

        let now = self.clock.now();
        let new_order = NewOrder {
            id: Uuid::new_v4(),
            order_id: created.order_id,
            merchant_id: store.merchant_id,
            store_id: store.store_id,
            user_id: request.user_id,
            email: request.email,
            payment_page_link: created.payment_page_link,
            total,
            currency: self.currency.clone(),
            status: OrderStatus::Pending.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        let ticket_ids = request.ticket_ids;

        let order = conn
            .transaction::<_, TicketError, _>(|conn| {
                Box::pin(async move {
                    // Same lock the promoter takes before expiring tickets.
                    releases::table
                        .find(release_id)
                        .select(releases::id)
                        .for_update()
                        .first::<Uuid>(conn)
                        .await?;

                    let order = diesel::insert_into(orders::table)
                        .values(&new_order)
                        .get_result::<Order>(conn)
                        .await?;

                    // Payment deadline keeps running from allocation, so updated_at stays.
                    let linked = diesel::update(
                        tickets::table
                            .filter(tickets::id.eq_any(&ticket_ids))
                            .filter(tickets::deleted_at.is_null())
                            .filter(tickets::is_paid.eq(false)),
                    )
                    .set(tickets::order_id.eq(order.id))
                    .execute(conn)
                    .await?;

                    let expected = ticket_ids.iter().collect::<HashSet<_>>().len();
                    if linked != expected {
                        return Err(TicketError::InvalidRequest(
                            "tickets changed while the order was being created".to_string(),
                        ));
                    }
                    Ok(order)
                })
            })
            .await?;

        info!(order_id = %order.order_id, user_id = %order.user_id, "order created");
        Ok(order)
    }

    /// Applies one event under the order row lock. Duplicate event ids are
    /// absorbed; rejected events roll back and are not recorded.
    pub async fn apply_event(&self, incoming: IncomingEvent) -> TicketResult<EventOutcome> {
        let (outcome, receipt) = retry_on_conflict(|| self.apply_event_once(incoming.clone())).await?;

        if let Some(order) = receipt {
            if let Err(e) = self
                .gateway
                .email_receipt(&order.merchant_id, &order.order_id, &order.email)
                .await
            {
                error!(order_id = %order.order_id, "receipt email failed: {}", e);
            }
        }
        Ok(outcome)
    }

    async fn apply_event_once(&self, incoming: IncomingEvent) -> TicketResult<(EventOutcome, Option<Order>)> {
        let now = self.clock.now();
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, TicketError, _>(|conn| {
            Box::pin(async move {
                let order = orders::table
                    .filter(orders::order_id.eq(&incoming.order_id))
                    .select(Order::as_select())
                    .for_update()
                    .first::<Order>(conn)
                    .await
                    .optional()?
                    .ok_or_else(|| TicketError::UnknownOrder(incoming.order_id.clone()))?;

                let seen = webhook_events::table
                    .filter(webhook_events::event_id.eq(&incoming.event_id))
                    .count()
                    .get_result::<i64>(conn)
                    .await?;

                let delivery = classify_delivery(&order.order_id, order.status()?, seen > 0, incoming.event)?;
                let step = match delivery {
                    Delivery::Duplicate => {
                        info!(event_id = %incoming.event_id, "duplicate webhook event absorbed");
                        return Ok((EventOutcome::Duplicate, None));
                    }
                    Delivery::Apply(step) => step,
                };
                let updated = apply_transition(conn, &order, &step, &incoming, now).await?;

                diesel::insert_into(webhook_events::table)
                    .values(&WebhookEvent {
                        id: Uuid::new_v4(),
                        event_id: incoming.event_id.clone(),
                        order_id: incoming.order_id.clone(),
                        event_type: incoming.event.as_str().to_string(),
                        retry_attempt: incoming.retry_attempt,
                        payload: incoming.payload.clone(),
                        received_at: now,
                    })
                    .on_conflict(webhook_events::event_id)
                    .do_nothing()
                    .execute(conn)
                    .await?;

                if !step.changes_status() {
                    return Ok((EventOutcome::Recorded, None));
                }
                info!(
                    order_id = %order.order_id,
                    from = %step.from,
                    to = %step.to,
                    event = %incoming.event,
                    "order transitioned"
                );
                let receipt = delivery.sends_receipt().then_some(updated);
                Ok((EventOutcome::Applied { from: step.from, to: step.to }, receipt))
            })
        })
        .await
    }

    /// Asks the gateway to void the order's payment. The status change itself
    /// arrives later as an `order.paymentvoided` event.
    pub async fn void(&self, id: Uuid) -> TicketResult<VoidOutcome> {
        let mut conn = self.pool.get().await?;
        let order = orders::table
            .find(id)
            .select(Order::as_select())
            .first::<Order>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| TicketError::NotFound(format!("order {}", id)))?;

        let status = order.status()?;
        if status.is_terminal() {
            return Err(TicketError::NotUpdatable {
                order_id: order.order_id,
                status: status.to_string(),
            });
        }
        let payment_id = order
            .payment_id
            .as_deref()
            .ok_or_else(|| TicketError::InvalidRequest(format!("order {} has no payment to void", order.order_id)))?;

        let outcome = self.gateway.void_payment(&order.merchant_id, payment_id).await?;
        info!(order_id = %order.order_id, ?outcome, "void requested");
        Ok(outcome)
    }
}

async fn apply_transition(
    conn: &mut AsyncPgConnection,
    order: &Order,
    step: &Transition,
    incoming: &IncomingEvent,
    now: chrono::DateTime<chrono::Utc>,
) -> TicketResult<Order> {
    if !step.changes_status() {
        return Ok(order.clone());
    }

    let (payment_id, payment_method) = if step.records_payment {
        (
            incoming.payment_id.clone().or_else(|| order.payment_id.clone()),
            incoming.payment_method.clone().or_else(|| order.payment_method.clone()),
        )
    } else {
        (order.payment_id.clone(), order.payment_method.clone())
    };

    if step.frees_tickets || step.marks_paid {
        lock_releases_of(conn, order.id).await?;
    }

    let updated = diesel::update(orders::table.find(order.id))
        .set((
            orders::status.eq(step.to.as_str()),
            orders::payment_id.eq(payment_id),
            orders::payment_method.eq(payment_method),
            orders::updated_at.eq(now),
        ))
        .returning(Order::as_returning())
        .get_result::<Order>(conn)
        .await?;

    let live_tickets = || {
        tickets::table
            .filter(tickets::order_id.eq(order.id))
            .filter(tickets::deleted_at.is_null())
    };

    if step.frees_tickets {
        let freed = diesel::update(live_tickets())
            .set((tickets::deleted_at.eq(now), tickets::updated_at.eq(now)))
            .execute(conn)
            .await?;
        info!(order_id = %order.order_id, freed, "tickets released by order");
    }

    if step.marks_paid {
        let paid = diesel::update(live_tickets())
            .set((tickets::is_paid.eq(true), tickets::updated_at.eq(now)))
            .execute(conn)
            .await?;
        let linked = tickets::table
            .filter(tickets::order_id.eq(order.id))
            .count()
            .get_result::<i64>(conn)
            .await?;
        let linked = usize::try_from(linked).unwrap_or_default();
        if paid < linked {
            error!(
                alert = true,
                order_id = %order.order_id,
                linked,
                paid,
                "payment completed for tickets that were already freed"
            );
            let event = DomainEvent::PaidTicketsMissing {
                order_id: order.id,
                gateway_order_id: order.order_id.clone(),
                user_id: order.user_id,
                payment_id: updated.payment_id.clone(),
                linked,
                paid,
                at: now,
            };
            diesel::insert_into(outbox_events::table)
                .values(&event.to_outbox()?)
                .execute(conn)
                .await?;
        }
    }

    Ok(updated)
}

/// Locks the releases an order's tickets belong to, in id order, so ticket
/// changes here never interleave with a promotion run.
async fn lock_releases_of(conn: &mut AsyncPgConnection, order_id: Uuid) -> TicketResult<()> {
    let release_ids = tickets::table
        .filter(tickets::order_id.eq(order_id))
        .select(tickets::release_id)
        .distinct()
        .load::<Uuid>(conn)
        .await?;
    releases::table
        .filter(releases::id.eq_any(&release_ids))
        .select(releases::id)
        .order(releases::id.asc())
        .for_update()
        .load::<Uuid>(conn)
        .await?;
    Ok(())
}
