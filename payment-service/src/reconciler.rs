use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};

use shared::db::{release_job_lock, try_job_lock, DbPool, RECONCILER_LOCK};
use shared::models::*;
use shared::order_state::{path_to, transition};
use shared::schema::*;
use shared::{escalate_invariant, OrderEvent, OrderStatus, TicketError, TicketResult};

use crate::gateway::GatewayClient;
use crate::orders::{EventOutcome, IncomingEvent, PaymentOrders};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileRun {
    pub orders: usize,
    pub healed: usize,
    pub failed: usize,
}

/// Synthetic events that walk an order from `from` to `target`, each keyed
/// `reconcile:{order}:{status after the step}` so a rerun is absorbed.
pub fn healing_events(order_id: &str, from: OrderStatus, target: OrderStatus) -> Option<Vec<(String, OrderEvent)>> {
    let path = path_to(order_id, from, target)?;
    let mut current = from;
    let mut steps = Vec::with_capacity(path.len());
    for event in path {
        current = transition(order_id, current, event).ok()?.to;
        steps.push((format!("reconcile:{}:{}", order_id, current), event));
    }
    Some(steps)
}

/// Pulls gateway status for every open order to heal missed webhooks.
pub struct StatusReconciler {
    pool: DbPool,
    gateway: Arc<GatewayClient>,
    orders: Arc<PaymentOrders>,
    interval: std::time::Duration,
}

impl StatusReconciler {
    pub fn new(
        pool: DbPool,
        gateway: Arc<GatewayClient>,
        orders: Arc<PaymentOrders>,
        interval: std::time::Duration,
    ) -> Self {
        Self { pool, gateway, orders, interval }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            match self.reconcile(&shutdown).await {
                Ok(run) if run.healed > 0 || run.failed > 0 => {
                    info!(orders = run.orders, healed = run.healed, failed = run.failed, "reconcile run finished");
                }
                Ok(_) => debug!("reconcile run found nothing to heal"),
                Err(e) => error!("Error reconciling orders: {}", e),
            }
        }
        info!("status reconciler stopped");
    }

    pub async fn reconcile(&self, shutdown: &watch::Receiver<bool>) -> TicketResult<ReconcileRun> {
        let mut lock_conn = self.pool.get().await?;
        if !try_job_lock(&mut lock_conn, RECONCILER_LOCK).await? {
            debug!("another reconciler holds the job lock");
            return Ok(ReconcileRun::default());
        }

        let result = self.reconcile_all(shutdown).await;
        release_job_lock(&mut lock_conn, RECONCILER_LOCK).await?;
        result
    }

    async fn reconcile_all(&self, shutdown: &watch::Receiver<bool>) -> TicketResult<ReconcileRun> {
        let open: Vec<&str> = OrderStatus::NON_TERMINAL.iter().map(|s| s.as_str()).collect();
        let pending = {
            let mut conn = self.pool.get().await?;
            orders::table
                .filter(orders::status.eq_any(open))
                .order(orders::created_at.asc())
                .select(Order::as_select())
                .load::<Order>(&mut conn)
                .await?
        };

        let mut run = ReconcileRun::default();
        for order in pending {
            if *shutdown.borrow() {
                info!("shutdown requested, stopping reconcile run");
                break;
            }
            run.orders += 1;
            match self.reconcile_order(&order).await {
                Ok(applied) => run.healed += usize::from(applied > 0),
                Err(e) => {
                    run.failed += 1;
                    escalate_invariant(&e);
                    error!(order_id = %order.order_id, "Error reconciling order: {}", e);
                }
            }
        }
        Ok(run)
    }

    /// Returns how many steps were applied.
    pub async fn reconcile_order(&self, order: &Order) -> TicketResult<usize> {
        let local = order.status()?;
        let remote = self
            .gateway
            .order_status(&order.merchant_id, &order.store_id, &order.order_id)
            .await?;
        if remote.order_id != order.order_id {
            return Err(TicketError::GatewayFailure(format!(
                "status for order {} came back for {}",
                order.order_id, remote.order_id
            )));
        }
        let remote_status = match remote.status.parse::<OrderStatus>() {
            Ok(status) => status,
            Err(_) => {
                warn!(order_id = %order.order_id, status = %remote.status, "gateway reported an unknown status");
                return Ok(0);
            }
        };
        if remote_status == local {
            return Ok(0);
        }

        let steps = healing_events(&order.order_id, local, remote_status).ok_or_else(|| TicketError::IllegalTransition {
            from: local.to_string(),
            event: format!("reconcile to {}", remote_status),
        })?;

        let mut applied = 0;
        for (event_id, event) in steps {
            let incoming = IncomingEvent {
                event_id,
                order_id: order.order_id.clone(),
                event,
                retry_attempt: 0,
                payment_id: remote.payment_id.clone(),
                payment_method: None,
                payload: serde_json::json!({
                    "source": "reconciler",
                    "orderId": order.order_id,
                    "status": remote.status,
                }),
            };
            match self.orders.apply_event(incoming).await? {
                EventOutcome::Applied { .. } => applied += 1,
                EventOutcome::Recorded | EventOutcome::Duplicate => {}
            }
        }
        if applied > 0 {
            info!(order_id = %order.order_id, from = %local, to = %remote_status, "order healed from gateway status");
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_happy_path_to_completed() {
        let steps = healing_events("ord-1", OrderStatus::Pending, OrderStatus::Completed).unwrap();
        let keys: Vec<&str> = steps.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["reconcile:ord-1:INITIATED", "reconcile:ord-1:COMPLETED"]);
        assert_eq!(steps[0].1, OrderEvent::PaymentInitiated);
        assert_eq!(steps[1].1, OrderEvent::PaymentCompleted);
    }

    #[test]
    fn cancellation_is_one_step() {
        let steps = healing_events("ord-2", OrderStatus::Initiated, OrderStatus::Cancelled).unwrap();
        assert_eq!(steps, vec![("reconcile:ord-2:CANCELLED".to_string(), OrderEvent::Cancelled)]);
    }

    #[test]
    fn terminal_orders_cannot_be_walked() {
        assert!(healing_events("ord-3", OrderStatus::Completed, OrderStatus::Cancelled).is_none());
    }

    #[test]
    fn rerun_produces_identical_keys() {
        let a = healing_events("ord-4", OrderStatus::Pending, OrderStatus::Processed).unwrap();
        let b = healing_events("ord-4", OrderStatus::Pending, OrderStatus::Processed).unwrap();
        assert_eq!(a, b);
    }
}
