use chrono::Duration;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info};
use uuid::Uuid;

use shared::db::{release_job_lock, retry_on_conflict, try_job_lock, DbPool, PROMOTER_LOCK};
use shared::models::*;
use shared::promotion::{plan_promotion, TicketSlot};
use shared::schema::*;
use shared::{escalate_invariant, DomainEvent, SharedClock, TicketError, TicketResult};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReleasePromotion {
    pub release_id: Uuid,
    pub expired: usize,
    pub promoted: usize,
    pub renumbered: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PromotionRun {
    pub releases: usize,
    pub failed: usize,
    pub expired: usize,
    pub promoted: usize,
}

/// Periodically refills freed seats of allocated releases from their reserve queues.
pub struct ReservePromoter {
    pool: DbPool,
    clock: SharedClock,
    grace: Duration,
    interval: std::time::Duration,
}

impl ReservePromoter {
    pub fn new(pool: DbPool, clock: SharedClock, grace: Duration, interval: std::time::Duration) -> Self {
        Self { pool, clock, grace, interval }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            match self.promote_reserves(&shutdown).await {
                Ok(run) if run.promoted > 0 || run.expired > 0 => {
                    info!(
                        releases = run.releases,
                        promoted = run.promoted,
                        expired = run.expired,
                        failed = run.failed,
                        "reserve promotion run finished"
                    );
                }
                Ok(_) => debug!("reserve promotion run found nothing to do"),
                Err(e) => error!("Error promoting reserves: {}", e),
            }
        }
        info!("reserve promoter stopped");
    }

    /// One pass over every allocated release. A failing release is logged and
    /// skipped so the rest still get their seats refilled.
    pub async fn promote_reserves(&self, shutdown: &watch::Receiver<bool>) -> TicketResult<PromotionRun> {
        let mut lock_conn = self.pool.get().await?;
        if !try_job_lock(&mut lock_conn, PROMOTER_LOCK).await? {
            debug!("another promoter holds the job lock");
            return Ok(PromotionRun::default());
        }

        let result = self.promote_all(shutdown).await;
        release_job_lock(&mut lock_conn, PROMOTER_LOCK).await?;
        result
    }

    async fn promote_all(&self, shutdown: &watch::Receiver<bool>) -> TicketResult<PromotionRun> {
        let release_ids = {
            let mut conn = self.pool.get().await?;
            releases::table
                .filter(releases::has_allocated.eq(true))
                .select(releases::id)
                .load::<Uuid>(&mut conn)
                .await?
        };

        let mut run = PromotionRun::default();
        for release_id in release_ids {
            if *shutdown.borrow() {
                info!("shutdown requested, stopping promotion run");
                break;
            }
            run.releases += 1;
            match self.promote_release(release_id).await {
                Ok(outcome) => {
                    run.expired += outcome.expired;
                    run.promoted += outcome.promoted;
                }
                Err(e) => {
                    run.failed += 1;
                    escalate_invariant(&e);
                    error!(release_id = %release_id, "Error promoting reserves: {}", e);
                }
            }
        }
        Ok(run)
    }

    pub async fn promote_release(&self, release_id: Uuid) -> TicketResult<ReleasePromotion> {
        let outcome = retry_on_conflict(|| self.promote_release_once(release_id)).await?;
        if outcome.promoted > 0 || outcome.expired > 0 {
            info!(
                release_id = %release_id,
                expired = outcome.expired,
                promoted = outcome.promoted,
                renumbered = outcome.renumbered,
                "reserves promoted"
            );
        }
        Ok(outcome)
    }

    async fn promote_release_once(&self, release_id: Uuid) -> TicketResult<ReleasePromotion> {
        let mut conn = self.pool.get().await?;
        let now = self.clock.now();
        let grace = self.grace;

        conn
            .transaction::<_, TicketError, _>(|conn| {
                Box::pin(async move {
                    let release = releases::table
                        .find(release_id)
                        .for_update()
                        .first::<Release>(conn)
                        .await
                        .optional()?
                        .ok_or_else(|| TicketError::NotFound(format!("release {}", release_id)))?;

                    let live: Vec<TicketSlot> = tickets::table
                        .filter(tickets::release_id.eq(release_id))
                        .filter(tickets::deleted_at.is_null())
                        .load::<Ticket>(conn)
                        .await?
                        .iter()
                        .map(TicketSlot::from)
                        .collect();

                    let plan = plan_promotion(release_id, release.tickets_available, &live, now, grace)?;
                    let mut outcome = ReleasePromotion {
                        release_id,
                        ..ReleasePromotion::default()
                    };
                    if plan.is_noop() {
                        return Ok(outcome);
                    }

                    if !plan.expired.is_empty() {
                        // Re-check the deadline in the UPDATE: a payment may have landed after the load.
                        outcome.expired = diesel::update(
                            tickets::table
                                .filter(tickets::id.eq_any(&plan.expired))
                                .filter(tickets::deleted_at.is_null())
                                .filter(tickets::is_reserve.eq(false))
                                .filter(tickets::is_paid.eq(false))
                                .filter(tickets::updated_at.lt(now - grace)),
                        )
                        .set((tickets::deleted_at.eq(Some(now)), tickets::updated_at.eq(now)))
                        .execute(conn)
                        .await?;
                        if outcome.expired != plan.expired.len() {
                            return Err(TicketError::TransactionConflict);
                        }
                    }

                    if !plan.promoted.is_empty() {
                        let ids: Vec<Uuid> = plan.promoted.iter().map(|slot| slot.ticket_id).collect();
                        outcome.promoted = diesel::update(tickets::table.filter(tickets::id.eq_any(&ids)))
                            .set((
                                tickets::is_reserve.eq(false),
                                tickets::reserve_number.eq(None::<i32>),
                                tickets::purchasable_at.eq(Some(now)),
                                tickets::updated_at.eq(now),
                            ))
                            .execute(conn)
                            .await?;

                        let events = plan
                            .promoted
                            .iter()
                            .map(|slot| {
                                DomainEvent::TicketPromoted {
                                    ticket_id: slot.ticket_id,
                                    request_id: slot.request_id,
                                    user_id: slot.user_id,
                                    release_id,
                                    at: now,
                                }
                                .to_outbox()
                            })
                            .collect::<TicketResult<Vec<_>>>()?;
                        diesel::insert_into(outbox_events::table)
                            .values(&events)
                            .execute(conn)
                            .await?;
                    }

                    for (ticket_id, number) in &plan.renumbered {
                        diesel::update(tickets::table.find(*ticket_id))
                            .set(tickets::reserve_number.eq(Some(*number)))
                            .execute(conn)
                            .await?;
                    }
                    outcome.renumbered = plan.renumbered.len();

                    Ok(outcome)
                })
            })
            .await
    }
}
