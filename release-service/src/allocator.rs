use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use shared::allocation::{plan_fcfs_lottery, Candidate};
use shared::db::{retry_on_conflict, DbPool};
use shared::models::*;
use shared::schema::*;
use shared::{lottery_rng, DomainEvent, ReleaseMethod, SharedClock, TicketError, TicketResult};

/// Rows per multi-row insert; keeps bind parameters well under the protocol limit.
const INSERT_CHUNK: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct AllocationSummary {
    pub release_id: Uuid,
    pub seed: u64,
    pub allocated: usize,
    pub reserves: usize,
}

pub struct Allocator {
    pool: DbPool,
    clock: SharedClock,
}

impl Allocator {
    pub fn new(pool: DbPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    /// Turns every live request of the release into allocated or reserve tickets.
    /// All-or-nothing: on failure `has_allocated` stays false and no ticket exists.
    pub async fn allocate(&self, release_id: Uuid, seed: Option<u64>) -> TicketResult<AllocationSummary> {
        // Retries must redraw the same lottery.
        let seed = seed.unwrap_or_else(rand::random);
        let summary = retry_on_conflict(|| self.allocate_once(release_id, seed)).await?;
        info!(
            release_id = %release_id,
            seed,
            allocated = summary.allocated,
            reserves = summary.reserves,
            "release allocated"
        );
        Ok(summary)
    }

    async fn allocate_once(&self, release_id: Uuid, seed: u64) -> TicketResult<AllocationSummary> {
        let mut conn = self.pool.get().await?;
        let now = self.clock.now();

        conn.transaction::<_, TicketError, _>(|conn| {
            Box::pin(async move {
                let release = releases::table
                    .find(release_id)
                    .for_update()
                    .first::<Release>(conn)
                    .await
                    .optional()?
                    .ok_or_else(|| TicketError::NotFound(format!("release {}", release_id)))?;

                if release.has_allocated {
                    return Err(TicketError::AlreadyAllocated(release_id));
                }
                let window = release.window()?;

                let candidates: Vec<Candidate> = ticket_requests::table
                    .filter(ticket_requests::release_id.eq(release_id))
                    .filter(ticket_requests::deleted_at.is_null())
                    .load::<TicketRequest>(conn)
                    .await?
                    .into_iter()
                    .map(Candidate::from)
                    .collect();

                let plan = match window.method {
                    ReleaseMethod::FcfsLottery => plan_fcfs_lottery(
                        release_id,
                        window.window_end(),
                        release.tickets_available,
                        candidates,
                        &mut lottery_rng(seed),
                    )?,
                };

                let rows: Vec<NewTicket> = plan
                    .tickets
                    .iter()
                    .map(|planned| NewTicket {
                        id: Uuid::new_v4(),
                        release_id,
                        request_id: planned.request_id,
                        ticket_type_id: planned.ticket_type_id,
                        user_id: planned.user_id,
                        is_reserve: planned.is_reserve,
                        reserve_number: planned.reserve_number,
                        is_paid: false,
                        purchasable_at: (!planned.is_reserve).then_some(now),
                        created_at: now,
                        updated_at: now,
                    })
                    .collect();

                for chunk in rows.chunks(INSERT_CHUNK) {
                    diesel::insert_into(tickets::table)
                        .values(chunk)
                        .execute(conn)
                        .await?;
                }

                diesel::update(
                    ticket_requests::table
                        .filter(ticket_requests::release_id.eq(release_id))
                        .filter(ticket_requests::deleted_at.is_null()),
                )
                .set(ticket_requests::is_handled.eq(true))
                .execute(conn)
                .await?;

                diesel::update(releases::table.find(release_id))
                    .set((releases::has_allocated.eq(true), releases::updated_at.eq(now)))
                    .execute(conn)
                    .await?;

                let summary = AllocationSummary {
                    release_id,
                    seed,
                    allocated: plan.allocated_count(),
                    reserves: plan.reserve_count(),
                };

                let event = DomainEvent::ReleaseAllocated {
                    release_id,
                    allocated: summary.allocated,
                    reserves: summary.reserves,
                    at: now,
                };
                diesel::insert_into(outbox_events::table)
                    .values(&event.to_outbox()?)
                    .execute(conn)
                    .await?;

                Ok(summary)
            })
        })
        .await
    }
}
