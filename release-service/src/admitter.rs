use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

use shared::db::{retry_on_conflict, DbPool};
use shared::models::*;
use shared::release::check_batch;
use shared::schema::*;
use shared::{RequestDraft, SharedClock, TicketError, TicketResult};

/// Admits ticket requests into an open release. This is the only writer of
/// `ticket_requests`, so the per-user cap holds as long as every batch passes here.
pub struct RequestAdmitter {
    pool: DbPool,
    clock: SharedClock,
}

impl RequestAdmitter {
    pub fn new(pool: DbPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    pub async fn submit(
        &self,
        release_id: Uuid,
        user_id: Uuid,
        drafts: Vec<RequestDraft>,
    ) -> TicketResult<Vec<TicketRequest>> {
        let stored = retry_on_conflict(|| self.submit_once(release_id, user_id, drafts.clone())).await?;
        info!(
            release_id = %release_id,
            user_id = %user_id,
            requests = stored.len(),
            "ticket requests admitted"
        );
        Ok(stored)
    }

    async fn submit_once(
        &self,
        release_id: Uuid,
        user_id: Uuid,
        drafts: Vec<RequestDraft>,
    ) -> TicketResult<Vec<TicketRequest>> {
        let mut conn = self.pool.get().await?;
        let now = self.clock.now();

        conn.transaction::<_, TicketError, _>(|conn| {
            Box::pin(async move {
                // Shared lock: admissions run side by side but never across an allocation.
                let release = releases::table
                    .find(release_id)
                    .for_share()
                    .first::<Release>(conn)
                    .await
                    .optional()?
                    .ok_or_else(|| TicketError::NotFound(format!("release {}", release_id)))?;
                let window = release.window()?;

                // Two concurrent batches from one user must not both see the old total.
                lock_user_on_release(conn, user_id, release_id).await?;

                let ticket_type_ids: HashSet<Uuid> = ticket_types::table
                    .filter(ticket_types::release_id.eq(release_id))
                    .select(ticket_types::id)
                    .load::<Uuid>(conn)
                    .await?
                    .into_iter()
                    .collect();

                let prior_amount = ticket_requests::table
                    .filter(ticket_requests::release_id.eq(release_id))
                    .filter(ticket_requests::user_id.eq(user_id))
                    .filter(ticket_requests::deleted_at.is_null())
                    .select(diesel::dsl::sum(ticket_requests::amount))
                    .first::<Option<i64>>(conn)
                    .await?
                    .unwrap_or(0);

                check_batch(&window, now, user_id, &drafts, &ticket_type_ids, prior_amount)?;

                let is_after_window = window.is_after_window(now);
                let rows: Vec<NewTicketRequest> = drafts
                    .iter()
                    .map(|draft| NewTicketRequest {
                        id: Uuid::new_v4(),
                        release_id,
                        ticket_type_id: draft.ticket_type_id,
                        user_id,
                        amount: draft.amount,
                        is_handled: false,
                        is_after_window,
                        created_at: now,
                    })
                    .collect();

                let stored = diesel::insert_into(ticket_requests::table)
                    .values(&rows)
                    .get_results::<TicketRequest>(conn)
                    .await?;

                Ok(stored)
            })
        })
        .await
    }

    /// Soft-deletes a request and every ticket it owns. Freed allocated seats are
    /// picked up by the next promotion run.
    pub async fn withdraw(&self, request_id: Uuid, user_id: Uuid) -> TicketResult<usize> {
        let mut conn = self.pool.get().await?;
        let now = self.clock.now();

        let freed = conn
            .transaction::<_, TicketError, _>(|conn| {
                Box::pin(async move {
                    let request = ticket_requests::table
                        .filter(ticket_requests::id.eq(request_id))
                        .filter(ticket_requests::user_id.eq(user_id))
                        .filter(ticket_requests::deleted_at.is_null())
                        .first::<TicketRequest>(conn)
                        .await
                        .optional()?
                        .ok_or_else(|| TicketError::NotFound(format!("request {}", request_id)))?;

                    // Promotion reads the ticket set under this lock.
                    releases::table
                        .find(request.release_id)
                        .select(releases::id)
                        .for_update()
                        .first::<Uuid>(conn)
                        .await?;

                    diesel::update(ticket_requests::table.find(request.id))
                        .set(ticket_requests::deleted_at.eq(Some(now)))
                        .execute(conn)
                        .await?;

                    let freed = diesel::update(
                        tickets::table
                            .filter(tickets::request_id.eq(request.id))
                            .filter(tickets::deleted_at.is_null()),
                    )
                    .set((tickets::deleted_at.eq(Some(now)), tickets::updated_at.eq(now)))
                    .execute(conn)
                    .await?;

                    Ok(freed)
                })
            })
            .await?;

        info!(request_id = %request_id, tickets = freed, "ticket request withdrawn");
        Ok(freed)
    }
}

/// Folds the two ids into one advisory lock key.
pub fn user_release_lock_key(user_id: Uuid, release_id: Uuid) -> i64 {
    let mixed = user_id.as_u128() ^ release_id.as_u128().rotate_left(64);
    (mixed as u64 ^ (mixed >> 64) as u64) as i64
}

async fn lock_user_on_release(conn: &mut AsyncPgConnection, user_id: Uuid, release_id: Uuid) -> TicketResult<()> {
    diesel::sql_query("SELECT pg_advisory_xact_lock($1)")
        .bind::<BigInt, _>(user_release_lock_key(user_id, release_id))
        .execute(conn)
        .await?;
    Ok(())
}
