//! Fixtures for tests that need PostgreSQL. They read `TEST_DATABASE_URL`
//! and are `#[ignore]`d so `cargo test` stays hermetic; run them with
//! `cargo test -- --ignored` against a scratch database.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_async::RunQueryDsl;
use diesel_migrations::MigrationHarness;
use std::sync::{Arc, Once};
use uuid::Uuid;

use shared::db::{build_pool, DbPool};
use shared::models::*;
use shared::schema::*;
use shared::{FixedClock, ReleaseMethod, SharedClock};

use crate::MIGRATIONS;

static MIGRATE: Once = Once::new();

pub fn database_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must point at a scratch database")
}

pub async fn pool() -> DbPool {
    let url = database_url();
    MIGRATE.call_once(|| {
        let mut conn = PgConnection::establish(&url).expect("connect for migrations");
        conn.run_pending_migrations(MIGRATIONS).expect("run migrations");
    });
    build_pool(&url).await.expect("build pool")
}

pub fn clock_at(instant: DateTime<Utc>) -> (Arc<FixedClock>, SharedClock) {
    let fixed = Arc::new(FixedClock::new(instant));
    let shared: SharedClock = fixed.clone();
    (fixed, shared)
}

pub struct Fixture {
    pub release_id: Uuid,
    pub ticket_type_id: Uuid,
    pub open_at: DateTime<Utc>,
}

/// An FCFS-lottery release opening at `open_at` with a one hour lottery window
/// and a day of admission.
pub async fn release(pool: &DbPool, open_at: DateTime<Utc>, tickets_available: i32, cap: i32) -> Fixture {
    let mut conn = pool.get().await.expect("connection");
    let event_id = Uuid::new_v4();
    diesel::insert_into(events::table)
        .values((
            events::id.eq(event_id),
            events::organization_id.eq(Uuid::new_v4()),
            events::name.eq("Spring ball"),
        ))
        .execute(&mut conn)
        .await
        .expect("insert event");

    let release_id = Uuid::new_v4();
    diesel::insert_into(releases::table)
        .values(&NewRelease {
            id: release_id,
            event_id,
            name: "First release".to_string(),
            open_at,
            close_at: open_at + Duration::days(1),
            tickets_available,
            method: ReleaseMethod::FcfsLottery.as_str().to_string(),
            open_window_duration: 3600,
            max_tickets_per_user: cap,
            has_allocated: false,
            created_at: open_at,
            updated_at: open_at,
        })
        .execute(&mut conn)
        .await
        .expect("insert release");

    let ticket_type_id = Uuid::new_v4();
    diesel::insert_into(ticket_types::table)
        .values(&TicketType {
            id: ticket_type_id,
            release_id,
            name: "Standard".to_string(),
            price: BigDecimal::from(250),
            quantity_total: tickets_available,
        })
        .execute(&mut conn)
        .await
        .expect("insert ticket type");

    Fixture {
        release_id,
        ticket_type_id,
        open_at,
    }
}

/// Inserts one request and one ticket for a fresh user, as allocation would.
pub async fn allocated_ticket(pool: &DbPool, fixture: &Fixture, reserve_number: Option<i32>, at: DateTime<Utc>) -> Ticket {
    let mut conn = pool.get().await.expect("connection");
    let user_id = Uuid::new_v4();
    let request_id = Uuid::new_v4();
    diesel::insert_into(ticket_requests::table)
        .values(&NewTicketRequest {
            id: request_id,
            release_id: fixture.release_id,
            ticket_type_id: fixture.ticket_type_id,
            user_id,
            amount: 1,
            is_handled: true,
            is_after_window: false,
            created_at: fixture.open_at,
        })
        .execute(&mut conn)
        .await
        .expect("insert request");

    diesel::insert_into(tickets::table)
        .values(&NewTicket {
            id: Uuid::new_v4(),
            release_id: fixture.release_id,
            request_id,
            ticket_type_id: fixture.ticket_type_id,
            user_id,
            is_reserve: reserve_number.is_some(),
            reserve_number,
            is_paid: false,
            purchasable_at: reserve_number.is_none().then_some(at),
            created_at: at,
            updated_at: at,
        })
        .get_result::<Ticket>(&mut conn)
        .await
        .expect("insert ticket")
}

pub async fn mark_allocated(pool: &DbPool, release_id: Uuid) {
    let mut conn = pool.get().await.expect("connection");
    diesel::update(releases::table.find(release_id))
        .set(releases::has_allocated.eq(true))
        .execute(&mut conn)
        .await
        .expect("mark allocated");
}

pub async fn ticket(pool: &DbPool, ticket_id: Uuid) -> Ticket {
    let mut conn = pool.get().await.expect("connection");
    tickets::table.find(ticket_id).first::<Ticket>(&mut conn).await.expect("load ticket")
}

pub async fn count_tickets(pool: &DbPool, release_id: Uuid) -> i64 {
    let mut conn = pool.get().await.expect("connection");
    tickets::table
        .filter(tickets::release_id.eq(release_id))
        .count()
        .get_result::<i64>(&mut conn)
        .await
        .expect("count tickets")
}
