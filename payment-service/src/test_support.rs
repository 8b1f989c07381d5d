//! Fixtures for tests that need PostgreSQL and a stand-in gateway. The
//! database tests read `TEST_DATABASE_URL` and are `#[ignore]`d; run them
//! with `cargo test -- --ignored` against a scratch database.

use axum::extract::State;
use axum::routing::put;
use axum::{Json, Router};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_async::RunQueryDsl;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use uuid::Uuid;

use shared::db::{build_pool, DbPool};
use shared::models::*;
use shared::schema::*;
use shared::{FixedClock, OrderStatus, ReleaseMethod, SharedClock};

use crate::gateway::{GatewayClient, GatewayConfig};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("../release-service/migrations");

static MIGRATE: Once = Once::new();

pub async fn pool() -> DbPool {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must point at a scratch database");
    MIGRATE.call_once(|| {
        let mut conn = PgConnection::establish(&url).expect("connect for migrations");
        conn.run_pending_migrations(MIGRATIONS).expect("run migrations");
    });
    build_pool(&url).await.expect("build pool")
}

pub fn clock_at(instant: DateTime<Utc>) -> SharedClock {
    Arc::new(FixedClock::new(instant))
}

/// A gateway that accepts receipt emails and counts them.
pub async fn receipt_gateway() -> (Arc<GatewayClient>, Arc<AtomicUsize>) {
    let receipts = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/receipts/:order_id/email",
            put(|State(receipts): State<Arc<AtomicUsize>>| async move {
                receipts.fetch_add(1, Ordering::SeqCst);
                Json(json!({ "status": "SUCCESS", "data": null }))
            }),
        )
        .with_state(receipts.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    let client = GatewayClient::new(GatewayConfig {
        api_url: format!("http://{}", addr),
        api_key: "key".to_string(),
        api_secret: "secret".to_string(),
        partner_id: "partner-1".to_string(),
        timeout: std::time::Duration::from_secs(2),
    })
    .expect("gateway client");
    (Arc::new(client), receipts)
}

/// An order in `status` for `count` allocated tickets of a fresh release.
pub async fn order_with_tickets(pool: &DbPool, status: OrderStatus, count: usize) -> (Order, Vec<Ticket>) {
    let mut conn = pool.get().await.expect("connection");
    let now = Utc::now();
    let user_id = Uuid::new_v4();

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
            open_at: now - Duration::days(2),
            close_at: now + Duration::days(1),
            tickets_available: 100,
            method: ReleaseMethod::FcfsLottery.as_str().to_string(),
            open_window_duration: 3600,
            max_tickets_per_user: 10,
            has_allocated: true,
            created_at: now,
            updated_at: now,
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
            quantity_total: 100,
        })
        .execute(&mut conn)
        .await
        .expect("insert ticket type");

    let order = diesel::insert_into(orders::table)
        .values(&NewOrder {
            id: Uuid::new_v4(),
            order_id: format!("ord-{}", Uuid::new_v4().simple()),
            merchant_id: "merchant-1".to_string(),
            store_id: "store-1".to_string(),
            user_id,
            email: "guest@example.com".to_string(),
            payment_page_link: "https://pay.example.com/1".to_string(),
            total: BigDecimal::from(250 * count as i64),
            currency: "SEK".to_string(),
            status: status.as_str().to_string(),
            created_at: now,
            updated_at: now,
        })
        .returning(Order::as_returning())
        .get_result::<Order>(&mut conn)
        .await
        .expect("insert order");

    let request_id = Uuid::new_v4();
    diesel::insert_into(ticket_requests::table)
        .values(&NewTicketRequest {
            id: request_id,
            release_id,
            ticket_type_id,
            user_id,
            amount: count as i32,
            is_handled: true,
            is_after_window: false,
            created_at: now - Duration::days(2),
        })
        .execute(&mut conn)
        .await
        .expect("insert request");

    let rows: Vec<NewTicket> = (0..count)
        .map(|_| NewTicket {
            id: Uuid::new_v4(),
            release_id,
            request_id,
            ticket_type_id,
            user_id,
            is_reserve: false,
            reserve_number: None,
            is_paid: false,
            purchasable_at: Some(now),
            created_at: now,
            updated_at: now,
        })
        .collect();
    diesel::insert_into(tickets::table)
        .values(&rows)
        .execute(&mut conn)
        .await
        .expect("insert tickets");

    let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
    let tickets = diesel::update(tickets::table.filter(tickets::id.eq_any(&ids)))
        .set(tickets::order_id.eq(order.id))
        .returning(Ticket::as_returning())
        .get_results::<Ticket>(&mut conn)
        .await
        .expect("link tickets");

    (order, tickets)
}

pub async fn tickets_of(pool: &DbPool, order_id: Uuid) -> Vec<Ticket> {
    let mut conn = pool.get().await.expect("connection");
    tickets::table
        .filter(tickets::order_id.eq(order_id))
        .select(Ticket::as_select())
        .load::<Ticket>(&mut conn)
        .await
        .expect("load tickets")
}

pub async fn recorded_events(pool: &DbPool, event_id: &str) -> i64 {
    let mut conn = pool.get().await.expect("connection");
    webhook_events::table
        .filter(webhook_events::event_id.eq(event_id))
        .count()
        .get_result::<i64>(&mut conn)
        .await
        .expect("count webhook events")
}

pub async fn outbox_for(pool: &DbPool, aggregate_id: Uuid) -> Vec<(String, Value)> {
    let mut conn = pool.get().await.expect("connection");
    outbox_events::table
        .filter(outbox_events::aggregate_id.eq(aggregate_id))
        .select((outbox_events::event_type, outbox_events::event_data))
        .load::<(String, Value)>(&mut conn)
        .await
        .expect("load outbox")
}
