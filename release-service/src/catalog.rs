use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use shared::db::DbPool;
use shared::models::*;
use shared::release::DEFAULT_MAX_TICKETS_PER_USER;
use shared::schema::*;
use shared::{ReleaseMethod, SharedClock, TicketError, TicketResult};

#[derive(Debug, Clone, Deserialize)]
pub struct TicketTypeDraft {
    pub name: String,
    pub price: BigDecimal,
    pub quantity_total: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseDraft {
    pub event_id: Uuid,
    pub name: String,
    pub open_at: DateTime<Utc>,
    pub close_at: DateTime<Utc>,
    pub tickets_available: i32,
    pub method: ReleaseMethod,
    pub open_window_duration: i32,
    pub max_tickets_per_user: Option<i32>,
    pub ticket_types: Vec<TicketTypeDraft>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseWithTypes {
    pub release: Release,
    pub ticket_types: Vec<TicketType>,
}

impl ReleaseDraft {
    pub fn validate(&self) -> TicketResult<()> {
        if self.close_at < self.open_at {
            return Err(TicketError::InvalidRequest("close_at precedes open_at".to_string()));
        }
        if self.tickets_available < 0 {
            return Err(TicketError::InvalidRequest("tickets_available must not be negative".to_string()));
        }
        if self.open_window_duration < 0 {
            return Err(TicketError::InvalidRequest("open_window_duration must not be negative".to_string()));
        }
        if matches!(self.max_tickets_per_user, Some(cap) if cap < 1) {
            return Err(TicketError::InvalidRequest("max_tickets_per_user must be at least 1".to_string()));
        }
        if self.ticket_types.is_empty() {
            return Err(TicketError::InvalidRequest("a release needs at least one ticket type".to_string()));
        }
        for tt in &self.ticket_types {
            if tt.price < BigDecimal::zero() || tt.quantity_total < 0 {
                return Err(TicketError::InvalidRequest(format!("ticket type {} is malformed", tt.name)));
            }
        }
        Ok(())
    }
}

pub async fn create_release(
    pool: &DbPool,
    clock: &SharedClock,
    draft: ReleaseDraft,
    default_cap: Option<i32>,
) -> TicketResult<ReleaseWithTypes> {
    draft.validate()?;
    let now = clock.now();
    let release_id = Uuid::new_v4();
    let cap = draft
        .max_tickets_per_user
        .or(default_cap)
        .unwrap_or(DEFAULT_MAX_TICKETS_PER_USER as i32);

    let new_release = NewRelease {
        id: release_id,
        event_id: draft.event_id,
        name: draft.name,
        open_at: draft.open_at,
        close_at: draft.close_at,
        tickets_available: draft.tickets_available,
        method: draft.method.as_str().to_string(),
        open_window_duration: draft.open_window_duration,
        max_tickets_per_user: cap,
        has_allocated: false,
        created_at: now,
        updated_at: now,
    };
    let types: Vec<TicketType> = draft
        .ticket_types
        .into_iter()
        .map(|tt| TicketType {
            id: Uuid::new_v4(),
            release_id,
            name: tt.name,
            price: tt.price,
            quantity_total: tt.quantity_total,
        })
        .collect();

    let mut conn = pool.get().await?;
    let created = conn
        .transaction::<_, TicketError, _>(|conn| {
            Box::pin(async move {
                let release = diesel::insert_into(releases::table)
                    .values(&new_release)
                    .get_result::<Release>(conn)
                    .await?;
                let ticket_types = diesel::insert_into(ticket_types::table)
                    .values(&types)
                    .get_results::<TicketType>(conn)
                    .await?;
                Ok(ReleaseWithTypes { release, ticket_types })
            })
        })
        .await?;

    info!(release_id = %release_id, "release created");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn draft() -> ReleaseDraft {
        let now = Utc::now();
        ReleaseDraft {
            event_id: Uuid::new_v4(),
            name: "Spring ball".to_string(),
            open_at: now,
            close_at: now + Duration::hours(2),
            tickets_available: 100,
            method: ReleaseMethod::FcfsLottery,
            open_window_duration: 1000,
            max_tickets_per_user: None,
            ticket_types: vec![TicketTypeDraft {
                name: "Standard".to_string(),
                price: BigDecimal::from(250),
                quantity_total: 100,
            }],
        }
    }

    #[test]
    fn accepts_well_formed_release() {
        assert!(draft().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_window_and_missing_types() {
        let mut s = draft();
        s.close_at = s.open_at - Duration::seconds(1);
        assert!(matches!(s.validate(), Err(TicketError::InvalidRequest(_))));

        let mut s = draft();
        s.ticket_types.clear();
        assert!(matches!(s.validate(), Err(TicketError::InvalidRequest(_))));
    }

    #[test]
    fn parses_method_from_json() {
        let body = serde_json::json!({
            "event_id": Uuid::nil(),
            "name": "Gala",
            "open_at": "2026-10-01T10:00:00Z",
            "close_at": "2026-10-01T12:00:00Z",
            "tickets_available": 10,
            "method": "FCFS_LOTTERY",
            "open_window_duration": 600,
            "ticket_types": [{"name": "Standard", "price": "120.50", "quantity_total": 10}]
        });
        let parsed: ReleaseDraft = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.method, ReleaseMethod::FcfsLottery);
        assert_eq!(parsed.max_tickets_per_user, None);
    }
}
