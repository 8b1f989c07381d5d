use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{TicketError, TicketResult};

pub const DEFAULT_MAX_TICKETS_PER_USER: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseMethod {
    FcfsLottery,
}

impl ReleaseMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseMethod::FcfsLottery => "FCFS_LOTTERY",
        }
    }
}

impl fmt::Display for ReleaseMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleaseMethod {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FCFS_LOTTERY" => Ok(ReleaseMethod::FcfsLottery),
            other => Err(TicketError::Invariant(format!("unknown release method {}", other))),
        }
    }
}

/// The slice of a release that admission and allocation look at.
#[derive(Debug, Clone)]
pub struct ReleaseWindow {
    pub release_id: Uuid,
    pub open_at: DateTime<Utc>,
    pub close_at: DateTime<Utc>,
    pub method: ReleaseMethod,
    pub open_window_duration: Duration,
    pub max_tickets_per_user: i64,
    pub has_allocated: bool,
}

impl ReleaseWindow {
    /// Last instant at which a request still joins the lottery.
    pub fn window_end(&self) -> DateTime<Utc> {
        self.open_at + self.open_window_duration
    }

    pub fn check_open(&self, now: DateTime<Utc>) -> TicketResult<()> {
        if now < self.open_at {
            return Err(TicketError::NotYetOpen(self.release_id));
        }
        if now > self.close_at {
            return Err(TicketError::Closed(self.release_id));
        }
        Ok(())
    }

    pub fn is_after_window(&self, at: DateTime<Utc>) -> bool {
        at > self.window_end()
    }
}

/// One line of a submitted batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDraft {
    pub ticket_type_id: Uuid,
    pub amount: i32,
}

/// Runs every admission check that does not need the store. `prior_amount` is the
/// sum of the user's live requests on this release.
pub fn check_batch(
    window: &ReleaseWindow,
    now: DateTime<Utc>,
    user_id: Uuid,
    drafts: &[RequestDraft],
    release_ticket_types: &HashSet<Uuid>,
    prior_amount: i64,
) -> TicketResult<()> {
    window.check_open(now)?;
    // Requests arriving after the draw would never be handled.
    if window.has_allocated {
        return Err(TicketError::AlreadyAllocated(window.release_id));
    }

    if drafts.is_empty() {
        return Err(TicketError::InvalidRequest("empty request batch".to_string()));
    }

    for draft in drafts {
        if draft.amount < 1 {
            return Err(TicketError::InvalidRequest(format!(
                "amount must be at least 1, got {}",
                draft.amount
            )));
        }
        if !release_ticket_types.contains(&draft.ticket_type_id) {
            return Err(TicketError::InvalidRequest(format!(
                "ticket type {} does not belong to release {}",
                draft.ticket_type_id, window.release_id
            )));
        }
    }

    let batch_amount: i64 = drafts.iter().map(|d| i64::from(d.amount)).sum();
    let requested = prior_amount + batch_amount;
    if requested > window.max_tickets_per_user {
        return Err(TicketError::OverUserCap {
            user_id,
            requested,
            cap: window.max_tickets_per_user,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(now: DateTime<Utc>) -> ReleaseWindow {
        ReleaseWindow {
            release_id: Uuid::new_v4(),
            open_at: now - Duration::seconds(2000),
            close_at: now + Duration::hours(1),
            method: ReleaseMethod::FcfsLottery,
            open_window_duration: Duration::seconds(1000),
            max_tickets_per_user: DEFAULT_MAX_TICKETS_PER_USER,
            has_allocated: false,
        }
    }

    fn one(ticket_type_id: Uuid) -> Vec<RequestDraft> {
        vec![RequestDraft { ticket_type_id, amount: 1 }]
    }

    #[test]
    fn rejects_outside_open_interval() {
        let now = Utc::now();
        let w = window(now);
        assert!(matches!(w.check_open(w.open_at - Duration::seconds(1)), Err(TicketError::NotYetOpen(_))));
        assert!(matches!(w.check_open(w.close_at + Duration::seconds(1)), Err(TicketError::Closed(_))));
        assert!(w.check_open(w.open_at).is_ok());
        assert!(w.check_open(w.close_at).is_ok());
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let now = Utc::now();
        let w = window(now);
        assert!(!w.is_after_window(w.window_end()));
        assert!(w.is_after_window(w.window_end() + Duration::milliseconds(1)));
    }

    #[test]
    fn eleventh_ticket_is_over_cap() {
        let now = Utc::now();
        let w = window(now);
        let tt = Uuid::new_v4();
        let types: HashSet<Uuid> = [tt].into_iter().collect();
        let user = Uuid::new_v4();

        let mut prior = 0;
        for _ in 0..10 {
            check_batch(&w, now, user, &one(tt), &types, prior).unwrap();
            prior += 1;
        }
        let err = check_batch(&w, now, user, &one(tt), &types, prior).unwrap_err();
        assert!(matches!(err, TicketError::OverUserCap { requested: 11, cap: 10, .. }));
    }

    #[test]
    fn allocated_release_takes_no_more_requests() {
        let now = Utc::now();
        let mut w = window(now);
        w.has_allocated = true;
        let tt = Uuid::new_v4();
        let types: HashSet<Uuid> = [tt].into_iter().collect();

        let err = check_batch(&w, now, Uuid::new_v4(), &one(tt), &types, 0).unwrap_err();
        assert!(matches!(err, TicketError::AlreadyAllocated(id) if id == w.release_id));
    }

    #[test]
    fn rejects_foreign_ticket_type_and_zero_amount() {
        let now = Utc::now();
        let w = window(now);
        let tt = Uuid::new_v4();
        let types: HashSet<Uuid> = [tt].into_iter().collect();
        let user = Uuid::new_v4();

        let foreign = one(Uuid::new_v4());
        assert!(matches!(
            check_batch(&w, now, user, &foreign, &types, 0),
            Err(TicketError::InvalidRequest(_))
        ));

        let zero = vec![RequestDraft { ticket_type_id: tt, amount: 0 }];
        assert!(matches!(
            check_batch(&w, now, user, &zero, &types, 0),
            Err(TicketError::InvalidRequest(_))
        ));
    }

    #[test]
    fn whole_batch_counts_against_cap() {
        let now = Utc::now();
        let w = window(now);
        let tt = Uuid::new_v4();
        let types: HashSet<Uuid> = [tt].into_iter().collect();
        let batch = vec![
            RequestDraft { ticket_type_id: tt, amount: 6 },
            RequestDraft { ticket_type_id: tt, amount: 5 },
        ];
        assert!(matches!(
            check_batch(&w, now, Uuid::new_v4(), &batch, &types, 0),
            Err(TicketError::OverUserCap { .. })
        ));
    }

    #[test]
    fn method_round_trips_through_its_column_value() {
        let parsed: ReleaseMethod = "FCFS_LOTTERY".parse().unwrap();
        assert_eq!(parsed, ReleaseMethod::FcfsLottery);
        assert!("DUTCH_AUCTION".parse::<ReleaseMethod>().is_err());
    }
}
