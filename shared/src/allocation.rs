//! FCFS lottery: everyone inside the opening window is drawn in random order,
//! everyone after it queues by arrival. The first `tickets_available` tickets
//! are allocated, the rest become numbered reserves.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use uuid::Uuid;

use crate::error::{TicketError, TicketResult};

/// A stored, live request as the allocator sees it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub request_id: Uuid,
    pub user_id: Uuid,
    pub ticket_type_id: Uuid,
    pub amount: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTicket {
    pub request_id: Uuid,
    pub user_id: Uuid,
    pub ticket_type_id: Uuid,
    pub is_reserve: bool,
    pub reserve_number: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct AllocationPlan {
    pub tickets: Vec<PlannedTicket>,
}

impl AllocationPlan {
    pub fn allocated_count(&self) -> usize {
        self.tickets.iter().filter(|t| !t.is_reserve).count()
    }

    pub fn reserve_count(&self) -> usize {
        self.tickets.iter().filter(|t| t.is_reserve).count()
    }
}

/// Orders the candidates: shuffled window group first, then the late group by
/// `(created_at, request_id)`.
pub fn lottery_order<R: Rng + ?Sized>(
    window_end: DateTime<Utc>,
    candidates: Vec<Candidate>,
    rng: &mut R,
) -> Vec<Candidate> {
    let (mut window, mut late): (Vec<Candidate>, Vec<Candidate>) =
        candidates.into_iter().partition(|c| c.created_at <= window_end);

    // Storage order is not stable; fix it so a seed always yields the same draw.
    window.sort_by_key(|c| c.request_id);
    window.shuffle(rng);

    late.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.request_id.cmp(&b.request_id))
    });

    window.extend(late);
    window
}

pub fn plan_fcfs_lottery<R: Rng + ?Sized>(
    release_id: Uuid,
    window_end: DateTime<Utc>,
    tickets_available: i32,
    candidates: Vec<Candidate>,
    rng: &mut R,
) -> TicketResult<AllocationPlan> {
    if candidates.is_empty() {
        return Err(TicketError::NoRequests(release_id));
    }
    if tickets_available < 0 {
        return Err(TicketError::Invariant(format!(
            "release {} has negative tickets_available {}",
            release_id, tickets_available
        )));
    }
    if let Some(bad) = candidates.iter().find(|c| c.amount < 1) {
        return Err(TicketError::Invariant(format!(
            "request {} has amount {}",
            bad.request_id, bad.amount
        )));
    }

    let ordered = lottery_order(window_end, candidates, rng);

    let mut plan = AllocationPlan::default();
    let mut allocated: i32 = 0;
    let mut next_reserve: i32 = 1;

    for candidate in ordered {
        for _ in 0..candidate.amount {
            let (is_reserve, reserve_number) = if allocated < tickets_available {
                allocated += 1;
                (false, None)
            } else {
                let number = next_reserve;
                next_reserve += 1;
                (true, Some(number))
            };
            plan.tickets.push(PlannedTicket {
                request_id: candidate.request_id,
                user_id: candidate.user_id,
                ticket_type_id: candidate.ticket_type_id,
                is_reserve,
                reserve_number,
            });
        }
    }

    Ok(plan)
}
