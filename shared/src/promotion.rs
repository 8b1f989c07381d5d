use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{TicketError, TicketResult};

pub const DEFAULT_PAYMENT_GRACE_HOURS: i64 = 24;

/// A live (not soft-deleted) ticket of one release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketSlot {
    pub ticket_id: Uuid,
    pub request_id: Uuid,
    pub user_id: Uuid,
    pub is_reserve: bool,
    pub reserve_number: Option<i32>,
    pub is_paid: bool,
    pub updated_at: DateTime<Utc>,
}

impl TicketSlot {
    pub fn is_past_deadline(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        !self.is_reserve && !self.is_paid && self.updated_at < now - grace
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionPlan {
    /// Allocated tickets whose payment window lapsed; soft-deleted first.
    pub expired: Vec<Uuid>,
    /// Reserves moving into allocated slots, in queue order.
    pub promoted: Vec<TicketSlot>,
    /// Remaining reserves whose number changes to keep the queue dense.
    pub renumbered: Vec<(Uuid, i32)>,
}

impl PromotionPlan {
    pub fn is_noop(&self) -> bool {
        self.expired.is_empty() && self.promoted.is_empty() && self.renumbered.is_empty()
    }
}

/// Computes one promotion pass for a release from its live tickets.
pub fn plan_promotion(
    release_id: Uuid,
    tickets_available: i32,
    live: &[TicketSlot],
    now: DateTime<Utc>,
    grace: Duration,
) -> TicketResult<PromotionPlan> {
    let mut plan = PromotionPlan::default();

    let mut live_allocated: i64 = 0;
    let mut reserves: Vec<&TicketSlot> = Vec::new();
    for slot in live {
        if slot.is_reserve {
            if slot.reserve_number.is_none() {
                return Err(TicketError::Invariant(format!(
                    "reserve ticket {} in release {} has no reserve number",
                    slot.ticket_id, release_id
                )));
            }
            reserves.push(slot);
        } else if slot.is_past_deadline(now, grace) {
            plan.expired.push(slot.ticket_id);
        } else {
            live_allocated += 1;
        }
    }

    let capacity = i64::from(tickets_available);
    if live_allocated > capacity {
        return Err(TicketError::Invariant(format!(
            "release {} has {} allocated tickets for {} seats",
            release_id, live_allocated, tickets_available
        )));
    }

    reserves.sort_by(|a, b| {
        a.reserve_number
            .cmp(&b.reserve_number)
            .then_with(|| a.ticket_id.cmp(&b.ticket_id))
    });

    let freed = usize::try_from(capacity - live_allocated).unwrap_or(0);
    let take = freed.min(reserves.len());
    plan.promoted = reserves[..take].iter().map(|slot| (*slot).clone()).collect();

    for (index, slot) in reserves[take..].iter().enumerate() {
        let dense = index as i32 + 1;
        if slot.reserve_number != Some(dense) {
            plan.renumbered.push((slot.ticket_id, dense));
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn slot(is_reserve: bool, reserve_number: Option<i32>, updated_at: DateTime<Utc>) -> TicketSlot {
        TicketSlot {
            ticket_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            is_reserve,
            reserve_number,
            is_paid: false,
            updated_at,
        }
    }

    /// 100 allocated tickets, reserves numbered 1..=20.
    fn oversubscribed(now: DateTime<Utc>) -> Vec<TicketSlot> {
        let mut tickets: Vec<TicketSlot> = (0..100).map(|_| slot(false, None, now)).collect();
        tickets.extend((1..=20).map(|n| slot(true, Some(n), now)));
        tickets
    }

    /// Applies a plan the way the promoter persists it.
    fn apply(live: Vec<TicketSlot>, plan: &PromotionPlan, now: DateTime<Utc>) -> Vec<TicketSlot> {
        live.into_iter()
            .filter(|t| !plan.expired.contains(&t.ticket_id))
            .map(|mut t| {
                if plan.promoted.iter().any(|p| p.ticket_id == t.ticket_id) {
                    t.is_reserve = false;
                    t.reserve_number = None;
                    t.updated_at = now;
                } else if let Some((_, n)) = plan.renumbered.iter().find(|(id, _)| *id == t.ticket_id) {
                    t.reserve_number = Some(*n);
                }
                t
            })
            .collect()
    }

    fn grace() -> Duration {
        Duration::hours(DEFAULT_PAYMENT_GRACE_HOURS)
    }

    #[test]
    fn deleted_allocations_are_refilled_from_reserves() {
        let now = Utc::now();
        let mut live = oversubscribed(now);
        live.drain(0..20);

        let plan = plan_promotion(Uuid::new_v4(), 100, &live, now, grace()).unwrap();
        assert_eq!(plan.promoted.len(), 20);
        assert!(plan.expired.is_empty());
        assert!(plan.renumbered.is_empty());

        let after = apply(live, &plan, now);
        assert_eq!(after.iter().filter(|t| !t.is_reserve).count(), 100);
        assert_eq!(after.iter().filter(|t| t.is_reserve).count(), 0);
    }

    #[test]
    fn overdue_payments_are_reclaimed() {
        let now = Utc::now();
        let mut live = oversubscribed(now);
        for t in live.iter_mut().take(20) {
            t.updated_at = now - Duration::hours(25);
        }
        let stale: Vec<Uuid> = live.iter().take(20).map(|t| t.ticket_id).collect();

        let plan = plan_promotion(Uuid::new_v4(), 100, &live, now, grace()).unwrap();
        assert_eq!(plan.expired, stale);
        assert_eq!(plan.promoted.len(), 20);

        let after = apply(live, &plan, now);
        assert_eq!(after.iter().filter(|t| !t.is_reserve).count(), 100);
        assert_eq!(after.iter().filter(|t| t.is_reserve).count(), 0);
    }

    #[test]
    fn payments_within_grace_are_left_alone() {
        let now = Utc::now();
        let mut live = oversubscribed(now);
        for t in live.iter_mut().take(20) {
            t.updated_at = now - Duration::hours(23);
        }
        let plan = plan_promotion(Uuid::new_v4(), 100, &live, now, grace()).unwrap();
        assert!(plan.is_noop());
    }

    #[test]
    fn paid_tickets_never_expire() {
        let now = Utc::now();
        let mut live = oversubscribed(now);
        for t in live.iter_mut().take(20) {
            t.updated_at = now - Duration::days(30);
            t.is_paid = true;
        }
        assert!(plan_promotion(Uuid::new_v4(), 100, &live, now, grace()).unwrap().is_noop());
    }

    #[test]
    fn partial_promotion_renumbers_the_tail() {
        let now = Utc::now();
        let mut live = oversubscribed(now);
        live.drain(0..5);

        let plan = plan_promotion(Uuid::new_v4(), 100, &live, now, grace()).unwrap();
        let promoted: Vec<Option<i32>> = plan.promoted.iter().map(|t| t.reserve_number).collect();
        assert_eq!(promoted, (1..=5).map(Some).collect::<Vec<_>>());
        assert_eq!(plan.renumbered.len(), 15);
        assert_eq!(plan.renumbered.first().map(|(_, n)| *n), Some(1));

        let after = apply(live, &plan, now);
        let mut numbers: Vec<i32> = after.iter().filter_map(|t| t.reserve_number).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=15).collect::<Vec<_>>());
    }

    #[test]
    fn withdrawn_reserve_gap_is_closed_without_freed_slots() {
        let now = Utc::now();
        let mut live = oversubscribed(now);
        live.retain(|t| t.reserve_number != Some(3));

        let plan = plan_promotion(Uuid::new_v4(), 100, &live, now, grace()).unwrap();
        assert!(plan.promoted.is_empty());
        assert_eq!(plan.renumbered.len(), 17);
    }

    #[test]
    fn second_run_is_a_noop() {
        let now = Utc::now();
        let mut live = oversubscribed(now);
        live.drain(0..7);
        let release = Uuid::new_v4();

        let plan = plan_promotion(release, 100, &live, now, grace()).unwrap();
        let after = apply(live, &plan, now);
        assert!(plan_promotion(release, 100, &after, now, grace()).unwrap().is_noop());
    }

    #[test]
    fn overfull_release_is_an_invariant_violation() {
        let now = Utc::now();
        let live: Vec<TicketSlot> = (0..3).map(|_| slot(false, None, now)).collect();
        let err = plan_promotion(Uuid::new_v4(), 2, &live, now, grace()).unwrap_err();
        assert!(err.is_invariant());
    }

    proptest! {
        #[test]
        fn promotion_keeps_capacity_and_dense_queue(
            capacity in 1i32..40,
            reserves in 0usize..30,
            deleted in 0usize..40,
            stale_hours in prop::collection::vec(0i64..48, 40),
        ) {
            let now = Utc::now();
            let allocated = capacity as usize;
            let mut live: Vec<TicketSlot> = (0..allocated)
                .map(|i| slot(false, None, now - Duration::hours(stale_hours[i % stale_hours.len()])))
                .collect();
            live.extend((1..=reserves as i32).map(|n| slot(true, Some(n), now)));
            live.drain(0..deleted.min(allocated));

            let release = Uuid::new_v4();
            let plan = plan_promotion(release, capacity, &live, now, grace()).unwrap();
            let after = apply(live, &plan, now);

            let allocated_after = after.iter().filter(|t| !t.is_reserve && !t.is_past_deadline(now, grace())).count();
            prop_assert!(allocated_after as i32 <= capacity);
            let mut numbers: Vec<i32> = after.iter().filter_map(|t| t.reserve_number).collect();
            numbers.sort_unstable();
            let expected: Vec<i32> = (1..=numbers.len() as i32).collect();
            prop_assert_eq!(numbers, expected);
            prop_assert!(plan_promotion(release, capacity, &after, now, grace()).unwrap().is_noop());
        }
    }
}
