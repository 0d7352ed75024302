//! Next-ticket selection and the per-worker cooldown list.

use crate::pending::{LeasePolicy, prune_pending};
use crate::rating::{Rating, RatingEngine};
use crate::types::Ticket;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

// ============================================================================
// Skip list
// ============================================================================

/// Why a ticket is being put on cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The daemon or tracker was unreachable mid-cycle.
    NetworkFailure,
    /// The tester itself crashed rather than reporting an outcome.
    TesterError,
    /// The ticket moved out of the open set while we looked at it.
    ClosedTicket,
    /// External packages need manual handling.
    UnsupportedPackage,
}

impl SkipReason {
    pub fn cooldown(self) -> Duration {
        match self {
            Self::NetworkFailure => Duration::hours(1),
            Self::TesterError => Duration::hours(12),
            Self::ClosedTicket => Duration::hours(120),
            Self::UnsupportedPackage => Duration::hours(240),
        }
    }
}

/// Ticket id → absolute deadline before which it must not be selected.
///
/// Process-scoped; nothing here is persisted.
#[derive(Debug, Clone, Default)]
pub struct SkipList {
    entries: HashMap<u64, DateTime<Utc>>,
}

impl SkipList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress `id` until `deadline`. A later deadline never shrinks.
    pub fn skip_until(&mut self, id: u64, deadline: DateTime<Utc>) {
        let entry = self.entries.entry(id).or_insert(deadline);
        if *entry < deadline {
            *entry = deadline;
        }
    }

    pub fn skip_for(&mut self, id: u64, cooldown: Duration, now: DateTime<Utc>) {
        self.skip_until(id, now + cooldown);
    }

    pub fn skip(&mut self, id: u64, reason: SkipReason, now: DateTime<Utc>) {
        info!("#{}: skipping for {} hours ({:?})", id, reason.cooldown().num_hours(), reason);
        self.skip_for(id, reason.cooldown(), now);
    }

    /// Deadline of `id` if it is still on cooldown. An expired entry is
    /// dropped on the way.
    pub fn is_skipped(&mut self, id: u64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.entries.get(&id).copied() {
            Some(deadline) if deadline > now => Some(deadline),
            Some(_) => {
                self.entries.remove(&id);
                None
            }
            None => None,
        }
    }

    pub fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.entries.retain(|_, deadline| *deadline > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Selector
// ============================================================================

/// A rated candidate.
#[derive(Debug, Clone)]
pub struct Selection {
    pub ticket: Ticket,
    pub rating: Rating,
}

/// Rates a fresh batch of candidates on every call; nothing is queued.
pub struct TicketSelector<'a> {
    engine: RatingEngine<'a>,
    lease: LeasePolicy,
}

impl<'a> TicketSelector<'a> {
    pub fn new(engine: RatingEngine<'a>, lease: LeasePolicy) -> Self {
        Self { engine, lease }
    }

    /// Every eligible candidate, best first.
    pub fn rank(
        &self,
        candidates: impl IntoIterator<Item = Ticket>,
        skip: &mut SkipList,
        now: DateTime<Utc>,
    ) -> Vec<Selection> {
        let mut ranked: Vec<Selection> = candidates
            .into_iter()
            .filter_map(|mut ticket| {
                prune_pending(&mut ticket, None, &self.lease, now);
                let rating = self.engine.rate(&ticket, skip, now)?;
                Some(Selection { ticket, rating })
            })
            .collect();
        ranked.sort_by(|a, b| b.rating.cmp(&a.rating));
        ranked
    }

    /// The single best candidate, or `None` when the caller should idle.
    pub fn select(
        &self,
        candidates: impl IntoIterator<Item = Ticket>,
        skip: &mut SkipList,
        now: DateTime<Utc>,
    ) -> Option<Selection> {
        let best = self.rank(candidates, skip, now).into_iter().next();
        match &best {
            Some(s) => debug!("selected #{} with rating {}", s.ticket.id, s.rating),
            None => debug!("no eligible ticket"),
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineId;
    use crate::rating::{BonusTable, RatingConfig};
    use crate::status::Status;
    use crate::types::{Report, format_time};
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn me() -> MachineId {
        MachineId::new(["Linux", "22.04", "x86_64", "5.15", "me"])
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn config() -> RatingConfig {
        RatingConfig {
            machine: me(),
            machine_match: None,
            base: None,
            open_statuses: HashSet::from(["needs_review".to_string()]),
            skip_milestones: HashSet::new(),
            trusted_authors: HashSet::from(["alice".to_string()]),
            bonus: BonusTable::defaults(),
        }
    }

    fn ticket(id: u64) -> Ticket {
        let mut t = Ticket::new(id);
        t.status = "needs_review".into();
        t.git_commit = Some(format!("c{id}"));
        t.authors = vec!["alice".into()];
        t
    }

    fn no_history(_: &str) -> Option<u64> {
        None
    }

    #[test]
    fn equal_scores_prefer_lower_id() {
        let cfg = config();
        let selector = TicketSelector::new(RatingEngine::new(&cfg, &no_history), LeasePolicy::default());
        let picked = selector
            .select(vec![ticket(30), ticket(12), ticket(20)], &mut SkipList::new(), now())
            .unwrap();
        assert_eq!(picked.ticket.id, 12);
    }

    #[test]
    fn baseline_wins_over_everything() {
        let cfg = config();
        let selector = TicketSelector::new(RatingEngine::new(&cfg, &no_history), LeasePolicy::default());
        let picked = selector
            .select(vec![ticket(1), Ticket::new(0)], &mut SkipList::new(), now())
            .unwrap();
        assert!(picked.ticket.is_baseline());
    }

    #[test]
    fn nothing_eligible_yields_none() {
        let cfg = config();
        let selector = TicketSelector::new(RatingEngine::new(&cfg, &no_history), LeasePolicy::default());
        let mut closed = ticket(4);
        closed.status = "closed".into();
        assert!(selector.select(vec![closed], &mut SkipList::new(), now()).is_none());
        assert!(selector.select(Vec::new(), &mut SkipList::new(), now()).is_none());
    }

    #[test]
    fn skipped_ticket_is_passed_over() {
        let cfg = config();
        let selector = TicketSelector::new(RatingEngine::new(&cfg, &no_history), LeasePolicy::default());
        let mut skip = SkipList::new();
        skip.skip(12, SkipReason::NetworkFailure, now());

        let picked = selector.select(vec![ticket(12), ticket(20)], &mut skip, now()).unwrap();
        assert_eq!(picked.ticket.id, 20);

        let later = now() + Duration::hours(2);
        let picked = selector.select(vec![ticket(12), ticket(20)], &mut skip, later).unwrap();
        assert_eq!(picked.ticket.id, 12);
    }

    #[test]
    fn expired_own_lease_does_not_hide_ticket() {
        let cfg = config();
        let selector = TicketSelector::new(RatingEngine::new(&cfg, &no_history), LeasePolicy::default());
        let mut t = ticket(8);
        let started = now() - Duration::hours(7);
        t.reports.push(
            Report::new(Status::Pending, me(), "9.3", format_time(started)).with_commit("c8"),
        );

        let ranked = selector.rank(vec![t], &mut SkipList::new(), now());
        assert_eq!(ranked.len(), 1);
        assert!(ranked[0].ticket.reports.is_empty());
    }

    #[test]
    fn live_lease_from_same_machine_suppresses() {
        let cfg = config();
        let selector = TicketSelector::new(RatingEngine::new(&cfg, &no_history), LeasePolicy::default());
        let mut t = ticket(8);
        t.reports.push(
            Report::new(Status::Pending, me(), "9.3", format_time(now() - Duration::hours(1)))
                .with_commit("c8"),
        );
        assert!(selector.select(vec![t], &mut SkipList::new(), now()).is_none());
    }

    #[test]
    fn rank_is_sorted_best_first() {
        let mut cfg = config();
        cfg.bonus.set("20", 50);
        let selector = TicketSelector::new(RatingEngine::new(&cfg, &no_history), LeasePolicy::default());
        let ids: Vec<u64> = selector
            .rank(vec![ticket(10), ticket(20), ticket(30)], &mut SkipList::new(), now())
            .iter()
            .map(|s| s.ticket.id)
            .collect();
        assert_eq!(ids, vec![20, 10, 30]);
    }

    #[test]
    fn skip_deadline_only_grows() {
        let mut skip = SkipList::new();
        skip.skip(3, SkipReason::UnsupportedPackage, now());
        skip.skip(3, SkipReason::NetworkFailure, now());
        let deadline = skip.is_skipped(3, now()).unwrap();
        assert_eq!(deadline, now() + Duration::hours(240));
    }

    #[test]
    fn purge_drops_only_expired() {
        let mut skip = SkipList::new();
        skip.skip_for(1, Duration::minutes(5), now());
        skip.skip_for(2, Duration::hours(5), now());
        skip.purge_expired(now() + Duration::hours(1));
        assert_eq!(skip.len(), 1);
        assert!(skip.is_skipped(2, now() + Duration::hours(1)).is_some());
    }
}
