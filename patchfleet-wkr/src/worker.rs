//! The select → test → report loop.

use std::collections::HashSet;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use patchfleet_common::{
    BASELINE_TICKET_ID, BaseFilter, CommitDistance, MachineId, PendingPhase, RatingEngine, Report,
    Selection, SkipList, SkipReason, Status, Ticket, TicketSelector, TimedCache, WorkerSettings,
    derive_status, now_str,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::client::{Aggregator, ClientError};
use crate::tester::TicketTester;

/// Refresh period of the daemon's latest baseline label.
const LATEST_BASE_REFRESH_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("baseline version unknown: set `base` in the worker config or report on ticket 0 first")]
    NoBase,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Idle,
    Reported { id: u64, status: Status },
    Skipped { id: u64, reason: SkipReason },
}

pub struct Worker<A: Aggregator, T: TicketTester> {
    settings: WorkerSettings,
    machine: MachineId,
    aggregator: A,
    tester: T,
    distance: Box<dyn CommitDistance>,
    git_base: Option<String>,
    skip: SkipList,
    trusted: TimedCache<HashSet<String>>,
    latest_base: TimedCache<Option<String>>,
}

impl<A: Aggregator, T: TicketTester> Worker<A, T> {
    pub fn new(settings: WorkerSettings, machine: MachineId, aggregator: A, tester: T) -> Self {
        Self {
            settings,
            machine,
            aggregator,
            tester,
            // Without local history every recorded base counts as current.
            distance: Box::new(|_: &str| -> Option<u64> { Some(0) }),
            git_base: None,
            skip: SkipList::new(),
            trusted: TimedCache::until_invalidated(),
            latest_base: TimedCache::from_secs(LATEST_BASE_REFRESH_SECS),
        }
    }

    /// Use `distance` for staleness and stamp reports with `git_base`.
    pub fn with_distance(mut self, distance: Box<dyn CommitDistance>, git_base: Option<String>) -> Self {
        self.distance = distance;
        self.git_base = git_base;
        self
    }

    pub fn aggregator(&self) -> &A {
        &self.aggregator
    }

    pub fn skip_list(&self) -> &SkipList {
        &self.skip
    }

    /// Force the trusted-author list to be fetched again.
    pub fn refresh_trusted(&mut self) {
        self.trusted.invalidate();
    }

    fn trusted_authors(&mut self, now: DateTime<Utc>) -> Result<HashSet<String>, ClientError> {
        if let Some(list) = &self.settings.trusted_authors {
            return Ok(list.iter().cloned().collect());
        }
        let aggregator = &self.aggregator;
        self.trusted
            .get_or_try_refresh(now, || aggregator.trusted_authors())
            .cloned()
    }

    fn current_base(&mut self, now: DateTime<Utc>) -> Option<String> {
        if let Some(base) = &self.settings.base {
            return Some(base.clone());
        }
        let aggregator = &self.aggregator;
        match self.latest_base.get_or_try_refresh(now, || aggregator.latest_base()) {
            Ok(base) => base.clone(),
            Err(e) => {
                warn!("Could not fetch latest base: {}", e);
                None
            }
        }
    }

    fn candidates(&self, base: Option<&str>) -> Result<Vec<Ticket>, ClientError> {
        let mut seen = HashSet::new();
        let mut tickets = Vec::new();
        for status in &self.settings.open_statuses {
            for ticket in self.aggregator.tickets(status, self.settings.candidate_limit)? {
                if seen.insert(ticket.id) {
                    tickets.push(ticket);
                }
            }
        }

        let baseline = self.aggregator.ticket(BASELINE_TICKET_ID)?;
        let filter = match base {
            Some(b) => BaseFilter::Exact(b.to_string()),
            None => BaseFilter::Latest,
        };
        if derive_status(&baseline, &filter, Some(&self.machine)).count == 0 {
            debug!("No current baseline report from this machine");
            tickets.push(baseline);
        }
        debug!("Fetched {} candidate tickets", tickets.len());
        Ok(tickets)
    }

    /// Eligible candidates, best first.
    pub fn rank(&mut self, now: DateTime<Utc>) -> Result<Vec<Selection>, ClientError> {
        let trusted = self.trusted_authors(now)?;
        let base = self.current_base(now);
        let candidates = self.candidates(base.as_deref())?;

        let mut config = self.settings.rating_config(self.machine.clone(), trusted);
        config.base = base;
        let engine = RatingEngine::new(&config, self.distance.as_ref());
        let selector = TicketSelector::new(engine, self.settings.lease_policy());
        Ok(selector.rank(candidates, &mut self.skip, now))
    }

    /// One selection and test cycle.
    pub fn run_once(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome, WorkerError> {
        self.skip.purge_expired(now);
        let ranked = self.rank(now)?;
        let Some(selection) = ranked.into_iter().next() else {
            info!("Nothing to test");
            return Ok(CycleOutcome::Idle);
        };
        let base = self.current_base(now).ok_or(WorkerError::NoBase)?;
        let ticket = selection.ticket;
        info!("#{}: selected with rating {}", ticket.id, selection.rating);

        if !ticket.spkgs.is_empty() {
            return Ok(self.skip_ticket(ticket.id, SkipReason::UnsupportedPackage, now));
        }

        let ticket = match self.aggregator.ticket(ticket.id) {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("#{}: could not refresh ticket: {}", ticket.id, e);
                return Ok(self.skip_ticket(ticket.id, SkipReason::NetworkFailure, now));
            }
        };
        if !ticket.is_baseline() && !self.settings.open_statuses.contains(&ticket.status) {
            info!("#{}: status changed to {}", ticket.id, ticket.status);
            return Ok(self.skip_ticket(ticket.id, SkipReason::ClosedTicket, now));
        }

        Ok(self.test_ticket(&ticket, &base, now))
    }

    fn test_ticket(&mut self, ticket: &Ticket, base: &str, now: DateTime<Utc>) -> CycleOutcome {
        let id = ticket.id;
        let mut pending = self.report_for(ticket, Status::Pending, base);
        pending.pending_status = Some(PendingPhase::Started);
        if let Err(e) = self.aggregator.post_report(id, &pending, None) {
            warn!("#{}: failed to post pending report: {}", id, e);
            return self.skip_ticket(id, SkipReason::NetworkFailure, now);
        }

        let outcome = match self.tester.test(ticket, base) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("#{}: {}", id, e);
                return self.skip_ticket(id, SkipReason::TesterError, now);
            }
        };

        let report = self.report_for(ticket, outcome.status, base);
        match self.aggregator.post_report(id, &report, Some(&outcome.log)) {
            Ok(()) => {
                info!("#{}: reported {}", id, outcome.status);
                CycleOutcome::Reported {
                    id,
                    status: outcome.status,
                }
            }
            Err(e) => {
                warn!("#{}: failed to post report: {}", id, e);
                self.skip_ticket(id, SkipReason::NetworkFailure, now)
            }
        }
    }

    fn report_for(&self, ticket: &Ticket, status: Status, base: &str) -> Report {
        let mut report = Report::new(status, self.machine.clone(), base, now_str());
        report.git_commit = ticket.git_commit.clone();
        report.git_base = self.git_base.clone();
        report.spkgs = ticket.spkgs.clone();
        report.deps = ticket.depends_on.clone();
        report.user = self.settings.user.clone();
        report.owner = self.settings.owner.clone();
        report
    }

    fn skip_ticket(&mut self, id: u64, reason: SkipReason, now: DateTime<Utc>) -> CycleOutcome {
        self.skip.skip(id, reason, now);
        CycleOutcome::Skipped { id, reason }
    }

    /// Loop forever, idling when there is nothing to do.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        let idle = StdDuration::from_secs(self.settings.idle_secs);
        loop {
            match self.run_once(Utc::now()) {
                Ok(CycleOutcome::Idle) => {
                    info!("Idling for {}", humantime::format_duration(idle));
                    std::thread::sleep(idle);
                }
                Ok(outcome) => debug!("Cycle finished: {:?}", outcome),
                Err(WorkerError::NoBase) => return Err(WorkerError::NoBase),
                Err(e) => {
                    warn!("Cycle failed: {}", e);
                    std::thread::sleep(idle);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tester::{TestOutcome, TesterError};
    use chrono::Duration;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn me() -> MachineId {
        MachineId::new(["Linux", "22.04", "x86_64", "5.15", "me"])
    }

    #[derive(Default)]
    struct FakeAggregator {
        listed: Vec<Ticket>,
        current: HashMap<u64, Ticket>,
        fail_posts: bool,
        posted: Mutex<Vec<(u64, Report, Option<String>)>>,
    }

    impl FakeAggregator {
        fn with(tickets: Vec<Ticket>) -> Self {
            let current = tickets.iter().map(|t| (t.id, t.clone())).collect();
            Self {
                listed: tickets,
                current,
                ..Self::default()
            }
        }

        fn posted(&self) -> Vec<(u64, Report, Option<String>)> {
            self.posted.lock().unwrap().clone()
        }
    }

    impl Aggregator for FakeAggregator {
        fn tickets(&self, status: &str, limit: usize) -> Result<Vec<Ticket>, ClientError> {
            Ok(self
                .listed
                .iter()
                .filter(|t| t.status == status)
                .take(limit)
                .cloned()
                .collect())
        }

        fn ticket(&self, id: u64) -> Result<Ticket, ClientError> {
            Ok(self.current.get(&id).cloned().unwrap_or_else(|| Ticket::new(id)))
        }

        fn trusted_authors(&self) -> Result<HashSet<String>, ClientError> {
            Ok(HashSet::from(["alice".to_string()]))
        }

        fn latest_base(&self) -> Result<Option<String>, ClientError> {
            Ok(None)
        }

        fn post_report(&self, id: u64, report: &Report, log: Option<&str>) -> Result<(), ClientError> {
            if self.fail_posts {
                return Err(ClientError::Rejected {
                    url: format!("/report/{id}"),
                    status: 503,
                    message: "down".into(),
                });
            }
            self.posted
                .lock()
                .unwrap()
                .push((id, report.clone(), log.map(str::to_string)));
            Ok(())
        }
    }

    struct FixedTester {
        result: Option<Status>,
        calls: Cell<usize>,
    }

    impl FixedTester {
        fn passing() -> Self {
            Self {
                result: Some(Status::TestsPassed),
                calls: Cell::new(0),
            }
        }

        fn crashing() -> Self {
            Self {
                result: None,
                calls: Cell::new(0),
            }
        }
    }

    impl TicketTester for FixedTester {
        fn test(&self, _ticket: &Ticket, _base: &str) -> Result<TestOutcome, TesterError> {
            self.calls.set(self.calls.get() + 1);
            match self.result {
                Some(status) => Ok(TestOutcome {
                    status,
                    log: "log text".into(),
                }),
                None => Err(TesterError::Crashed {
                    code: Some(99),
                    log: String::new(),
                }),
            }
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            base: Some("9.3".into()),
            machine: Some(me().0),
            owner: Some("ops@example.com".into()),
            ..WorkerSettings::default()
        }
    }

    fn open_ticket(id: u64) -> Ticket {
        let mut t = Ticket::new(id);
        t.status = "needs_review".into();
        t.git_commit = Some(format!("c{id}"));
        t.authors = vec!["alice".into()];
        t
    }

    /// Baseline already tested by this machine on 9.3.
    fn proven_baseline() -> Ticket {
        let mut t = Ticket::new(0);
        t.reports.push(Report::new(Status::TestsPassed, me(), "9.3", now_str()));
        t
    }

    fn worker(tickets: Vec<Ticket>, tester: FixedTester) -> Worker<FakeAggregator, FixedTester> {
        Worker::new(settings(), me(), FakeAggregator::with(tickets), tester)
    }

    #[test]
    fn untested_baseline_comes_first() {
        let mut w = worker(vec![open_ticket(5)], FixedTester::passing());
        let outcome = w.run_once(Utc::now()).unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Reported {
                id: 0,
                status: Status::TestsPassed
            }
        );
    }

    #[test]
    fn cycle_posts_pending_then_final() {
        let mut w = worker(vec![open_ticket(5), proven_baseline()], FixedTester::passing());
        let outcome = w.run_once(Utc::now()).unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Reported {
                id: 5,
                status: Status::TestsPassed
            }
        );

        let posted = w.aggregator().posted();
        assert_eq!(posted.len(), 2);
        let (_, pending, log) = &posted[0];
        assert!(pending.is_pending());
        assert_eq!(pending.pending_status, Some(PendingPhase::Started));
        assert!(log.is_none());
        let (id, done, log) = &posted[1];
        assert_eq!(*id, 5);
        assert_eq!(done.git_commit.as_deref(), Some("c5"));
        assert_eq!(done.base, "9.3");
        assert_eq!(done.owner.as_deref(), Some("ops@example.com"));
        assert_eq!(log.as_deref(), Some("log text"));
    }

    #[test]
    fn idle_when_nothing_qualifies() {
        let mut closed = open_ticket(5);
        closed.status = "closed".into();
        let mut w = worker(vec![closed, proven_baseline()], FixedTester::passing());
        assert_eq!(w.run_once(Utc::now()).unwrap(), CycleOutcome::Idle);
        assert!(w.aggregator().posted().is_empty());
    }

    #[test]
    fn package_tickets_get_long_cooldown() {
        let mut t = open_ticket(5);
        t.spkgs = vec!["foo-1.0".into()];
        let mut w = worker(vec![t, proven_baseline()], FixedTester::passing());
        let now = Utc::now();
        assert_eq!(
            w.run_once(now).unwrap(),
            CycleOutcome::Skipped {
                id: 5,
                reason: SkipReason::UnsupportedPackage
            }
        );
        assert_eq!(w.run_once(now + Duration::hours(239)).unwrap(), CycleOutcome::Idle);
    }

    #[test]
    fn tester_crash_skips_ticket() {
        let mut w = worker(vec![open_ticket(5), proven_baseline()], FixedTester::crashing());
        let outcome = w.run_once(Utc::now()).unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Skipped {
                id: 5,
                reason: SkipReason::TesterError
            }
        );
        assert_eq!(w.aggregator().posted().len(), 1);
        assert_eq!(w.skip_list().len(), 1);
    }

    #[test]
    fn post_failure_is_a_network_skip() {
        let mut aggregator = FakeAggregator::with(vec![open_ticket(5), proven_baseline()]);
        aggregator.fail_posts = true;
        let mut w = Worker::new(settings(), me(), aggregator, FixedTester::passing());
        let outcome = w.run_once(Utc::now()).unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Skipped {
                id: 5,
                reason: SkipReason::NetworkFailure
            }
        );
        assert_eq!(w.tester.calls.get(), 0);
    }

    #[test]
    fn ticket_closed_since_listing_is_skipped() {
        let mut aggregator = FakeAggregator::with(vec![open_ticket(5), proven_baseline()]);
        let mut closed = open_ticket(5);
        closed.status = "closed".into();
        aggregator.current.insert(5, closed);
        let mut w = Worker::new(settings(), me(), aggregator, FixedTester::passing());
        assert_eq!(
            w.run_once(Utc::now()).unwrap(),
            CycleOutcome::Skipped {
                id: 5,
                reason: SkipReason::ClosedTicket
            }
        );
    }

    #[test]
    fn missing_base_is_fatal() {
        let mut cfg = settings();
        cfg.base = None;
        let mut w = Worker::new(cfg, me(), FakeAggregator::with(vec![open_ticket(5)]), FixedTester::passing());
        assert!(matches!(w.run_once(Utc::now()), Err(WorkerError::NoBase)));
    }

    #[test]
    fn rank_lists_candidates_best_first() {
        let mut w = worker(
            vec![open_ticket(9), open_ticket(3), proven_baseline()],
            FixedTester::passing(),
        );
        let ids: Vec<u64> = w.rank(Utc::now()).unwrap().iter().map(|s| s.ticket.id).collect();
        assert_eq!(ids, vec![3, 9]);
    }

    #[test]
    fn stale_own_report_is_retested_with_git_history() {
        let mut tested = open_ticket(5);
        tested.reports.push(
            Report::new(Status::TestsPassed, me(), "9.3", now_str())
                .with_commit("c5")
                .with_git_base("old"),
        );
        let mut w = worker(vec![tested.clone(), proven_baseline()], FixedTester::passing());
        assert_eq!(w.run_once(Utc::now()).unwrap(), CycleOutcome::Idle);

        let behind = |base: &str| -> Option<u64> { if base == "old" { Some(3) } else { Some(0) } };
        let mut w = worker(vec![tested, proven_baseline()], FixedTester::passing())
            .with_distance(Box::new(behind), Some("new".into()));
        let outcome = w.run_once(Utc::now()).unwrap();
        assert!(matches!(outcome, CycleOutcome::Reported { id: 5, .. }));
        assert_eq!(w.aggregator().posted()[1].1.git_base.as_deref(), Some("new"));
    }
}
