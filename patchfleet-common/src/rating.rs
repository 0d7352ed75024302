//! Ticket rating for one worker's point of view.
//!
//! A rating is the triple `(uniqueness, bonus, -id)` compared
//! lexicographically; larger means test sooner. Eligibility gates run
//! first and exclude a ticket outright. Scoring then adds configured
//! weights, and the report scan lowers priority for tickets that are
//! already well covered by equivalent machines.

use crate::aggregate::{BaseFilter, current_reports};
use crate::machine::{MachineId, compare, is_all_match};
use crate::selection::SkipList;
use crate::status::Status;
use crate::types::Ticket;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// Uniqueness seed when no prior report has been examined.
pub const FULLY_DIFFERENT: u32 = 100;

/// Bonus keys with a meaning beyond identifier lookup.
pub const BONUS_BEHIND: &str = "behind";
pub const BONUS_APPLIES: &str = "applies";
pub const BONUS_UNIQUE: &str = "unique";

/// Source of commit distances between a report's tested baseline and the
/// worker's present baseline.
pub trait CommitDistance {
    /// Number of commits in the present baseline that `git_base` lacks, or
    /// `None` when `git_base` is unknown to local history.
    fn commits_behind(&self, git_base: &str) -> Option<u64>;
}

impl<F> CommitDistance for F
where
    F: Fn(&str) -> Option<u64>,
{
    fn commits_behind(&self, git_base: &str) -> Option<u64> {
        self(git_base)
    }
}

/// Identifier → integer weight lookup. Unknown keys weigh 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BonusTable(HashMap<String, i64>);

impl BonusTable {
    pub fn new(weights: HashMap<String, i64>) -> Self {
        Self(weights)
    }

    /// The stock weights every worker starts from.
    pub fn defaults() -> Self {
        let weights = [
            ("needs_review", 1000),
            ("positive_review", 500),
            ("blocker", 100),
            ("critical", 60),
            ("major", 10),
            (BONUS_UNIQUE, 40),
            (BONUS_APPLIES, 20),
            (BONUS_BEHIND, 1),
        ];
        Self(weights.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    /// User weights layered over the defaults; user keys win.
    pub fn with_defaults(user: HashMap<String, i64>) -> Self {
        let mut table = Self::defaults();
        table.0.extend(user);
        table
    }

    pub fn weight(&self, key: &str) -> i64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    pub fn set(&mut self, key: impl Into<String>, weight: i64) {
        self.0.insert(key.into(), weight);
    }
}

impl Default for BonusTable {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Everything a worker knows about itself when rating tickets.
#[derive(Debug, Clone)]
pub struct RatingConfig {
    pub machine: MachineId,
    /// Number of identity components compared (`None` = all).
    pub machine_match: Option<usize>,
    /// The worker's present baseline label, when known.
    pub base: Option<String>,
    pub open_statuses: HashSet<String>,
    pub skip_milestones: HashSet<String>,
    pub trusted_authors: HashSet<String>,
    pub bonus: BonusTable,
}

/// Priority of a ticket. Field order is the comparison order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rating {
    pub uniqueness: Vec<u32>,
    pub bonus: i64,
    /// Negated ticket id, so lower ids win ties.
    pub neg_id: i64,
}

impl Rating {
    /// Fixed rating of the baseline ticket; outranks everything.
    pub fn baseline() -> Self {
        Self {
            uniqueness: vec![u32::MAX],
            bonus: i64::MAX,
            neg_id: 0,
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?}, {})", self.uniqueness, self.bonus)
    }
}

/// Why a ticket was left out of selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    NoCommit,
    NotOpen(String),
    Milestone(String),
    NoAuthors,
    UntrustedAuthor(String),
    Cooldown(DateTime<Utc>),
    AlreadyCovered,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCommit => write!(f, "no git commit"),
            Self::NotOpen(s) => write!(f, "bad status (={s})"),
            Self::Milestone(m) => write!(f, "milestone not tested (got {m})"),
            Self::NoAuthors => write!(f, "no author given"),
            Self::UntrustedAuthor(a) => write!(f, "author not trusted (got {a})"),
            Self::Cooldown(until) => write!(f, "in skip delay until {until}"),
            Self::AlreadyCovered => write!(f, "already done"),
        }
    }
}

/// Rates tickets against one worker's configuration.
pub struct RatingEngine<'a> {
    config: &'a RatingConfig,
    distance: &'a dyn CommitDistance,
}

impl<'a> RatingEngine<'a> {
    pub fn new(config: &'a RatingConfig, distance: &'a dyn CommitDistance) -> Self {
        Self { config, distance }
    }

    /// Rating of `ticket`, or `None` when it must not be tested.
    pub fn rate(&self, ticket: &Ticket, skip: &mut SkipList, now: DateTime<Utc>) -> Option<Rating> {
        match self.evaluate(ticket, skip, now) {
            Ok(rating) => Some(rating),
            Err(reason) => {
                debug!(target: "patchfleet::rating", "#{}: excluded: {}", ticket.id, reason);
                None
            }
        }
    }

    /// Like [`rate`](Self::rate) but reports the exclusion reason.
    pub fn evaluate(
        &self,
        ticket: &Ticket,
        skip: &mut SkipList,
        now: DateTime<Utc>,
    ) -> Result<Rating, Exclusion> {
        if ticket.is_baseline() {
            return Ok(Rating::baseline());
        }
        self.check_gates(ticket, skip, now)?;

        debug!(target: "patchfleet::rating", "#{}: start rating", ticket.id);
        let mut bonus = self.metadata_bonus(ticket);

        let mut uniqueness = vec![FULLY_DIFFERENT];
        if !ticket.retry {
            uniqueness = self.scan_reports(ticket, &mut bonus);
            if is_all_match(&uniqueness) {
                return Err(Exclusion::AlreadyCovered);
            }
        }

        let rating = Rating {
            uniqueness,
            bonus,
            neg_id: -i64::try_from(ticket.id).unwrap_or(i64::MAX),
        };
        debug!(target: "patchfleet::rating", "#{}: rated {}", ticket.id, rating);
        Ok(rating)
    }

    fn check_gates(&self, ticket: &Ticket, skip: &mut SkipList, now: DateTime<Utc>) -> Result<(), Exclusion> {
        let cfg = self.config;
        if ticket.testable_commit().is_none() {
            return Err(Exclusion::NoCommit);
        }
        if !cfg.open_statuses.contains(&ticket.status) {
            return Err(Exclusion::NotOpen(ticket.status.clone()));
        }
        if cfg.skip_milestones.contains(&ticket.milestone) {
            return Err(Exclusion::Milestone(ticket.milestone.clone()));
        }
        if ticket.declared_authors().is_empty() {
            return Err(Exclusion::NoAuthors);
        }
        if let Some(untrusted) = ticket
            .authors_to_vet()
            .find(|a| !cfg.trusted_authors.contains(*a))
        {
            return Err(Exclusion::UntrustedAuthor(untrusted.clone()));
        }
        if let Some(until) = skip.is_skipped(ticket.id, now) {
            return Err(Exclusion::Cooldown(until));
        }
        Ok(())
    }

    fn metadata_bonus(&self, ticket: &Ticket) -> i64 {
        let bonus = &self.config.bonus;
        let mut rating: i64 = 0;

        // Full names and short ids both count; a concrete person can be
        // promoted (or banned) under either form.
        for author in ticket.authors_fullnames.iter().chain(ticket.authors.iter()) {
            rating += 2 * bonus.weight(author);
        }
        debug!(target: "patchfleet::rating", " rating {} after authors", rating);

        for participant in &ticket.participants {
            rating += bonus.weight(participant);
        }
        debug!(target: "patchfleet::rating", " rating {} after participants", rating);

        if !ticket.component.is_empty() {
            rating += bonus.weight(&ticket.component);
        }
        rating += bonus.weight(&ticket.status);
        rating += bonus.weight(&ticket.priority);
        rating += bonus.weight(&ticket.id.to_string());
        debug!(
            target: "patchfleet::rating",
            " rating {} after component/status ({})/priority ({})/id",
            rating, ticket.status, ticket.priority
        );
        rating
    }

    /// Walk the current reports, returning the best existing coverage and
    /// folding staleness and redundancy into `bonus`.
    fn scan_reports(&self, ticket: &Ticket, bonus: &mut i64) -> Vec<u32> {
        let cfg = self.config;
        let weights = &cfg.bonus;
        let filter = match &cfg.base {
            Some(base) => BaseFilter::AtLeast(base.clone()),
            None => BaseFilter::Any,
        };

        let mut uniqueness = vec![FULLY_DIFFERENT];
        for report in current_reports(ticket, &filter, None) {
            // None: no git_base recorded. Some(None): base unknown locally.
            let distance = report
                .git_base
                .as_deref()
                .map(|git_base| self.distance.commits_behind(git_base));

            let behind = match distance {
                None => 0,
                Some(Some(n)) => n,
                Some(None) => {
                    debug!(
                        target: "patchfleet::rating",
                        " commit {} not in the local history",
                        report.git_base.as_deref().unwrap_or_default()
                    );
                    1
                }
            };
            let penalty = weights
                .weight(BONUS_BEHIND)
                .saturating_mul(i64::try_from(behind).unwrap_or(i64::MAX));
            *bonus = bonus.saturating_sub(penalty);

            let mut similarity = compare(&report.machine, &cfg.machine, cfg.machine_match);
            let stale = matches!(distance, Some(None) | Some(Some(1..)));
            if stale && is_all_match(&similarity) {
                similarity = low_but_nonzero(similarity.len());
            }
            if similarity < uniqueness {
                uniqueness = similarity;
            }

            if report.status != Status::ApplyFailed {
                *bonus += weights.weight(BONUS_APPLIES);
            }
            *bonus -= weights.weight(BONUS_UNIQUE);
            debug!(
                target: "patchfleet::rating",
                " rating {} after report from {} ({})",
                bonus, report.machine, report.status
            );
        }
        uniqueness
    }
}

/// All-zero vector with a trailing `1`: a near-perfect match that still
/// leaves room for a re-test.
fn low_but_nonzero(len: usize) -> Vec<u32> {
    let mut v = vec![0; len.max(1)];
    if let Some(last) = v.last_mut() {
        *last = 1;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Report;
    use chrono::{Duration, TimeZone};

    fn me() -> MachineId {
        MachineId::new(["Linux", "22.04", "x86_64", "5.15", "me"])
    }

    fn config() -> RatingConfig {
        RatingConfig {
            machine: me(),
            machine_match: Some(5),
            base: Some("9.3".into()),
            open_statuses: ["needs_review", "positive_review"].iter().map(|s| s.to_string()).collect(),
            skip_milestones: ["sage-wishlist"].iter().map(|s| s.to_string()).collect(),
            trusted_authors: ["Jane Doe", "jdoe"].iter().map(|s| s.to_string()).collect(),
            bonus: BonusTable::defaults(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn ticket(id: u64) -> Ticket {
        let mut t = Ticket::new(id);
        t.status = "needs_review".into();
        t.milestone = "sage-9.4".into();
        t.priority = "major".into();
        t.git_commit = Some("c1".into());
        t.authors = vec!["jdoe".into()];
        t.authors_fullnames = vec!["Jane Doe".into()];
        t
    }

    fn report(status: Status, machine: MachineId) -> Report {
        Report::new(status, machine, "9.3", "2024-05-31 00:00:00").with_commit("c1")
    }

    fn up_to_date(_: &str) -> Option<u64> {
        Some(0)
    }

    fn eval(t: &Ticket, distance: &dyn CommitDistance) -> Result<Rating, Exclusion> {
        let cfg = config();
        RatingEngine::new(&cfg, distance).evaluate(t, &mut SkipList::new(), now())
    }

    #[test]
    fn baseline_bypasses_every_gate() {
        let t = Ticket::new(0);
        assert_eq!(eval(&t, &up_to_date), Ok(Rating::baseline()));
        assert!(Rating::baseline() > eval(&ticket(1), &up_to_date).unwrap());
    }

    #[test]
    fn gates_fire_in_order() {
        let mut t = ticket(5);
        t.git_commit = None;
        t.status = "closed".into();
        assert_eq!(eval(&t, &up_to_date), Err(Exclusion::NoCommit));

        let mut t = ticket(5);
        t.status = "closed".into();
        t.milestone = "sage-wishlist".into();
        assert_eq!(eval(&t, &up_to_date), Err(Exclusion::NotOpen("closed".into())));

        let mut t = ticket(5);
        t.milestone = "sage-wishlist".into();
        assert_eq!(eval(&t, &up_to_date), Err(Exclusion::Milestone("sage-wishlist".into())));

        let mut t = ticket(5);
        t.authors.clear();
        t.authors_fullnames.clear();
        assert_eq!(eval(&t, &up_to_date), Err(Exclusion::NoAuthors));
    }

    #[test]
    fn untrusted_author_is_a_veto() {
        let mut t = ticket(5);
        t.authors_fullnames.push("Mallory".into());
        let mut cfg = config();
        cfg.bonus.set("Mallory", 1_000_000);
        let result = RatingEngine::new(&cfg, &up_to_date).evaluate(&t, &mut SkipList::new(), now());
        assert_eq!(result, Err(Exclusion::UntrustedAuthor("Mallory".into())));
    }

    #[test]
    fn trusted_full_name_does_not_cover_untrusted_branch_owner() {
        let mut t = ticket(5);
        t.authors = vec!["mallory".into()];
        t.authors_fullnames = vec!["Jane Doe".into()];
        assert_eq!(eval(&t, &up_to_date), Err(Exclusion::UntrustedAuthor("mallory".into())));
        assert!(
            RatingEngine::new(&config(), &up_to_date)
                .rate(&t, &mut SkipList::new(), now())
                .is_none()
        );
    }

    #[test]
    fn short_ids_alone_are_vetted() {
        let mut t = ticket(5);
        t.authors_fullnames.clear();
        assert!(eval(&t, &up_to_date).is_ok());
        t.authors.push("mallory".into());
        assert_eq!(eval(&t, &up_to_date), Err(Exclusion::UntrustedAuthor("mallory".into())));
    }

    #[test]
    fn each_repeated_report_is_charged() {
        let mut t = ticket(5);
        let other = MachineId::new(["Darwin", "14", "arm64", "23", "mac"]);
        t.reports = vec![
            report(Status::TestsFailed, other.clone()),
            report(Status::TestsPassed, other.clone()),
            report(Status::TestsPassed, other),
        ];
        let rating = eval(&t, &up_to_date).unwrap();
        assert_eq!(rating.bonus, 1010 + 3 * (20 - 40));
    }

    #[test]
    fn cooldown_excludes_until_deadline() {
        let cfg = config();
        let engine = RatingEngine::new(&cfg, &up_to_date);
        let mut skip = SkipList::new();
        skip.skip_for(5, Duration::hours(1), now());

        assert!(matches!(engine.evaluate(&ticket(5), &mut skip, now()), Err(Exclusion::Cooldown(_))));
        assert!(engine.rate(&ticket(5), &mut skip, now() + Duration::hours(2)).is_some());
        assert!(skip.is_empty());
    }

    #[test]
    fn metadata_weights_accumulate() {
        let mut cfg = config();
        cfg.bonus = BonusTable::new(HashMap::new());
        cfg.bonus.set("Jane Doe", 3);
        cfg.bonus.set("jdoe", 5);
        cfg.bonus.set("alice", 7);
        cfg.bonus.set("algebra", 11);
        cfg.bonus.set("needs_review", 13);
        cfg.bonus.set("major", 17);
        cfg.bonus.set("5", 19);

        let mut t = ticket(5);
        t.participants = vec!["alice".into()];
        t.component = "algebra".into();

        let rating = RatingEngine::new(&cfg, &up_to_date)
            .evaluate(&t, &mut SkipList::new(), now())
            .unwrap();
        assert_eq!(rating.bonus, 2 * 3 + 2 * 5 + 7 + 11 + 13 + 17 + 19);
        assert_eq!(rating.uniqueness, vec![FULLY_DIFFERENT]);
        assert_eq!(rating.neg_id, -5);
    }

    #[test]
    fn identical_machine_with_fresh_base_is_covered() {
        let mut t = ticket(5);
        t.reports = vec![report(Status::TestsPassed, me()).with_git_base("b1")];
        assert_eq!(eval(&t, &up_to_date), Err(Exclusion::AlreadyCovered));
    }

    #[test]
    fn identical_machine_without_recorded_base_is_covered() {
        let mut t = ticket(5);
        t.reports = vec![report(Status::TestsFailed, me())];
        assert_eq!(eval(&t, &up_to_date), Err(Exclusion::AlreadyCovered));
    }

    #[test]
    fn retry_flag_skips_duplicate_suppression() {
        let mut t = ticket(5);
        t.retry = true;
        t.reports = vec![report(Status::TestsPassed, me()).with_git_base("b1")];
        let rating = eval(&t, &up_to_date).unwrap();
        assert_eq!(rating.uniqueness, vec![FULLY_DIFFERENT]);
    }

    #[test]
    fn unreachable_base_keeps_ticket_eligible() {
        let mut t = ticket(5);
        t.reports = vec![report(Status::ApplyFailed, me()).with_git_base("mystery")];
        let unknown = |_: &str| -> Option<u64> { None };
        let rating = eval(&t, &unknown).unwrap();
        assert_eq!(rating.uniqueness, vec![0, 0, 0, 0, 1]);

        let base = 1000 + 10; // needs_review + major
        // behind counted as 1, no applies bonus for ApplyFailed, minus unique.
        assert_eq!(rating.bonus, base - 1 - 40);
    }

    #[test]
    fn stale_report_is_penalized_per_commit() {
        let mut t = ticket(5);
        let other = MachineId::new(["Linux", "22.04", "x86_64", "5.15", "other"]);
        t.reports = vec![report(Status::TestsPassed, other).with_git_base("old")];
        let behind = |_: &str| -> Option<u64> { Some(12) };
        let rating = eval(&t, &behind).unwrap();
        assert_eq!(rating.uniqueness, vec![0, 0, 0, 0, 1]);
        assert_eq!(rating.bonus, 1010 - 12 + 20 - 40);
    }

    #[test]
    fn best_coverage_is_the_closest_machine() {
        let mut t = ticket(5);
        t.reports = vec![
            report(Status::TestsPassed, MachineId::new(["Darwin", "14", "arm64", "23", "mac"])),
            report(Status::TestsPassed, MachineId::new(["Linux", "22.04", "x86_64", "6.1", "box"])),
        ];
        let rating = eval(&t, &up_to_date).unwrap();
        assert_eq!(rating.uniqueness, vec![0, 0, 0, 1, 1]);
        assert_eq!(rating.bonus, 1010 + 2 * (20 - 40));
    }

    #[test]
    fn reports_on_older_bases_do_not_count() {
        let mut t = ticket(5);
        let mut old = report(Status::TestsPassed, me());
        old.base = "9.2".into();
        t.reports = vec![old];
        let rating = eval(&t, &up_to_date).unwrap();
        assert_eq!(rating.uniqueness, vec![FULLY_DIFFERENT]);
    }

    #[test]
    fn untested_ticket_outranks_tested_one() {
        let fresh = eval(&ticket(7), &up_to_date).unwrap();
        let mut tested = ticket(3);
        tested.reports = vec![report(
            Status::TestsPassed,
            MachineId::new(["Linux", "22.04", "x86_64", "5.15", "twin"]),
        )];
        let tested = eval(&tested, &up_to_date).unwrap();
        assert!(fresh > tested);
    }

    #[test]
    fn user_bonus_overrides_defaults() {
        let table = BonusTable::with_defaults(HashMap::from([("unique".to_string(), 5)]));
        assert_eq!(table.weight("unique"), 5);
        assert_eq!(table.weight("needs_review"), 1000);
        assert_eq!(table.weight("nobody"), 0);
    }
}
