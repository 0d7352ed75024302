//! Ticket and report records exchanged between workers and the aggregator.

use crate::machine::MachineId;
use crate::status::Status;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Id of the synthetic baseline ticket (unmodified trunk).
pub const BASELINE_TICKET_ID: u64 = 0;

/// Wire format of report and activity timestamps (UTC).
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format a timestamp in the wire format.
pub fn format_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Current time in the wire format.
pub fn now_str() -> String {
    format_time(Utc::now())
}

/// Parse a wire timestamp. Only the first 19 characters are considered, so
/// fractional seconds or zone suffixes are ignored.
pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    let head = s.get(..19).unwrap_or(s);
    NaiveDateTime::parse_from_str(head, TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Sub-phase of an in-flight test, carried on `Pending` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingPhase {
    Started,
    Applied,
    Built,
    Tested,
    PluginsPassed,
    PluginsFailed,
}

/// One worker's outcome for one ticket at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub status: Status,
    pub machine: MachineId,
    /// Baseline version label the change was tested against.
    pub base: String,
    /// Wire timestamp (see [`TIME_FORMAT`]).
    pub time: String,
    /// Snapshot actually tested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    /// Commit of the baseline actually tested, used for staleness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_base: Option<String>,
    #[serde(default)]
    pub spkgs: Vec<String>,
    /// Ticket dependencies at test time.
    #[serde(default)]
    pub deps: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_status: Option<PendingPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Contact for the machine that produced the report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl Report {
    /// A report with only the required fields set.
    pub fn new(
        status: Status,
        machine: MachineId,
        base: impl Into<String>,
        time: impl Into<String>,
    ) -> Self {
        Self {
            status,
            machine,
            base: base.into(),
            time: time.into(),
            git_commit: None,
            git_base: None,
            spkgs: Vec::new(),
            deps: Vec::new(),
            pending_status: None,
            user: None,
            owner: None,
        }
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.git_commit = Some(commit.into());
        self
    }

    pub fn with_git_base(mut self, commit: impl Into<String>) -> Self {
        self.git_base = Some(commit.into());
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == Status::Pending
    }

    pub fn parsed_time(&self) -> Option<DateTime<Utc>> {
        parse_time(&self.time)
    }
}

/// A unit of proposed work pulled from the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    /// Tracker lifecycle state such as `needs_review` or `closed`.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub milestone: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub authors_fullnames: Vec<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default)]
    pub spkgs: Vec<String>,
    /// Forced retry: bypasses duplicate-coverage suppression once.
    #[serde(default)]
    pub retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    /// Reports in arrival order.
    #[serde(default)]
    pub reports: Vec<Report>,
}

impl Ticket {
    /// A bare ticket with the given id and no metadata.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            title: String::new(),
            status: String::new(),
            milestone: String::new(),
            priority: String::new(),
            component: String::new(),
            authors: Vec::new(),
            authors_fullnames: Vec::new(),
            participants: Vec::new(),
            depends_on: Vec::new(),
            git_commit: None,
            spkgs: Vec::new(),
            retry: false,
            last_activity: None,
            reports: Vec::new(),
        }
    }

    pub fn is_baseline(&self) -> bool {
        self.id == BASELINE_TICKET_ID
    }

    /// The commit under test, treating empty or `unknown` as absent.
    pub fn testable_commit(&self) -> Option<&str> {
        self.git_commit
            .as_deref()
            .filter(|c| !c.is_empty() && *c != "unknown")
    }

    /// Authors as the tracker names them: full names, or short ids when no
    /// full names were supplied.
    pub fn declared_authors(&self) -> &[String] {
        if self.authors_fullnames.is_empty() {
            &self.authors
        } else {
            &self.authors_fullnames
        }
    }

    /// Every identity that must be trusted: full names and short ids
    /// (branch owners), each once.
    pub fn authors_to_vet(&self) -> impl Iterator<Item = &String> {
        let mut seen = HashSet::new();
        self.authors_fullnames
            .iter()
            .chain(self.authors.iter())
            .filter(move |a| seen.insert(a.as_str()))
    }

    /// Replace tracker metadata while keeping the accumulated reports.
    pub fn merge_metadata(&mut self, update: Ticket) {
        let reports = std::mem::take(&mut self.reports);
        let retry = self.retry || update.retry;
        *self = update;
        self.reports = reports;
        self.retry = retry;
    }
}
