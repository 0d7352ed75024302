//! Report aggregation: which reports are current and what they add up to.
//!
//! A report is current when it was produced against the ticket's present
//! state (commit, packages, dependencies), passes the base filter and
//! matches the optional worker filter. Repeated reports from one machine all
//! count, so a newer report never hides an older one. Survivors keep
//! arrival order.
//!
//! [`derive_status`] is a pure function of the ticket and the filters, so
//! dashboards and workers observing the same snapshot always agree.

use crate::machine::MachineId;
use crate::status::Status;
use crate::types::{Report, Ticket};
use crate::version::{comparable_version, latest_version};
use serde::{Deserialize, Serialize};

/// Separator between distinct statuses in a composite status.
pub const COMPOSITE_SEPARATOR: &str = ",";

/// Which baseline versions a status query considers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BaseFilter {
    /// Every base.
    #[default]
    Any,
    /// Exactly this base label.
    Exact(String),
    /// Exactly the greatest base among the ticket's reports.
    Latest,
    /// This base or anything newer.
    AtLeast(String),
}

impl BaseFilter {
    /// Parse the query-string form: absent means any, `latest` means latest.
    pub fn from_query(base: Option<&str>) -> Self {
        match base {
            None | Some("") => Self::Any,
            Some("latest") => Self::Latest,
            Some(label) => Self::Exact(label.to_string()),
        }
    }

    /// Pin `Latest` to a concrete label for this set of reports.
    fn resolve(&self, reports: &[Report]) -> Resolved {
        match self {
            Self::Any => Resolved::Any,
            Self::Exact(label) => Resolved::Exact(label.clone()),
            Self::Latest => match latest_version(reports.iter().map(|r| r.base.as_str())) {
                Some(label) => Resolved::Exact(label.to_string()),
                None => Resolved::Any,
            },
            Self::AtLeast(label) => Resolved::AtLeast(label.clone()),
        }
    }
}

enum Resolved {
    Any,
    Exact(String),
    AtLeast(String),
}

impl Resolved {
    fn accepts(&self, base: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(label) => label == base,
            Self::AtLeast(label) => {
                label == base || comparable_version(label) <= comparable_version(base)
            }
        }
    }
}

/// Derived status of a ticket for a base/worker combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketStatus {
    /// Number of current reports.
    pub count: usize,
    /// Representative status for compact display.
    pub single: Status,
    /// Shared status, or every distinct status joined in report order.
    pub composite: String,
}

impl TicketStatus {
    fn fixed(status: Status) -> Self {
        Self {
            count: 0,
            single: status,
            composite: status.as_str().to_string(),
        }
    }
}

fn matches_ticket_state(ticket: &Ticket, report: &Report) -> bool {
    if ticket.is_baseline() {
        return true;
    }
    ticket.git_commit == report.git_commit
        && ticket.spkgs == report.spkgs
        && ticket.depends_on == report.deps
}

/// Reports relevant for status computation, in arrival order.
pub fn current_reports<'a>(
    ticket: &'a Ticket,
    base: &BaseFilter,
    worker: Option<&MachineId>,
) -> Vec<&'a Report> {
    let resolved = base.resolve(&ticket.reports);

    ticket
        .reports
        .iter()
        .filter(|r| matches_ticket_state(ticket, r))
        .filter(|r| resolved.accepts(&r.base))
        .filter(|r| worker.is_none_or(|w| &r.machine == w))
        .collect()
}

/// Count, representative status and composite status of a ticket.
pub fn derive_status(ticket: &Ticket, base: &BaseFilter, worker: Option<&MachineId>) -> TicketStatus {
    let reports = current_reports(ticket, base, worker);

    if let Some(first) = reports.first() {
        let mut distinct: Vec<Status> = Vec::new();
        for report in &reports {
            if !distinct.contains(&report.status) {
                distinct.push(report.status);
            }
        }
        let single = Status::min_of(distinct.iter().copied()).unwrap_or(first.status);
        let composite = if distinct.len() == 1 {
            single.as_str().to_string()
        } else {
            distinct
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(COMPOSITE_SEPARATOR)
        };
        return TicketStatus {
            count: reports.len(),
            single,
            composite,
        };
    }

    if !ticket.spkgs.is_empty() {
        TicketStatus::fixed(Status::Spkg)
    } else if ticket.testable_commit().is_none() {
        TicketStatus::fixed(Status::NoPatch)
    } else {
        TicketStatus::fixed(Status::New)
    }
}
