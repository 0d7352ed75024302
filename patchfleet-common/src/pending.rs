//! Pending-report leases.
//!
//! A worker posts `Pending` reports while it tests a ticket. Each phase
//! appends a fresh placeholder; the final outcome retires them. Placeholders
//! that outlive the lease timeout are presumed abandoned (crashed worker,
//! lost connectivity) and evicted by whoever reads the ticket next. There is
//! no renewal: a test running past the timeout may lose its own marker.

use crate::machine::MachineId;
use crate::types::{Report, Ticket};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

/// Default lease duration of a `Pending` report.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::hours(6);

/// Lease policy for `Pending` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub timeout: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PENDING_TIMEOUT,
        }
    }
}

impl LeasePolicy {
    pub fn from_secs(secs: u64) -> Self {
        let secs = i64::try_from(secs).unwrap_or(i64::MAX);
        Self {
            timeout: Duration::try_seconds(secs).unwrap_or(Duration::MAX),
        }
    }

    /// Whether a `Pending` report's lease has run out at `now`.
    ///
    /// An unparseable timestamp counts as expired so it cannot pin the
    /// ticket forever.
    pub fn is_expired(&self, report: &Report, now: DateTime<Utc>) -> bool {
        match report.parsed_time() {
            Some(t) => now.signed_duration_since(t) > self.timeout,
            None => true,
        }
    }
}

/// Remove retired or expired `Pending` reports from `ticket`.
///
/// A placeholder is retired when `completing_machine` equals its machine;
/// otherwise it is evicted once its lease has expired. Returns the removed
/// reports in arrival order. Non-pending reports are never touched.
pub fn prune_pending(
    ticket: &mut Ticket,
    completing_machine: Option<&MachineId>,
    policy: &LeasePolicy,
    now: DateTime<Utc>,
) -> Vec<Report> {
    let mut removed = Vec::new();
    let mut kept = Vec::with_capacity(ticket.reports.len());

    for report in ticket.reports.drain(..) {
        if !report.is_pending() {
            kept.push(report);
            continue;
        }
        if completing_machine == Some(&report.machine) {
            debug!(
                "#{}: retiring pending report from {} (outcome arrived)",
                ticket.id, report.machine
            );
            removed.push(report);
        } else if policy.is_expired(&report, now) {
            info!(
                "#{}: pending lease from {} expired (started {})",
                ticket.id, report.machine, report.time
            );
            removed.push(report);
        } else {
            kept.push(report);
        }
    }

    ticket.reports = kept;
    removed
}

/// Key of the log blob attached to a report.
pub fn log_name(ticket_id: u64, report: &Report) -> String {
    format!(
        "/log{}/{}/{}/{}",
        if report.is_pending() { "/Pending" } else { "" },
        ticket_id,
        report.machine.parts().join("/"),
        report.time
    )
}

/// Out-of-band storage of per-report artifacts such as test logs.
pub trait ArtifactStore: Send + Sync {
    /// Delete the artifact stored under `key`. Missing keys are not an error.
    fn release(&self, key: &str) -> std::io::Result<()>;
}

/// Prune the ticket and release the artifacts of every removed report.
///
/// Release failures are logged and never abort the prune, so a broken
/// artifact store cannot leak `Pending` state.
pub fn prune_and_release(
    ticket: &mut Ticket,
    completing_machine: Option<&MachineId>,
    policy: &LeasePolicy,
    now: DateTime<Utc>,
    store: &dyn ArtifactStore,
) -> Vec<Report> {
    let removed = prune_pending(ticket, completing_machine, policy, now);
    for report in &removed {
        let key = log_name(ticket.id, report);
        if let Err(e) = store.release(&key) {
            warn!("#{}: failed to release log {}: {}", ticket.id, key, e);
        }
    }
    removed
}
