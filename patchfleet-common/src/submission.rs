//! Validation of incoming report submissions.
//!
//! Validation is complete before the caller mutates anything, so a rejected
//! submission never leaves a partial trace in the store.

use crate::errors::SubmissionError;
use crate::machine::MachineId;
use crate::status::Status;
use crate::types::{BASELINE_TICKET_ID, Report, Ticket};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::str::FromStr;

/// Fields every report must carry.
pub const REQUIRED_FIELDS: [&str; 5] = ["status", "spkgs", "base", "machine", "time"];

/// How long a baseline report keeps proving a machine can test.
pub const DEFAULT_BASELINE_PROOF_WINDOW: Duration = Duration::days(7);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionPolicy {
    /// Hostnames whose reports are refused.
    pub blacklist: HashSet<String>,
    pub baseline_proof_window: Duration,
}

impl Default for SubmissionPolicy {
    fn default() -> Self {
        Self {
            blacklist: HashSet::new(),
            baseline_proof_window: DEFAULT_BASELINE_PROOF_WINDOW,
        }
    }
}

/// Check a raw submission for `ticket_id` and turn it into a [`Report`].
pub fn validate_submission(
    raw: &Value,
    ticket_id: u64,
    baseline: &Ticket,
    policy: &SubmissionPolicy,
    now: DateTime<Utc>,
) -> Result<Report, SubmissionError> {
    let object = raw.as_object().ok_or(SubmissionError::NotAnObject)?;
    for field in REQUIRED_FIELDS {
        if !object.contains_key(field) {
            return Err(SubmissionError::MissingField(field));
        }
    }

    let status = object
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("status", "expected a string"))?;
    Status::from_str(status)?;

    let machine = parse_machine(object.get("machine"))?;

    let report: Report = serde_json::from_value(raw.clone())
        .map_err(|e| invalid("report", e.to_string()))?;

    if let Some(host) = machine.hostname()
        && policy.blacklist.contains(host)
    {
        return Err(SubmissionError::Blacklisted(host.to_string()));
    }

    if ticket_id != BASELINE_TICKET_ID && !has_recent_baseline(baseline, &machine, policy, now) {
        return Err(SubmissionError::BaselineNotProven(machine.to_string()));
    }

    Ok(report)
}

fn parse_machine(value: Option<&Value>) -> Result<MachineId, SubmissionError> {
    let parts = value
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("machine", "expected an array of strings"))?;
    if parts.is_empty() {
        return Err(invalid("machine", "must not be empty"));
    }
    let parts = parts
        .iter()
        .map(|p| p.as_str().map(str::to_string))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| invalid("machine", "expected an array of strings"))?;
    Ok(MachineId(parts))
}

fn has_recent_baseline(
    baseline: &Ticket,
    machine: &MachineId,
    policy: &SubmissionPolicy,
    now: DateTime<Utc>,
) -> bool {
    baseline.reports.iter().any(|r| {
        !r.is_pending()
            && &r.machine == machine
            && r
                .parsed_time()
                .is_some_and(|t| now.signed_duration_since(t) <= policy.baseline_proof_window)
    })
}

fn invalid(field: &'static str, reason: impl Into<String>) -> SubmissionError {
    SubmissionError::InvalidField {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StatusError;
    use crate::types::format_time;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn payload(status: &str, host: &str) -> Value {
        json!({
            "status": status,
            "spkgs": [],
            "base": "9.3",
            "machine": ["Linux", "22.04", "x86_64", "5.15", host],
            "time": format_time(now()),
            "git_commit": "c1",
        })
    }

    fn baseline_with(host: &str, status: Status, age: Duration) -> Ticket {
        let mut t = Ticket::new(0);
        t.reports.push(Report::new(
            status,
            MachineId::new(["Linux", "22.04", "x86_64", "5.15", host]),
            "9.3",
            format_time(now() - age),
        ));
        t
    }

    #[test]
    fn accepts_well_formed_report() {
        let baseline = baseline_with("h1", Status::TestsPassed, Duration::days(1));
        let report =
            validate_submission(&payload("TestsPassed", "h1"), 5, &baseline, &SubmissionPolicy::default(), now())
                .unwrap();
        assert_eq!(report.status, Status::TestsPassed);
        assert_eq!(report.git_commit.as_deref(), Some("c1"));
    }

    #[test]
    fn reports_first_missing_field() {
        let mut raw = payload("TestsPassed", "h1");
        raw.as_object_mut().unwrap().remove("spkgs");
        raw.as_object_mut().unwrap().remove("time");
        let err = validate_submission(&raw, 0, &Ticket::new(0), &SubmissionPolicy::default(), now())
            .unwrap_err();
        assert_eq!(err, SubmissionError::MissingField("spkgs"));
        assert_eq!(err.to_string(), "spkgs missing in report");
    }

    #[test]
    fn rejects_unknown_status() {
        let err = validate_submission(
            &payload("Exploded", "h1"),
            0,
            &Ticket::new(0),
            &SubmissionPolicy::default(),
            now(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            SubmissionError::UnknownStatus(StatusError::UnknownStatus("Exploded".into()))
        );
    }

    #[test]
    fn rejects_bad_machine_shape() {
        let mut raw = payload("TestsPassed", "h1");
        raw["machine"] = json!([]);
        let err = validate_submission(&raw, 0, &Ticket::new(0), &SubmissionPolicy::default(), now())
            .unwrap_err();
        assert!(matches!(err, SubmissionError::InvalidField { field: "machine", .. }));

        raw["machine"] = json!(["Linux", 3]);
        let err = validate_submission(&raw, 0, &Ticket::new(0), &SubmissionPolicy::default(), now())
            .unwrap_err();
        assert!(matches!(err, SubmissionError::InvalidField { field: "machine", .. }));
    }

    #[test]
    fn blacklisted_host_is_forbidden() {
        let policy = SubmissionPolicy {
            blacklist: HashSet::from(["evil".to_string()]),
            ..SubmissionPolicy::default()
        };
        let err = validate_submission(&payload("TestsPassed", "evil"), 0, &Ticket::new(0), &policy, now())
            .unwrap_err();
        assert_eq!(err, SubmissionError::Blacklisted("evil".into()));
        assert!(err.is_forbidden());
    }

    #[test]
    fn baseline_reports_need_no_proof() {
        let result = validate_submission(
            &payload("TestsPassed", "fresh"),
            0,
            &Ticket::new(0),
            &SubmissionPolicy::default(),
            now(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn non_baseline_requires_recent_finished_baseline() {
        let policy = SubmissionPolicy::default();
        let raw = payload("TestsFailed", "h1");

        let none = Ticket::new(0);
        assert!(matches!(
            validate_submission(&raw, 5, &none, &policy, now()),
            Err(SubmissionError::BaselineNotProven(_))
        ));

        let pending_only = baseline_with("h1", Status::Pending, Duration::hours(1));
        assert!(validate_submission(&raw, 5, &pending_only, &policy, now()).is_err());

        let too_old = baseline_with("h1", Status::TestsPassed, Duration::days(8));
        assert!(validate_submission(&raw, 5, &too_old, &policy, now()).is_err());

        let other_machine = baseline_with("h2", Status::TestsPassed, Duration::hours(1));
        assert!(validate_submission(&raw, 5, &other_machine, &policy, now()).is_err());

        let failed_baseline = baseline_with("h1", Status::TestsFailed, Duration::hours(1));
        assert!(validate_submission(&raw, 5, &failed_baseline, &policy, now()).is_ok());
    }
}
