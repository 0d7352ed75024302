//! Patchfleet core library.
//!
//! Shared by the aggregator daemon (`patchfleetd`) and the worker agent
//! (`patchfleet-wkr`): the ticket/report data model, the rating and
//! selection algorithm, report aggregation, pending-report leases,
//! submission validation, settings, and logging setup.

#![forbid(unsafe_code)]

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod errors;
pub mod logging;
pub mod machine;
pub mod pending;
pub mod rating;
pub mod selection;
pub mod status;
pub mod submission;
pub mod types;
pub mod version;

pub use aggregate::{BaseFilter, TicketStatus, current_reports, derive_status};
pub use cache::TimedCache;
pub use config::{DaemonSettings, WorkerSettings};
pub use errors::{ConfigError, StatusError, SubmissionError};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use machine::{MachineId, compare, is_all_match};
pub use pending::{ArtifactStore, LeasePolicy, log_name, prune_and_release, prune_pending};
pub use rating::{BonusTable, CommitDistance, Exclusion, Rating, RatingConfig, RatingEngine};
pub use selection::{Selection, SkipList, SkipReason, TicketSelector};
pub use status::{STATUS_ORDER, Status, min_status};
pub use submission::{SubmissionPolicy, validate_submission};
pub use types::{BASELINE_TICKET_ID, PendingPhase, Report, Ticket, format_time, now_str, parse_time};
pub use version::{compare_versions, comparable_version, latest_version};
