//! Error types shared by the patchfleet components.
//!
//! Eligibility failures during rating are never errors; they surface as
//! `None` ratings. The types here cover contract violations (unknown
//! status categories), rejected report submissions and configuration
//! problems.

use std::path::PathBuf;
use thiserror::Error;

/// Closed-set violations in status aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    /// A status string outside the known category set reached the aggregator.
    #[error("unknown status category '{0}'")]
    UnknownStatus(String),

    /// `min_status` was asked for the minimum of nothing.
    #[error("cannot take the minimum of an empty status list")]
    EmptyStatusList,
}

/// Reasons a report submission is rejected before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    /// The payload is not a JSON object.
    #[error("report is not a JSON object")]
    NotAnObject,

    /// A required field is absent.
    #[error("{0} missing in report")]
    MissingField(&'static str),

    /// A field is present but has the wrong shape.
    #[error("invalid value for report field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// The status is outside the closed category set.
    #[error(transparent)]
    UnknownStatus(#[from] StatusError),

    /// The submitting machine is banned from posting.
    #[error("machine {0} is blacklisted")]
    Blacklisted(String),

    /// The machine has not recently tested the baseline ticket.
    #[error("machine {0} has no recent baseline report")]
    BaselineNotProven(String),
}

impl SubmissionError {
    /// Whether the rejection concerns the machine's standing rather than the payload.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Blacklisted(_) | Self::BaselineNotProven(_))
    }
}

/// Errors loading or validating settings files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The settings are syntactically valid but inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),
}
