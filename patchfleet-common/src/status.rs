//! Result categories and their published total order.
//!
//! The order is used to pick a deterministic representative when workers
//! disagree about a ticket. Dashboards key colors and icons off the exact
//! sequence in [`STATUS_ORDER`], so it is part of the external contract.

use crate::errors::StatusError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of report result categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    New,
    ApplyFailed,
    BuildFailed,
    TestsFailed,
    PluginFailed,
    TestsPassed,
    TestsPassedOnRetry,
    /// In-flight placeholder posted while a worker is still testing.
    Pending,
    PluginOnlyFailed,
    PluginOnly,
    /// Ticket has no testable change.
    NoPatch,
    /// Ticket touches external packages and is never test-derived.
    Spkg,
}

/// The published status sequence, earliest first.
pub const STATUS_ORDER: [Status; 12] = [
    Status::New,
    Status::ApplyFailed,
    Status::BuildFailed,
    Status::TestsFailed,
    Status::PluginFailed,
    Status::TestsPassed,
    Status::TestsPassedOnRetry,
    Status::Pending,
    Status::PluginOnlyFailed,
    Status::PluginOnly,
    Status::NoPatch,
    Status::Spkg,
];

impl Status {
    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::ApplyFailed => "ApplyFailed",
            Self::BuildFailed => "BuildFailed",
            Self::TestsFailed => "TestsFailed",
            Self::PluginFailed => "PluginFailed",
            Self::TestsPassed => "TestsPassed",
            Self::TestsPassedOnRetry => "TestsPassedOnRetry",
            Self::Pending => "Pending",
            Self::PluginOnlyFailed => "PluginOnlyFailed",
            Self::PluginOnly => "PluginOnly",
            Self::NoPatch => "NoPatch",
            Self::Spkg => "Spkg",
        }
    }

    /// Position of this status in [`STATUS_ORDER`].
    pub fn rank(self) -> usize {
        STATUS_ORDER
            .iter()
            .position(|s| *s == self)
            .unwrap_or(STATUS_ORDER.len())
    }

    /// The earliest status in the published order, or `None` for an empty input.
    pub fn min_of<I>(statuses: I) -> Option<Status>
    where
        I: IntoIterator<Item = Status>,
    {
        statuses.into_iter().min_by_key(|s| s.rank())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = StatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STATUS_ORDER
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StatusError::UnknownStatus(s.to_string()))
    }
}

/// Return the element of `statuses` that comes first in [`STATUS_ORDER`].
///
/// Every element is validated, so a single unknown category fails the whole
/// call even when a known one would otherwise win.
pub fn min_status<S: AsRef<str>>(statuses: &[S]) -> Result<Status, StatusError> {
    let parsed = statuses
        .iter()
        .map(|s| s.as_ref().parse::<Status>())
        .collect::<Result<Vec<_>, _>>()?;
    Status::min_of(parsed).ok_or(StatusError::EmptyStatusList)
}
