//! Ticket testers.
//!
//! The worker does not know how to build or test anything; it hands the
//! ticket to a [`TicketTester`] and gets back one status from the closed set
//! plus a log.

use std::path::PathBuf;
use std::process::Command;

use patchfleet_common::{Status, Ticket};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub status: Status,
    pub log: String,
}

#[derive(Debug, Error)]
pub enum TesterError {
    #[error("failed to start tester: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("tester exited abnormally ({})", describe_exit(.code))]
    Crashed { code: Option<i32>, log: String },

    #[error("no test command configured")]
    NotConfigured,
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "killed by signal".to_string(),
    }
}

pub trait TicketTester {
    fn test(&self, ticket: &Ticket, base: &str) -> Result<TestOutcome, TesterError>;
}

/// Exit code of a test command → reported status.
pub fn status_for_exit(code: i32) -> Option<Status> {
    match code {
        0 => Some(Status::TestsPassed),
        1 => Some(Status::TestsFailed),
        2 => Some(Status::ApplyFailed),
        3 => Some(Status::BuildFailed),
        4 => Some(Status::PluginFailed),
        5 => Some(Status::TestsPassedOnRetry),
        _ => None,
    }
}

/// Runs a shell command per ticket.
///
/// The command sees `TICKET_ID`, `GIT_COMMIT` and `BASE` in its environment
/// and reports its verdict through the exit code.
pub struct CommandTester {
    command: String,
    workdir: Option<PathBuf>,
}

impl CommandTester {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, dir: Option<PathBuf>) -> Self {
        self.workdir = dir;
        self
    }
}

impl TicketTester for CommandTester {
    fn test(&self, ticket: &Ticket, base: &str) -> Result<TestOutcome, TesterError> {
        if self.command.trim().is_empty() {
            return Err(TesterError::NotConfigured);
        }
        info!("#{}: running test command", ticket.id);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .env("TICKET_ID", ticket.id.to_string())
            .env("GIT_COMMIT", ticket.git_commit.as_deref().unwrap_or_default())
            .env("BASE", base);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let output = cmd.output()?;
        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        let code = output.status.code();
        debug!("#{}: test command exited with {:?}", ticket.id, code);
        match code.and_then(status_for_exit) {
            Some(status) => Ok(TestOutcome { status, log }),
            None => Err(TesterError::Crashed { code, log }),
        }
    }
}
