//! TOML settings for the worker and the daemon.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! usable configuration. CLI flags are applied on top by the binaries.

use crate::errors::ConfigError;
use crate::logging::LogConfig;
use crate::machine::MachineId;
use crate::pending::LeasePolicy;
use crate::rating::{BonusTable, RatingConfig};
use crate::submission::SubmissionPolicy;
use chrono::Duration;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Read and parse a TOML settings file.
fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `~/.config/patchfleet/<file>`, when a config directory exists.
pub fn default_config_path(file: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("patchfleet").join(file))
}

/// Load `path`, or the default location if it exists, or defaults.
fn load_with_fallback<T: DeserializeOwned + Default>(
    path: Option<&Path>,
    default_file: &str,
) -> Result<T, ConfigError> {
    if let Some(path) = path {
        return load_toml(path);
    }
    match default_config_path(default_file) {
        Some(path) if path.exists() => load_toml(&path),
        _ => Ok(T::default()),
    }
}

fn secs(value: u64) -> Duration {
    Duration::try_seconds(i64::try_from(value).unwrap_or(i64::MAX)).unwrap_or(Duration::MAX)
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Base URL of the aggregator daemon.
    #[serde(default = "default_server")]
    pub server: String,
    /// Identity vector; detected at startup when absent.
    #[serde(default)]
    pub machine: Option<Vec<String>>,
    #[serde(default = "default_machine_match")]
    pub machine_match: usize,
    /// User weights, layered over the default bonus table.
    #[serde(default)]
    pub bonus: HashMap<String, i64>,
    #[serde(default = "default_open_statuses")]
    pub open_statuses: Vec<String>,
    #[serde(default = "default_skip_milestones")]
    pub skip_milestones: Vec<String>,
    /// Fetched from the daemon when absent.
    #[serde(default)]
    pub trusted_authors: Option<Vec<String>>,
    /// Baseline version label this worker tests against.
    #[serde(default)]
    pub base: Option<String>,
    /// Local git checkout used for commit distances.
    #[serde(default)]
    pub repo: Option<PathBuf>,
    #[serde(default = "default_base_ref")]
    pub base_ref: String,
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,
    /// Shell command run once per ticket.
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            server: default_server(),
            machine: None,
            machine_match: default_machine_match(),
            bonus: HashMap::new(),
            open_statuses: default_open_statuses(),
            skip_milestones: default_skip_milestones(),
            trusted_authors: None,
            base: None,
            repo: None,
            base_ref: default_base_ref(),
            idle_secs: default_idle_secs(),
            candidate_limit: default_candidate_limit(),
            pending_timeout_secs: default_pending_timeout_secs(),
            test_command: None,
            user: None,
            owner: None,
            log: LogConfig::default(),
        }
    }
}

impl WorkerSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_toml(path)
    }

    /// Load from `path`, `~/.config/patchfleet/worker.toml`, or defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        load_with_fallback(path, "worker.toml")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::Invalid("server must not be empty".into()));
        }
        if let Some(machine) = &self.machine {
            if machine.is_empty() {
                return Err(ConfigError::Invalid("machine must not be empty".into()));
            }
            if self.machine_match > machine.len() {
                return Err(ConfigError::Invalid(format!(
                    "machine_match ({}) exceeds machine length ({})",
                    self.machine_match,
                    machine.len()
                )));
            }
        }
        if self.candidate_limit == 0 {
            return Err(ConfigError::Invalid("candidate_limit must be positive".into()));
        }
        if self.pending_timeout_secs == 0 {
            return Err(ConfigError::Invalid("pending_timeout_secs must be positive".into()));
        }
        if self.open_statuses.is_empty() {
            return Err(ConfigError::Invalid("open_statuses must not be empty".into()));
        }
        Ok(())
    }

    /// Configured identity, or the detected one.
    pub fn machine_id(&self) -> MachineId {
        match &self.machine {
            Some(parts) => MachineId(parts.clone()),
            None => MachineId::detect(),
        }
    }

    pub fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy::from_secs(self.pending_timeout_secs)
    }

    pub fn bonus_table(&self) -> BonusTable {
        BonusTable::with_defaults(self.bonus.clone())
    }

    pub fn rating_config(&self, machine: MachineId, trusted_authors: HashSet<String>) -> RatingConfig {
        RatingConfig {
            machine,
            machine_match: Some(self.machine_match),
            base: self.base.clone(),
            open_statuses: self.open_statuses.iter().cloned().collect(),
            skip_milestones: self.skip_milestones.iter().cloned().collect(),
            trusted_authors,
            bonus: self.bonus_table(),
        }
    }
}

fn default_server() -> String {
    "http://127.0.0.1:8410".to_string()
}

fn default_machine_match() -> usize {
    5
}

fn default_open_statuses() -> Vec<String> {
    ["needs_review", "positive_review", "needs_info", "needs_work"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_skip_milestones() -> Vec<String> {
    [
        "sage-duplicate/invalid/wontfix",
        "sage-feature",
        "sage-pending",
        "sage-wishlist",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_base_ref() -> String {
    "patchbot/base".to_string()
}

fn default_idle_secs() -> u64 {
    300
}

fn default_candidate_limit() -> usize {
    1000
}

fn default_pending_timeout_secs() -> u64 {
    21600
}

// ============================================================================
// Daemon
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Persistence directory; in-memory only when absent.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Hostnames whose reports are refused.
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,
    #[serde(default = "default_baseline_proof_window_secs")]
    pub baseline_proof_window_secs: u64,
    #[serde(default = "default_latest_base_refresh_secs")]
    pub latest_base_refresh_secs: u64,
    #[serde(default)]
    pub trusted_authors: Vec<String>,
    #[serde(default = "default_candidate_limit")]
    pub ticket_limit: usize,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: None,
            blacklist: Vec::new(),
            pending_timeout_secs: default_pending_timeout_secs(),
            baseline_proof_window_secs: default_baseline_proof_window_secs(),
            latest_base_refresh_secs: default_latest_base_refresh_secs(),
            trusted_authors: Vec::new(),
            ticket_limit: default_candidate_limit(),
            log: LogConfig::default(),
        }
    }
}

impl DaemonSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_toml(path)
    }

    /// Load from `path`, `~/.config/patchfleet/daemon.toml`, or defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        load_with_fallback(path, "daemon.toml")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        if self.pending_timeout_secs == 0 {
            return Err(ConfigError::Invalid("pending_timeout_secs must be positive".into()));
        }
        if self.baseline_proof_window_secs == 0 {
            return Err(ConfigError::Invalid(
                "baseline_proof_window_secs must be positive".into(),
            ));
        }
        if self.ticket_limit == 0 {
            return Err(ConfigError::Invalid("ticket_limit must be positive".into()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("listen address '{}': {}", self.listen, e)))
    }

    pub fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy::from_secs(self.pending_timeout_secs)
    }

    pub fn submission_policy(&self) -> SubmissionPolicy {
        SubmissionPolicy {
            blacklist: self.blacklist.iter().cloned().collect(),
            baseline_proof_window: secs(self.baseline_proof_window_secs),
        }
    }

    pub fn latest_base_refresh(&self) -> Duration {
        secs(self.latest_base_refresh_secs)
    }
}

fn default_listen() -> String {
    "127.0.0.1:8410".to_string()
}

fn default_baseline_proof_window_secs() -> u64 {
    604800
}

fn default_latest_base_refresh_secs() -> u64 {
    60
}
