//! Worker identity vectors and coarse-to-fine similarity.
//!
//! A machine identity is ordered from most general to most specific
//! (OS family, OS version, architecture, kernel release, hostname). Two
//! identities are compared component-wise; the resulting difference vector
//! orders "how different" a prior report's machine is from ours, so a
//! report from a twin machine suppresses re-testing while one from a
//! different OS family does not.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Command;

/// Ordered identity vector of a worker machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(pub Vec<String>);

impl MachineId {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The most specific component, conventionally the hostname.
    pub fn hostname(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Parse the `a:b:c` form used in query strings.
    pub fn from_colon_separated(s: &str) -> Self {
        Self::new(s.split(':'))
    }

    /// Detect the identity of the local machine.
    ///
    /// Components that cannot be probed are filled with `"unknown"` so the
    /// vector always has five entries.
    pub fn detect() -> Self {
        let family = std::env::consts::OS.to_string();
        let version = os_version().unwrap_or_else(|| "unknown".to_string());
        let arch = std::env::consts::ARCH.to_string();
        let kernel = command_output("uname", &["-r"]).unwrap_or_else(|| "unknown".to_string());
        let host = command_output("hostname", &[])
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self(vec![family, version, arch, kernel, host])
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(":"))
    }
}

fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn os_version() -> Option<String> {
    let release = std::fs::read_to_string("/etc/os-release").ok()?;
    release.lines().find_map(|line| {
        line.strip_prefix("VERSION_ID=")
            .map(|v| v.trim_matches('"').to_string())
    })
}

/// Component-wise difference between two identities.
///
/// Both vectors are truncated to `prefix_len` components (`None` or `0`
/// compares the full length). The result holds `1` where the truncated
/// vectors differ and `0` where they agree, plus one trailing `1` when the
/// untruncated vectors have different lengths.
pub fn compare(a: &MachineId, b: &MachineId, prefix_len: Option<usize>) -> Vec<u32> {
    let limit = match prefix_len {
        Some(n) if n > 0 => n,
        _ => usize::MAX,
    };
    let mut diff: Vec<u32> = a
        .0
        .iter()
        .zip(b.0.iter())
        .take(limit)
        .map(|(x, y)| u32::from(x != y))
        .collect();
    if a.len() != b.len() {
        diff.push(1);
    }
    diff
}

/// Whether a difference vector records a perfect match.
pub fn is_all_match(diff: &[u32]) -> bool {
    diff.iter().all(|d| *d == 0)
}
