//! Commit distances from the local checkout.

use std::path::{Path, PathBuf};
use std::process::Command;

use patchfleet_common::CommitDistance;
use tracing::debug;

pub struct GitDistance {
    repo: PathBuf,
    base_ref: String,
}

impl GitDistance {
    pub fn new(repo: impl Into<PathBuf>, base_ref: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            base_ref: base_ref.into(),
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Commit the base ref currently points at.
    pub fn base_commit(&self) -> Option<String> {
        self.git(&["rev-parse", &self.base_ref])
            .map(|out| out.trim().to_string())
            .filter(|c| !c.is_empty())
    }

    fn git(&self, args: &[&str]) -> Option<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(args)
            .output()
            .ok()?;
        if !output.status.success() {
            debug!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }
        String::from_utf8(output.stdout).ok()
    }
}

impl CommitDistance for GitDistance {
    fn commits_behind(&self, git_base: &str) -> Option<u64> {
        let range = format!("{}..{}", git_base, self.base_ref);
        self.git(&["rev-list", "--count", &range])
            .and_then(|out| parse_count(&out))
    }
}

fn parse_count(out: &str) -> Option<u64> {
    out.trim().parse().ok()
}
