//! In-memory ticket store with optional JSONL persistence.
//!
//! Every mutation appends a full snapshot of the touched ticket; on load the
//! last snapshot per id wins. `compact` rewrites the file with one line per
//! ticket.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use patchfleet_common::{ArtifactStore, BASELINE_TICKET_ID, LeasePolicy, Ticket, prune_and_release};
use tracing::{debug, warn};

/// File name of the ticket log inside the data directory.
pub const TICKETS_FILE: &str = "tickets.jsonl";

pub struct TicketStore {
    tickets: RwLock<BTreeMap<u64, Ticket>>,
    persistence_path: Option<PathBuf>,
}

impl TicketStore {
    /// Empty in-memory store holding only the baseline ticket.
    pub fn new() -> Self {
        let mut tickets = BTreeMap::new();
        tickets.insert(BASELINE_TICKET_ID, Ticket::new(BASELINE_TICKET_ID));
        Self {
            tickets: RwLock::new(tickets),
            persistence_path: None,
        }
    }

    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.persistence_path = Some(path);
        self
    }

    /// Load a store from a JSONL file. Invalid lines are skipped.
    pub fn load_from_file(path: &Path) -> std::io::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut tickets = BTreeMap::new();
        let mut lines = 0usize;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Ticket>(&line) {
                Ok(ticket) => {
                    lines += 1;
                    tickets.insert(ticket.id, ticket);
                }
                Err(e) => warn!("Skipping invalid ticket line: {}", e),
            }
        }
        tickets
            .entry(BASELINE_TICKET_ID)
            .or_insert_with(|| Ticket::new(BASELINE_TICKET_ID));

        debug!(
            "Loaded {} tickets from {:?} ({} snapshots)",
            tickets.len(),
            path,
            lines
        );

        Ok(Self {
            tickets: RwLock::new(tickets),
            persistence_path: Some(path.to_path_buf()),
        })
    }

    pub fn get(&self, id: u64) -> Option<Ticket> {
        let tickets = self.tickets.read().unwrap_or_else(|e| e.into_inner());
        tickets.get(&id).cloned()
    }

    pub fn baseline(&self) -> Ticket {
        self.get(BASELINE_TICKET_ID)
            .unwrap_or_else(|| Ticket::new(BASELINE_TICKET_ID))
    }

    pub fn len(&self) -> usize {
        self.tickets.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tickets whose tracker status equals `status` (all when `None`), by id.
    pub fn list(&self, status: Option<&str>, limit: usize) -> Vec<Ticket> {
        let tickets = self.tickets.read().unwrap_or_else(|e| e.into_inner());
        tickets
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Insert a ticket or refresh its tracker metadata, keeping reports.
    pub fn upsert(&self, ticket: Ticket) -> Ticket {
        let mut tickets = self.tickets.write().unwrap_or_else(|e| e.into_inner());
        let stored = match tickets.get_mut(&ticket.id) {
            Some(existing) => {
                existing.merge_metadata(ticket);
                existing.clone()
            }
            None => {
                tickets.insert(ticket.id, ticket.clone());
                ticket
            }
        };
        self.persist(&stored);
        stored
    }

    /// Apply `f` to ticket `id` and persist the result.
    ///
    /// Returns `None` when the ticket does not exist.
    pub fn update<R>(&self, id: u64, f: impl FnOnce(&mut Ticket) -> R) -> Option<R> {
        let mut tickets = self.tickets.write().unwrap_or_else(|e| e.into_inner());
        let ticket = tickets.get_mut(&id)?;
        let result = f(ticket);
        self.persist(ticket);
        Some(result)
    }

    /// Evict expired `Pending` reports from ticket `id` (or from every
    /// ticket when `id` is `None`). Returns how many reports were removed.
    pub fn prune_expired(
        &self,
        id: Option<u64>,
        policy: &LeasePolicy,
        now: DateTime<Utc>,
        artifacts: &dyn ArtifactStore,
    ) -> usize {
        let mut tickets = self.tickets.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for ticket in tickets.values_mut() {
            if id.is_some_and(|id| id != ticket.id) {
                continue;
            }
            if !ticket.reports.iter().any(|r| r.is_pending()) {
                continue;
            }
            let evicted = prune_and_release(ticket, None, policy, now, artifacts);
            if !evicted.is_empty() {
                removed += evicted.len();
                self.persist(ticket);
            }
        }
        removed
    }

    // Called with the write lock held so snapshots of one ticket land in
    // mutation order.
    fn persist(&self, ticket: &Ticket) {
        let Some(path) = &self.persistence_path else {
            return;
        };
        if let Err(e) = append_snapshot(path, ticket) {
            warn!("Failed to persist ticket #{}: {}", ticket.id, e);
        }
    }

    /// Rewrite the persistence file with one snapshot per ticket.
    pub fn compact(&self) -> std::io::Result<()> {
        let Some(ref path) = self.persistence_path else {
            return Ok(());
        };

        let tickets = self.tickets.read().unwrap_or_else(|e| e.into_inner());
        let temp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&temp_path)?;
            for ticket in tickets.values() {
                writeln!(file, "{}", serde_json::to_string(ticket)?)?;
            }
        }
        std::fs::rename(temp_path, path)?;
        debug!("Compacted ticket file: {:?}", path);
        Ok(())
    }
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new()
    }
}

fn append_snapshot(path: &Path, ticket: &Ticket) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let json = serde_json::to_string(ticket)?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}
