//! Durable per-pipeline orphan sets.
//!
//! The ledger itself is a plain slot: `load` and `store` never merge. The
//! candidate and merge rules live in [`candidates`] and [`merge_orphans`].

use std::collections::HashSet;

use kernelsync_shared::{PipelineKind, Result};
use kernelsync_storage::Storage;

pub struct OrphanLedger<'a> {
    storage: &'a Storage,
}

impl<'a> OrphanLedger<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Orphans recorded for `kind`; empty when nothing was stored yet.
    pub async fn load(&self, kind: PipelineKind) -> Result<Vec<String>> {
        Ok(self
            .storage
            .get_state::<Vec<String>>(kind.ledger_key())
            .await?
            .unwrap_or_default())
    }

    /// Overwrite the orphan set for `kind`.
    pub async fn store(&self, kind: PipelineKind, ids: &[String]) -> Result<()> {
        self.storage.set_state(kind.ledger_key(), ids).await
    }
}

/// Candidate set for a run: carried orphans first, then newly pending ids.
pub fn candidates(carried: &[String], pending: &[String]) -> Vec<String> {
    dedup(carried.iter().chain(pending))
}

/// Orphan set to store after a run.
///
/// Previously recorded ids that were not retried this run are kept, followed by
/// this run's orphans.
pub fn merge_orphans(previous: &[String], attempted: &[String], orphans: &[String]) -> Vec<String> {
    let attempted: HashSet<&str> = attempted.iter().map(String::as_str).collect();
    dedup(
        previous
            .iter()
            .filter(|id| !attempted.contains(id.as_str()))
            .chain(orphans),
    )
}

fn dedup<'s>(ids: impl Iterator<Item = &'s String>) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    for id in ids {
        if seen.insert(id.as_str()) {
            out.push(id.clone());
        }
    }
    out
}
