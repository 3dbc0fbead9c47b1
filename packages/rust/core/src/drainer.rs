//! Change feed draining: dedup changed containers, fetch each once, merge.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, instrument, warn};

use kernelsync_kernel::KernelClient;
use kernelsync_shared::{
    ChangeEvent, ChangeTarget, ContainerSnapshot, JournalSnapshot, Result,
};

use crate::membership::MembershipIndex;

/// Distinct entities referenced by a batch of change events, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub journals: Vec<String>,
    pub containers: Vec<String>,
    pub documents: Vec<String>,
    pub renditions: Vec<String>,
    /// Number of events reduced into this set.
    pub events: usize,
}

impl ChangeSet {
    pub fn from_events(events: &[ChangeEvent]) -> Self {
        let mut set = ChangeSet {
            events: events.len(),
            ..Default::default()
        };
        let mut seen: HashSet<ChangeTarget> = HashSet::new();

        for event in events {
            let target = event.target();
            if !seen.insert(target.clone()) {
                continue;
            }
            match target {
                ChangeTarget::Journal(id) => set.journals.push(id),
                ChangeTarget::Container(id) => set.containers.push(id),
                ChangeTarget::Document(id) => set.documents.push(id),
                ChangeTarget::Renditions(id) => set.renditions.push(id),
                ChangeTarget::Other => {
                    debug!(reference = %event.container_ref, "ignoring change");
                }
            }
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.journals.is_empty()
            && self.containers.is_empty()
            && self.documents.is_empty()
            && self.renditions.is_empty()
    }
}

/// Result of draining the feed once.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    pub changes: ChangeSet,
    /// Bundle snapshots fetched during the drain, by id.
    pub snapshots: HashMap<String, ContainerSnapshot>,
    /// Journal snapshots fetched during the drain, in feed order.
    pub journals: Vec<JournalSnapshot>,
    /// Bundles that no longer exist upstream (merged as empty).
    pub removed_containers: Vec<String>,
    /// Cursor to persist once the run succeeds.
    pub cursor: Option<String>,
}

/// Reads the change feed and folds changed containers into the membership indexes.
pub struct ChangeFeedDrainer<'a> {
    client: &'a KernelClient,
}

impl<'a> ChangeFeedDrainer<'a> {
    pub fn new(client: &'a KernelClient) -> Self {
        Self { client }
    }

    /// Read every change after `cursor` and merge the affected containers.
    ///
    /// `documents` maps bundles to documents, `issues` maps journals to bundles.
    #[instrument(skip_all, fields(cursor = cursor.unwrap_or("<start>")))]
    pub async fn drain(
        &self,
        cursor: Option<&str>,
        documents: &mut MembershipIndex,
        issues: &mut MembershipIndex,
    ) -> Result<DrainOutcome> {
        let events = self.client.list_changes(cursor).await?;
        let next_cursor = events
            .last()
            .map(|e| e.timestamp.clone())
            .or_else(|| cursor.map(str::to_string));

        let mut outcome = self.apply(&events, documents, issues).await?;
        outcome.cursor = next_cursor;
        Ok(outcome)
    }

    /// Fetch and merge every distinct journal and bundle referenced by `events`.
    pub async fn apply(
        &self,
        events: &[ChangeEvent],
        documents: &mut MembershipIndex,
        issues: &mut MembershipIndex,
    ) -> Result<DrainOutcome> {
        let changes = ChangeSet::from_events(events);
        let mut outcome = DrainOutcome::default();

        for journal_id in &changes.journals {
            match self.client.fetch_journal(journal_id).await {
                Ok(journal) => {
                    issues.merge(journal_id, journal.items.clone());
                    outcome.journals.push(journal);
                }
                Err(e) if e.is_not_found() => {
                    warn!(%journal_id, "journal not found upstream, treating as empty");
                    issues.merge(journal_id, Vec::new());
                }
                Err(e) => return Err(e),
            }
        }

        for container_id in &changes.containers {
            match self.client.fetch_container(container_id).await {
                Ok(snapshot) => {
                    debug!(%container_id, members = snapshot.items.len(), "merging bundle");
                    documents.merge(container_id, snapshot.items.clone());
                    outcome.snapshots.insert(container_id.clone(), snapshot);
                }
                Err(e) if e.is_not_found() => {
                    warn!(%container_id, "bundle not found upstream, treating as empty");
                    documents.merge(container_id, Vec::new());
                    outcome.removed_containers.push(container_id.clone());
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            events = changes.events,
            journals = changes.journals.len(),
            containers = changes.containers.len(),
            documents = changes.documents.len(),
            renditions = changes.renditions.len(),
            removed = outcome.removed_containers.len(),
            "change feed drained"
        );

        outcome.changes = changes;
        Ok(outcome)
    }
}
