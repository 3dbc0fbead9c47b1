//! One incremental sync run: drain → journals → issues → documents → renditions.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, instrument, warn};

use kernelsync_kernel::KernelClient;
use kernelsync_shared::{
    PipelineKind, RecordKind, Result, RunId, SyncConfig, SyncError, SyncStage,
};
use kernelsync_storage::Storage;

use crate::drainer::{ChangeFeedDrainer, DrainOutcome};
use crate::ledger::{self, OrphanLedger};
use crate::membership::MembershipIndex;
use crate::pipeline::ProgressReporter;
use crate::records::{RecordBuilder, RecordInput};
use crate::registration::{RegistrationContext, RegistrationPipeline};
use crate::resolver::RelationResolver;

/// Run-state slot holding the change feed cursor.
pub const CURSOR_KEY: &str = "sync_cursor";
/// Run-state slot holding bundle → documents membership.
pub const DOCUMENTS_KEY: &str = "known_documents";
/// Run-state slot holding journal → bundles membership.
pub const ISSUES_KEY: &str = "known_issues";

/// State carried between runs.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub cursor: Option<String>,
    pub documents: MembershipIndex,
    pub issues: MembershipIndex,
}

impl SyncState {
    pub async fn load(storage: &Storage) -> Result<Self> {
        Ok(Self {
            cursor: storage.get_state(CURSOR_KEY).await?,
            documents: storage.get_state(DOCUMENTS_KEY).await?.unwrap_or_default(),
            issues: storage.get_state(ISSUES_KEY).await?.unwrap_or_default(),
        })
    }

    async fn persist_membership(&self, storage: &Storage) -> Result<()> {
        storage.set_state(DOCUMENTS_KEY, &self.documents).await?;
        storage.set_state(ISSUES_KEY, &self.issues).await
    }
}

/// Per-pipeline summary.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub kind: PipelineKind,
    pub candidates: usize,
    pub registered: usize,
    pub skipped: usize,
    /// Orphan set stored for the next run.
    pub orphans: Vec<String>,
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub run_id: RunId,
    pub events: usize,
    pub cursor: Option<String>,
    pub journals_registered: usize,
    pub pipelines: Vec<PipelineReport>,
    /// Registered documents per issue.
    pub documents_by_issue: BTreeMap<String, usize>,
    pub elapsed_ms: u64,
}

impl SyncOutcome {
    pub fn pipeline(&self, kind: PipelineKind) -> Option<&PipelineReport> {
        self.pipelines.iter().find(|p| p.kind == kind)
    }
}

/// Run one sync against `client`, writing into `storage`.
///
/// The cursor only moves once every stage succeeded. A failure is reported as
/// [`SyncError::Stage`] and the run is recorded as failed.
#[instrument(skip_all, fields(kernel = %client.base_url()))]
pub async fn run_sync(
    config: &SyncConfig,
    storage: &Storage,
    client: &KernelClient,
    progress: &dyn ProgressReporter,
) -> Result<SyncOutcome> {
    let run_id = RunId::new();
    let run_key = run_id.to_string();
    storage.insert_sync_run(&run_key).await?;

    match execute(config, storage, client, progress, run_id).await {
        Ok(outcome) => {
            let stats = serde_json::to_string(&outcome)
                .map_err(|e| SyncError::Storage(format!("failed to encode run stats: {e}")))?;
            storage
                .finish_sync_run(&run_key, "succeeded", Some(&stats))
                .await?;
            progress.done(&outcome);
            Ok(outcome)
        }
        Err(e) => {
            warn!(run_id = %run_key, error = %e, "sync run failed");
            if let Err(record_err) = storage.finish_sync_run(&run_key, "failed", None).await {
                warn!(run_id = %run_key, error = %record_err, "could not record failed run");
            }
            Err(e)
        }
    }
}

async fn execute(
    config: &SyncConfig,
    storage: &Storage,
    client: &KernelClient,
    progress: &dyn ProgressReporter,
    run_id: RunId,
) -> Result<SyncOutcome> {
    let start = Instant::now();
    let mut state = SyncState::load(storage)
        .await
        .map_err(|e| e.in_stage(SyncStage::Drain))?;

    // 1. Drain
    progress.phase("Reading change feed");
    let drained = ChangeFeedDrainer::new(client)
        .drain(state.cursor.as_deref(), &mut state.documents, &mut state.issues)
        .await
        .map_err(|e| e.in_stage(SyncStage::Drain))?;

    // 2. Journals
    progress.phase("Registering journals");
    let journals_registered = register_journals(storage, &drained)
        .await
        .map_err(|e| e.in_stage(SyncStage::Journals))?;
    state
        .persist_membership(storage)
        .await
        .map_err(|e| e.in_stage(SyncStage::Journals))?;

    // 3. Issues, documents, renditions
    let ctx = RegistrationContext {
        client,
        storage,
        documents: &state.documents,
        issues: &state.issues,
        snapshots: &drained.snapshots,
        invalid_order: config.invalid_order,
    };
    let ledger = OrphanLedger::new(storage);
    let mut pipelines = Vec::with_capacity(PipelineKind::ALL.len());
    let mut documents_registered: Vec<String> = Vec::new();

    for kind in PipelineKind::ALL {
        progress.phase(&format!("Registering {kind}"));
        let pending = pending_for(kind, &drained);
        let report = run_pipeline(&ctx, &ledger, kind, &pending, progress)
            .await
            .map_err(|e| e.in_stage(kind.stage()))?;
        if kind == PipelineKind::Documents {
            documents_registered = report.1;
        }
        pipelines.push(report.0);
    }

    // 4. Finalize
    progress.phase("Saving cursor");
    if let Some(cursor) = &drained.cursor {
        storage
            .set_state(CURSOR_KEY, cursor)
            .await
            .map_err(|e| e.in_stage(SyncStage::Finalize))?;
    }

    let documents_by_issue = RelationResolver::new(&state.documents)
        .group_by_container(documents_registered.iter().map(String::as_str))
        .into_iter()
        .map(|(issue, docs)| (issue, docs.len()))
        .collect();

    let outcome = SyncOutcome {
        run_id,
        events: drained.changes.events,
        cursor: drained.cursor.clone(),
        journals_registered,
        pipelines,
        documents_by_issue,
        elapsed_ms: start.elapsed().as_millis() as u64,
    };

    info!(
        events = outcome.events,
        journals = outcome.journals_registered,
        elapsed_ms = outcome.elapsed_ms,
        "sync run complete"
    );
    Ok(outcome)
}

/// Newly pending ids for a pipeline, from this run's change set.
fn pending_for(kind: PipelineKind, drained: &DrainOutcome) -> Vec<String> {
    match kind {
        PipelineKind::Issues => {
            let removed: HashSet<&str> =
                drained.removed_containers.iter().map(String::as_str).collect();
            drained
                .changes
                .containers
                .iter()
                .filter(|id| !removed.contains(id.as_str()))
                .cloned()
                .collect()
        }
        PipelineKind::Documents => drained.changes.documents.clone(),
        PipelineKind::Renditions => drained.changes.renditions.clone(),
    }
}

/// Register carried orphans plus pending ids, then rewrite the ledger.
async fn run_pipeline(
    ctx: &RegistrationContext<'_>,
    ledger: &OrphanLedger<'_>,
    kind: PipelineKind,
    pending: &[String],
    progress: &dyn ProgressReporter,
) -> Result<(PipelineReport, Vec<String>)> {
    let previous = ledger.load(kind).await?;
    let candidates = ledger::candidates(&previous, pending);

    let outcome = RegistrationPipeline::new(kind, ctx)
        .register(&candidates, progress)
        .await?;

    let orphans = ledger::merge_orphans(&previous, &candidates, &outcome.orphans);
    ledger.store(kind, &orphans).await?;

    Ok((
        PipelineReport {
            kind,
            candidates: candidates.len(),
            registered: outcome.registered.len(),
            skipped: outcome.skipped.len(),
            orphans,
        },
        outcome.registered,
    ))
}

async fn register_journals(storage: &Storage, drained: &DrainOutcome) -> Result<usize> {
    let builder = RecordBuilder::new(storage);
    for snapshot in &drained.journals {
        let record = builder.build(RecordInput::Journal(snapshot.clone())).await?;
        storage.save(&record).await?;
    }
    Ok(drained.journals.len())
}

/// Counts shown by `kernelsync state`.
#[derive(Debug, Clone, Serialize)]
pub struct StateSummary {
    pub cursor: Option<String>,
    pub known_issues: usize,
    pub known_documents: usize,
    pub orphans: BTreeMap<String, usize>,
    pub records: BTreeMap<String, u64>,
}

/// Snapshot of the persisted run state and target store sizes.
pub async fn summarize_state(storage: &Storage) -> Result<StateSummary> {
    let state = SyncState::load(storage).await?;
    let ledger = OrphanLedger::new(storage);

    let mut orphans = BTreeMap::new();
    for kind in PipelineKind::ALL {
        orphans.insert(kind.to_string(), ledger.load(kind).await?.len());
    }

    let mut records = BTreeMap::new();
    for kind in [RecordKind::Journal, RecordKind::Issue, RecordKind::Article] {
        records.insert(kind.to_string(), storage.count_records(kind).await?);
    }

    Ok(StateSummary {
        cursor: state.cursor,
        known_issues: state.documents.container_count(),
        known_documents: state.documents.member_count(),
        orphans,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use kernelsync_shared::{CatalogRecord, InvalidOrderPolicy};
    use serde_json::json;
    use std::time::Duration;
    use url::Url;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const JOURNAL: &str = "0001-3714";
    const ISSUE: &str = "0001-3714-1999-v60-n2";

    async fn test_storage() -> Storage {
        let path = std::env::temp_dir().join(format!("ks_test_{}.db", uuid::Uuid::now_v7()));
        Storage::open(&path).await.unwrap()
    }

    fn config_for(server: &MockServer) -> SyncConfig {
        SyncConfig {
            kernel_url: Url::parse(&server.uri()).unwrap(),
            timeout: Duration::from_secs(5),
            page_size: 100,
            invalid_order: InvalidOrderPolicy::Skip,
        }
    }

    fn change(id: &str, ts: &str) -> serde_json::Value {
        json!({"id": id, "timestamp": ts, "change_id": format!("{id}@{ts}")})
    }

    async fn mount_documents(server: &MockServer) {
        for (id, order) in [("A", "00502"), ("B", "00501")] {
            Mock::given(method("GET"))
                .and(path(format!("/documents/{id}/front")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "title": format!("Document {id}"),
                    "pid_v2": format!("S0001-3714199900020{order}")
                })))
                .mount(server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path(format!("/bundles/{ISSUE}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": ISSUE,
                "items": [{"id": "A", "order": "00502"}, {"id": "B", "order": "00501"}],
                "metadata": {"publication_year": "1999", "volume": "60", "number": "2"}
            })))
            // Once per drain in run one, once for the issue retry in run two.
            .expect(2)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn documents_wait_for_their_journal_then_register() {
        let server = MockServer::start().await;
        mount_documents(&server).await;

        // First run: the bundle and its documents change, the journal does not.
        Mock::given(method("GET"))
            .and(path("/changes"))
            .and(query_param("limit", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [
                change(&format!("/bundles/{ISSUE}"), "2020-11-05T16:54:10Z"),
                change("/documents/A", "2020-11-05T16:54:11Z"),
                change("/documents/B", "2020-11-05T16:54:12Z"),
                change(&format!("/bundles/{ISSUE}"), "2020-11-05T16:54:13Z"),
            ]})))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let config = config_for(&server);
        let client = KernelClient::new(&config).unwrap();
        let storage = test_storage().await;

        let first = run_sync(&config, &storage, &client, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(first.events, 4);
        assert_eq!(first.cursor.as_deref(), Some("2020-11-05T16:54:13Z"));
        assert_eq!(
            first.pipeline(PipelineKind::Issues).unwrap().orphans,
            vec![ISSUE.to_string()]
        );
        assert_eq!(
            first.pipeline(PipelineKind::Documents).unwrap().orphans,
            vec!["A".to_string(), "B".to_string()]
        );

        // Second run: the journal shows up listing the bundle.
        Mock::given(method("GET"))
            .and(path("/changes"))
            .and(query_param("since", "2020-11-05T16:54:13Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [
                change(&format!("/journals/{JOURNAL}"), "2020-11-05T16:55:00Z"),
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/journals/{JOURNAL}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": JOURNAL,
                "items": [{"id": ISSUE, "order": "1999002"}],
                "metadata": {"title": "Arquivos", "acronym": "aa"}
            })))
            .mount(&server)
            .await;

        let second = run_sync(&config, &storage, &client, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(second.journals_registered, 1);
        for kind in PipelineKind::ALL {
            assert!(second.pipeline(kind).unwrap().orphans.is_empty(), "{kind}");
        }
        assert_eq!(second.documents_by_issue.get(ISSUE), Some(&2));

        let Some(CatalogRecord::Article(b)) =
            storage.find_record(RecordKind::Article, "B").await.unwrap()
        else {
            panic!("B should be registered");
        };
        assert_eq!(b.order, 501);
        assert_eq!(b.issue_id, ISSUE);

        let summary = summarize_state(&storage).await.unwrap();
        assert_eq!(summary.cursor.as_deref(), Some("2020-11-05T16:55:00Z"));
        assert_eq!(summary.records["article"], 2);
        assert_eq!(summary.orphans["documents"], 0);

        let run = storage.last_sync_run().await.unwrap().unwrap();
        assert_eq!(run.status, "succeeded");
    }

    #[tokio::test]
    async fn failed_run_keeps_cursor_and_ledger() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/changes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [
                change("/bundles/B1", "2020-11-05T16:54:10Z"),
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bundles/B1"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let config = config_for(&server);
        let client = KernelClient::new(&config).unwrap();
        let storage = test_storage().await;
        storage.set_state(CURSOR_KEY, "2020-01-01T00:00:00Z").await.unwrap();
        OrphanLedger::new(&storage)
            .store(PipelineKind::Documents, &["X".to_string()])
            .await
            .unwrap();

        let err = run_sync(&config, &storage, &client, &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Stage { stage: SyncStage::Drain, .. }
        ));

        let cursor: Option<String> = storage.get_state(CURSOR_KEY).await.unwrap();
        assert_eq!(cursor.as_deref(), Some("2020-01-01T00:00:00Z"));
        assert_eq!(
            OrphanLedger::new(&storage).load(PipelineKind::Documents).await.unwrap(),
            vec!["X".to_string()]
        );
        let run = storage.last_sync_run().await.unwrap().unwrap();
        assert_eq!(run.status, "failed");
    }

    #[tokio::test]
    async fn rendition_orphan_waits_for_article() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/changes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .mount(&server)
            .await;

        let config = config_for(&server);
        let client = KernelClient::new(&config).unwrap();
        let storage = test_storage().await;
        let ledger = OrphanLedger::new(&storage);
        ledger
            .store(PipelineKind::Renditions, &["R1".to_string()])
            .await
            .unwrap();

        // R1's article is still missing, so it stays an orphan.
        Mock::given(method("GET"))
            .and(path("/documents/R1/renditions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let outcome = run_sync(&config, &storage, &client, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(outcome.events, 0);
        assert!(outcome.cursor.is_none());
        assert_eq!(
            ledger.load(PipelineKind::Renditions).await.unwrap(),
            vec!["R1".to_string()]
        );
    }
}
