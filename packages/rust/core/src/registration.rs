//! Per-kind registration of pending members into the target store.
//!
//! Each candidate is resolved, fetched, built and saved in input order. A
//! candidate whose owner is not in the target store yet becomes an orphan and
//! the run goes on; any other failure stops the pipeline.

use std::collections::HashMap;

use tracing::{debug, info, instrument, warn};

use kernelsync_kernel::KernelClient;
use kernelsync_shared::{
    ContainerSnapshot, InvalidOrderPolicy, PipelineKind, RecordKind, Result, SyncError,
};
use kernelsync_storage::Storage;

use crate::membership::MembershipIndex;
use crate::pipeline::ProgressReporter;
use crate::records::{RecordBuilder, RecordInput};
use crate::resolver::RelationResolver;

/// Collaborators and run state shared by every pipeline kind.
pub struct RegistrationContext<'a> {
    pub client: &'a KernelClient,
    pub storage: &'a Storage,
    /// Bundle → documents.
    pub documents: &'a MembershipIndex,
    /// Journal → bundles.
    pub issues: &'a MembershipIndex,
    /// Bundle snapshots already fetched this run.
    pub snapshots: &'a HashMap<String, ContainerSnapshot>,
    pub invalid_order: InvalidOrderPolicy,
}

/// What happened to each candidate of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationOutcome {
    pub registered: Vec<String>,
    /// Candidates waiting on a missing owner, in input order.
    pub orphans: Vec<String>,
    /// Candidates dropped for this run (invalid order token, gone upstream).
    pub skipped: Vec<String>,
}

enum Attempt {
    Registered,
    Orphan,
    Skipped,
}

pub struct RegistrationPipeline<'a> {
    kind: PipelineKind,
    ctx: &'a RegistrationContext<'a>,
}

impl<'a> RegistrationPipeline<'a> {
    pub fn new(kind: PipelineKind, ctx: &'a RegistrationContext<'a>) -> Self {
        Self { kind, ctx }
    }

    #[instrument(skip_all, fields(kind = %self.kind, candidates = candidates.len()))]
    pub async fn register(
        &self,
        candidates: &[String],
        progress: &dyn ProgressReporter,
    ) -> Result<RegistrationOutcome> {
        let mut outcome = RegistrationOutcome::default();
        let total = candidates.len();

        for (i, member_id) in candidates.iter().enumerate() {
            match self.attempt(member_id).await? {
                Attempt::Registered => outcome.registered.push(member_id.clone()),
                Attempt::Orphan => outcome.orphans.push(member_id.clone()),
                Attempt::Skipped => outcome.skipped.push(member_id.clone()),
            }
            progress.candidate_processed(self.kind, member_id, i + 1, total);
        }

        info!(
            registered = outcome.registered.len(),
            orphans = outcome.orphans.len(),
            skipped = outcome.skipped.len(),
            "registration finished"
        );
        Ok(outcome)
    }

    async fn attempt(&self, member_id: &str) -> Result<Attempt> {
        let input = match self.prepare(member_id).await {
            Ok(Some(input)) => input,
            Ok(None) => return Ok(Attempt::Skipped),
            Err(e) => return self.classify(member_id, e),
        };

        let builder = RecordBuilder::new(self.ctx.storage);
        let saved = match builder.build(input).await {
            Ok(record) => self.ctx.storage.save(&record).await,
            Err(e) => Err(e),
        };

        match saved {
            Ok(()) => {
                debug!(member_id, "registered");
                Ok(Attempt::Registered)
            }
            Err(e) => self.classify(member_id, e),
        }
    }

    /// Resolve and fetch everything the record needs. `None` drops the candidate.
    async fn prepare(&self, member_id: &str) -> Result<Option<RecordInput>> {
        let ctx = self.ctx;
        let input = match self.kind {
            PipelineKind::Issues => {
                let Some(relation) = RelationResolver::new(ctx.issues).resolve(member_id) else {
                    return Err(SyncError::missing(
                        RecordKind::Journal,
                        format!("<journal of {member_id}>"),
                    ));
                };
                let snapshot = match ctx.snapshots.get(member_id) {
                    Some(snapshot) => snapshot.clone(),
                    None => match ctx.client.fetch_container(member_id).await {
                        Ok(snapshot) => snapshot,
                        Err(e) if e.is_not_found() => {
                            warn!(member_id, "bundle no longer exists upstream, dropping");
                            return Ok(None);
                        }
                        Err(e) => return Err(e),
                    },
                };
                RecordInput::Issue {
                    snapshot,
                    journal_id: relation.container_id,
                    order: relation.descriptor.order,
                }
            }
            PipelineKind::Documents => {
                let Some(relation) = RelationResolver::new(ctx.documents).resolve(member_id) else {
                    return Err(SyncError::missing(
                        RecordKind::Issue,
                        format!("<bundle of {member_id}>"),
                    ));
                };
                let front = ctx.client.fetch_document_front(member_id).await?;
                RecordInput::Article {
                    document_id: member_id.to_string(),
                    relation,
                    front,
                    xml_url: ctx.client.document_url(member_id),
                }
            }
            PipelineKind::Renditions => RecordInput::Rendition {
                document_id: member_id.to_string(),
                renditions: ctx.client.fetch_renditions(member_id).await?,
            },
        };
        Ok(Some(input))
    }

    fn classify(&self, member_id: &str, err: SyncError) -> Result<Attempt> {
        match err {
            SyncError::MissingDependency { kind, id } => {
                debug!(member_id, missing = %kind, owner = %id, "owner not registered yet, orphaning");
                Ok(Attempt::Orphan)
            }
            err @ SyncError::InvalidOrderValue { .. } => match self.ctx.invalid_order {
                InvalidOrderPolicy::Skip => {
                    warn!(member_id, error = %err, "skipping member with invalid order");
                    Ok(Attempt::Skipped)
                }
                InvalidOrderPolicy::Abort => Err(err),
            },
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use kernelsync_shared::{CatalogRecord, IssueRecord, JournalRecord, MemberDescriptor, SyncConfig};
    use serde_json::json;
    use std::time::Duration;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ISSUE: &str = "0001-3714-1999-v60-n2";

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    async fn test_storage() -> Storage {
        let path = std::env::temp_dir().join(format!("ks_test_{}.db", uuid::Uuid::now_v7()));
        Storage::open(&path).await.unwrap()
    }

    fn client_for(server: &MockServer) -> KernelClient {
        KernelClient::new(&SyncConfig {
            kernel_url: Url::parse(&server.uri()).unwrap(),
            timeout: Duration::from_secs(5),
            page_size: 100,
            invalid_order: InvalidOrderPolicy::Skip,
        })
        .unwrap()
    }

    async fn mount_front(server: &MockServer, id: &str, pid: Option<&str>) {
        Mock::given(method("GET"))
            .and(path(format!("/documents/{id}/front")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "title": format!("Document {id}"),
                "pid_v2": pid,
                "languages": ["pt", "en"]
            })))
            .mount(server)
            .await;
    }

    async fn seed_issue(storage: &Storage, issue_id: &str) {
        storage
            .save(&CatalogRecord::Journal(JournalRecord {
                id: "0001-3714".into(),
                title: None,
                acronym: None,
                scielo_issn: None,
                print_issn: None,
                electronic_issn: None,
                logo_url: None,
                created: None,
                updated: None,
            }))
            .await
            .unwrap();
        storage
            .save(&CatalogRecord::Issue(IssueRecord {
                id: issue_id.into(),
                journal_id: "0001-3714".into(),
                order: "1".into(),
                year: None,
                volume: None,
                number: None,
                supplement: None,
                label: String::new(),
                pid: None,
                start_month: None,
                end_month: None,
                created: None,
                updated: None,
            }))
            .await
            .unwrap();
    }

    fn documents_index() -> MembershipIndex {
        let mut index = MembershipIndex::new();
        index.merge(ISSUE, vec![MemberDescriptor::new("A", "00502")]);
        index
    }

    #[tokio::test]
    async fn unresolved_document_becomes_orphan() {
        let server = MockServer::start().await;
        mount_front(&server, "A", None).await;
        let client = client_for(&server);
        let storage = test_storage().await;
        seed_issue(&storage, ISSUE).await;

        let documents = documents_index();
        let issues = MembershipIndex::new();
        let snapshots = HashMap::new();
        let ctx = RegistrationContext {
            client: &client,
            storage: &storage,
            documents: &documents,
            issues: &issues,
            snapshots: &snapshots,
            invalid_order: InvalidOrderPolicy::Skip,
        };

        let outcome = RegistrationPipeline::new(PipelineKind::Documents, &ctx)
            .register(&ids(&["A", "B"]), &SilentProgress)
            .await
            .unwrap();

        assert_eq!(outcome.orphans, ids(&["B"]));
        assert_eq!(outcome.registered, ids(&["A"]));
        let Some(CatalogRecord::Article(a)) =
            storage.find_record(RecordKind::Article, "A").await.unwrap()
        else {
            panic!("A should be persisted");
        };
        assert_eq!(a.order, 502);
        assert_eq!(a.issue_id, ISSUE);
        assert!(a.xml_url.ends_with("/documents/A"));
    }

    #[tokio::test]
    async fn orphan_registers_once_owner_exists() {
        let server = MockServer::start().await;
        mount_front(&server, "A", None).await;
        let client = client_for(&server);
        let storage = test_storage().await;

        let documents = documents_index();
        let issues = MembershipIndex::new();
        let snapshots = HashMap::new();
        let ctx = RegistrationContext {
            client: &client,
            storage: &storage,
            documents: &documents,
            issues: &issues,
            snapshots: &snapshots,
            invalid_order: InvalidOrderPolicy::Skip,
        };
        let pipeline = RegistrationPipeline::new(PipelineKind::Documents, &ctx);

        let first = pipeline.register(&ids(&["A"]), &SilentProgress).await.unwrap();
        assert_eq!(first.orphans, ids(&["A"]));
        assert!(!storage.record_exists(RecordKind::Article, "A").await.unwrap());

        seed_issue(&storage, ISSUE).await;
        let second = pipeline.register(&first.orphans, &SilentProgress).await.unwrap();
        assert!(second.orphans.is_empty());
        assert_eq!(second.registered, ids(&["A"]));
        assert!(storage.record_exists(RecordKind::Article, "A").await.unwrap());
    }

    #[tokio::test]
    async fn invalid_order_follows_policy() {
        let server = MockServer::start().await;
        mount_front(&server, "A", None).await;
        let client = client_for(&server);
        let storage = test_storage().await;
        seed_issue(&storage, ISSUE).await;

        let mut documents = MembershipIndex::new();
        documents.merge(ISSUE, vec![MemberDescriptor::new("A", "bla")]);
        let issues = MembershipIndex::new();
        let snapshots = HashMap::new();

        let mut ctx = RegistrationContext {
            client: &client,
            storage: &storage,
            documents: &documents,
            issues: &issues,
            snapshots: &snapshots,
            invalid_order: InvalidOrderPolicy::Skip,
        };
        let outcome = RegistrationPipeline::new(PipelineKind::Documents, &ctx)
            .register(&ids(&["A"]), &SilentProgress)
            .await
            .unwrap();
        assert_eq!(outcome.skipped, ids(&["A"]));
        assert!(outcome.orphans.is_empty());

        ctx.invalid_order = InvalidOrderPolicy::Abort;
        let err = RegistrationPipeline::new(PipelineKind::Documents, &ctx)
            .register(&ids(&["A"]), &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidOrderValue { .. }));
    }

    #[tokio::test]
    async fn upstream_failure_is_not_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents/A/front"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let client = client_for(&server);
        let storage = test_storage().await;
        seed_issue(&storage, ISSUE).await;

        let documents = documents_index();
        let issues = MembershipIndex::new();
        let snapshots = HashMap::new();
        let ctx = RegistrationContext {
            client: &client,
            storage: &storage,
            documents: &documents,
            issues: &issues,
            snapshots: &snapshots,
            invalid_order: InvalidOrderPolicy::Skip,
        };

        let err = RegistrationPipeline::new(PipelineKind::Documents, &ctx)
            .register(&ids(&["A"]), &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Upstream(_)));
    }

    #[tokio::test]
    async fn renditions_wait_for_their_article() {
        let server = MockServer::start().await;
        mount_front(&server, "A", None).await;
        Mock::given(method("GET"))
            .and(path("/documents/A/renditions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "filename": "a-pt.pdf",
                "url": "//object-storage/a-pt.pdf",
                "mimetype": "application/pdf",
                "lang": "pt",
                "size_bytes": 42
            }])))
            .mount(&server)
            .await;
        let client = client_for(&server);
        let storage = test_storage().await;
        seed_issue(&storage, ISSUE).await;

        let documents = documents_index();
        let issues = MembershipIndex::new();
        let snapshots = HashMap::new();
        let ctx = RegistrationContext {
            client: &client,
            storage: &storage,
            documents: &documents,
            issues: &issues,
            snapshots: &snapshots,
            invalid_order: InvalidOrderPolicy::Skip,
        };

        let renditions = RegistrationPipeline::new(PipelineKind::Renditions, &ctx);
        let first = renditions.register(&ids(&["A"]), &SilentProgress).await.unwrap();
        assert_eq!(first.orphans, ids(&["A"]));

        RegistrationPipeline::new(PipelineKind::Documents, &ctx)
            .register(&ids(&["A"]), &SilentProgress)
            .await
            .unwrap();
        let second = renditions.register(&ids(&["A"]), &SilentProgress).await.unwrap();
        assert_eq!(second.registered, ids(&["A"]));

        let Some(CatalogRecord::Article(a)) =
            storage.find_record(RecordKind::Article, "A").await.unwrap()
        else {
            panic!("A should be persisted");
        };
        assert_eq!(a.pdfs.len(), 1);
        assert_eq!(a.pdfs[0].lang, "pt");
    }

    #[tokio::test]
    async fn issues_use_drained_snapshots() {
        let server = MockServer::start().await;
        let client = client_for(&server);
        let storage = test_storage().await;

        let documents = MembershipIndex::new();
        let mut issues = MembershipIndex::new();
        issues.merge("0001-3714", vec![MemberDescriptor::new(ISSUE, "12345")]);
        let snapshot: ContainerSnapshot = serde_json::from_value(json!({
            "id": ISSUE,
            "metadata": {"publication_year": "1999", "volume": "60", "number": "2"}
        }))
        .unwrap();
        let snapshots = HashMap::from([(ISSUE.to_string(), snapshot)]);
        let ctx = RegistrationContext {
            client: &client,
            storage: &storage,
            documents: &documents,
            issues: &issues,
            snapshots: &snapshots,
            invalid_order: InvalidOrderPolicy::Skip,
        };
        let pipeline = RegistrationPipeline::new(PipelineKind::Issues, &ctx);

        // Journal not stored yet.
        let first = pipeline.register(&ids(&[ISSUE, "unknown"]), &SilentProgress).await.unwrap();
        assert_eq!(first.orphans, ids(&[ISSUE, "unknown"]));

        seed_issue(&storage, "other").await;
        let second = pipeline.register(&ids(&[ISSUE]), &SilentProgress).await.unwrap();
        assert_eq!(second.registered, ids(&[ISSUE]));

        let Some(CatalogRecord::Issue(issue)) =
            storage.find_record(RecordKind::Issue, ISSUE).await.unwrap()
        else {
            panic!("issue should be persisted");
        };
        assert_eq!(issue.label, "v60n2");
        assert_eq!(issue.order, "12345");
        assert_eq!(issue.journal_id, "0001-3714");
    }
}
