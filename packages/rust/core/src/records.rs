//! Target-store record construction, one variant per record kind.
//!
//! [`RecordBuilder::build`] turns kernel data into a [`CatalogRecord`],
//! reusing whatever the target store already holds for the same id so that
//! re-registration updates in place.

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use kernelsync_shared::{
    ArticleRecord, CatalogRecord, ContainerSnapshot, DocumentFront, IssueRecord, JournalRecord,
    JournalSnapshot, PdfLink, RecordKind, RenditionData, Result, SyncError,
};
use kernelsync_storage::Storage;

use crate::membership::Relation;

/// Input for one record construction, tagged by kind.
#[derive(Debug, Clone)]
pub enum RecordInput {
    Journal(JournalSnapshot),
    Issue {
        snapshot: ContainerSnapshot,
        journal_id: String,
        /// Ordering token of the issue inside its journal.
        order: String,
    },
    Article {
        document_id: String,
        relation: Relation,
        front: DocumentFront,
        xml_url: String,
    },
    Rendition {
        document_id: String,
        renditions: Vec<RenditionData>,
    },
}

impl RecordInput {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Journal(_) => RecordKind::Journal,
            Self::Issue { .. } => RecordKind::Issue,
            Self::Article { .. } => RecordKind::Article,
            Self::Rendition { .. } => RecordKind::Rendition,
        }
    }
}

/// Builds catalog records against the current target store contents.
pub struct RecordBuilder<'a> {
    storage: &'a Storage,
}

impl<'a> RecordBuilder<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub async fn build(&self, input: RecordInput) -> Result<CatalogRecord> {
        debug!(kind = %input.kind(), "building record");
        match input {
            RecordInput::Journal(snapshot) => self.build_journal(snapshot).await,
            RecordInput::Issue {
                snapshot,
                journal_id,
                order,
            } => self.build_issue(snapshot, journal_id, order).await,
            RecordInput::Article {
                document_id,
                relation,
                front,
                xml_url,
            } => self.build_article(document_id, relation, front, xml_url).await,
            RecordInput::Rendition {
                document_id,
                renditions,
            } => self.build_rendition(document_id, renditions).await,
        }
    }

    async fn build_journal(&self, snapshot: JournalSnapshot) -> Result<CatalogRecord> {
        let existing = match self.storage.find_record(RecordKind::Journal, &snapshot.id).await? {
            Some(CatalogRecord::Journal(j)) => Some(j),
            _ => None,
        };
        let meta = &snapshot.metadata;

        Ok(CatalogRecord::Journal(JournalRecord {
            title: meta_str(meta, "title"),
            acronym: meta_str(meta, "acronym"),
            scielo_issn: meta_str(meta, "scielo_issn"),
            print_issn: meta_str(meta, "print_issn"),
            electronic_issn: meta_str(meta, "electronic_issn"),
            // Logos are uploaded on the website side, never by the kernel.
            logo_url: existing.as_ref().and_then(|j| j.logo_url.clone()),
            created: snapshot
                .created
                .or_else(|| existing.as_ref().and_then(|j| j.created)),
            updated: snapshot.updated,
            id: snapshot.id,
        }))
    }

    async fn build_issue(
        &self,
        snapshot: ContainerSnapshot,
        journal_id: String,
        order: String,
    ) -> Result<CatalogRecord> {
        if !self
            .storage
            .record_exists(RecordKind::Journal, &journal_id)
            .await?
        {
            return Err(SyncError::missing(RecordKind::Journal, journal_id));
        }

        let existing_created = match self.storage.find_record(RecordKind::Issue, &snapshot.id).await? {
            Some(CatalogRecord::Issue(i)) => i.created,
            _ => None,
        };

        let meta = &snapshot.metadata;
        let volume = meta_str(meta, "volume");
        let number = meta_str(meta, "number");
        let supplement = meta_str(meta, "supplement");
        let (start_month, end_month) = publication_months(meta);

        Ok(CatalogRecord::Issue(IssueRecord {
            label: issue_label(volume.as_deref(), number.as_deref(), supplement.as_deref()),
            journal_id,
            order,
            year: meta_str(meta, "publication_year"),
            volume,
            number,
            supplement,
            pid: meta_str(meta, "pid"),
            start_month,
            end_month,
            created: snapshot.created.or(existing_created),
            updated: snapshot.updated,
            id: snapshot.id,
        }))
    }

    async fn build_article(
        &self,
        document_id: String,
        relation: Relation,
        front: DocumentFront,
        xml_url: String,
    ) -> Result<CatalogRecord> {
        if !self
            .storage
            .record_exists(RecordKind::Issue, &relation.container_id)
            .await?
        {
            return Err(SyncError::missing(RecordKind::Issue, relation.container_id));
        }

        let order = article_order(
            &document_id,
            Some(relation.descriptor.order.as_str()),
            front.pid_v2.as_deref(),
        )?;

        let existing = match self.storage.find_record(RecordKind::Article, &document_id).await? {
            Some(CatalogRecord::Article(a)) => Some(a),
            _ => None,
        };
        let now = Utc::now();

        Ok(CatalogRecord::Article(ArticleRecord {
            id: document_id,
            issue_id: relation.container_id,
            order,
            title: front.title,
            doi: front.doi,
            pid_v2: front.pid_v2,
            original_language: front.original_language,
            languages: front.languages,
            publication_date: front.publication_date,
            article_type: front.article_type,
            xml_url,
            pdfs: existing.as_ref().map(|a| a.pdfs.clone()).unwrap_or_default(),
            created: existing.as_ref().map(|a| a.created).unwrap_or(now),
            updated: now,
        }))
    }

    async fn build_rendition(
        &self,
        document_id: String,
        renditions: Vec<RenditionData>,
    ) -> Result<CatalogRecord> {
        let mut article = match self.storage.find_record(RecordKind::Article, &document_id).await? {
            Some(CatalogRecord::Article(a)) => a,
            _ => return Err(SyncError::missing(RecordKind::Article, document_id)),
        };

        article.pdfs = renditions
            .into_iter()
            .map(|r| PdfLink {
                lang: r.lang,
                url: r.url,
                kind: "pdf".to_string(),
                filename: r.filename,
            })
            .collect();
        article.updated = Utc::now();

        Ok(CatalogRecord::Article(article))
    }
}

/// Display position of a document inside its issue.
///
/// Numeric tokens are used as-is; otherwise the last five digits of the PID v2
/// stand in for the position.
pub fn article_order(member_id: &str, order: Option<&str>, pid_v2: Option<&str>) -> Result<u32> {
    if let Some(value) = order.map(str::trim).and_then(parse_digits) {
        return Ok(value);
    }

    let from_pid = pid_v2.and_then(|pid| {
        let start = pid.len().checked_sub(5)?;
        pid.get(start..).and_then(parse_digits)
    });

    from_pid.ok_or_else(|| SyncError::InvalidOrderValue {
        member_id: member_id.to_string(),
        order: order.map(str::to_string),
    })
}

fn parse_digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Short issue label such as `v29n3` or `v60n2s1`.
pub fn issue_label(volume: Option<&str>, number: Option<&str>, supplement: Option<&str>) -> String {
    [("v", volume), ("n", number), ("s", supplement)]
        .into_iter()
        .filter_map(|(prefix, value)| {
            value
                .filter(|v| !v.is_empty())
                .map(|v| format!("{prefix}{v}"))
        })
        .collect()
}

/// Metadata values may come as strings or numbers.
fn meta_str(meta: &Value, key: &str) -> Option<String> {
    match meta.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn publication_months(meta: &Value) -> (Option<u32>, Option<u32>) {
    let Some(months) = meta.get("publication_months") else {
        return (None, None);
    };
    let as_month = |v: &Value| v.as_u64().and_then(|m| u32::try_from(m).ok());

    if let Some(range) = months.get("range").and_then(Value::as_array) {
        return (
            range.first().and_then(as_month),
            range.get(1).and_then(as_month),
        );
    }
    match months.get("month").and_then(as_month) {
        Some(m) => (Some(m), Some(m)),
        None => (None, None),
    }
}
