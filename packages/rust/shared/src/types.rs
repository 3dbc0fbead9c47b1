//! Core domain types for kernelsync: feed events, kernel snapshots, catalog records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for sync run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

/// One entry of the kernel change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Path-like reference to the changed entity (e.g. `/bundles/0001-3714-1999-v60-n2`).
    #[serde(rename = "id")]
    pub container_ref: String,
    /// Kernel timestamp of the change; doubles as the feed cursor.
    pub timestamp: String,
    pub change_id: String,
}

/// What a [`ChangeEvent`] points at, parsed from its reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeTarget {
    Journal(String),
    Container(String),
    Document(String),
    Renditions(String),
    Other,
}

impl ChangeEvent {
    pub fn target(&self) -> ChangeTarget {
        let segments: Vec<&str> = self
            .container_ref
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        match segments.as_slice() {
            ["journals", id] => ChangeTarget::Journal((*id).to_string()),
            ["bundles", id] => ChangeTarget::Container((*id).to_string()),
            ["documents", id] => ChangeTarget::Document((*id).to_string()),
            ["documents", id, "renditions"] => ChangeTarget::Renditions((*id).to_string()),
            _ => ChangeTarget::Other,
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel snapshots
// ---------------------------------------------------------------------------

/// `{id, order}` entry of a container's member list. `order` is opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberDescriptor {
    pub id: String,
    /// Kept as text whether the kernel sends a string or a number.
    #[serde(default, deserialize_with = "order_token")]
    pub order: String,
}

fn order_token<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(String::new()),
        Some(serde_json::Value::String(s)) => Ok(s),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(de::Error::custom(format!(
            "order must be a string or a number, got {other}"
        ))),
    }
}

impl MemberDescriptor {
    pub fn new(id: impl Into<String>, order: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            order: order.into(),
        }
    }
}

/// A documents bundle (issue) as served by `/bundles/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub id: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    /// Every member currently in the bundle, in canonical order. Absent means empty.
    #[serde(default)]
    pub items: Vec<MemberDescriptor>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A journal as served by `/journals/{id}`. Its `items` are the journal's issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalSnapshot {
    pub id: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items: Vec<MemberDescriptor>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Document detail payload (`/documents/{id}/front`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentFront {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub pid_v2: Option<String>,
    #[serde(default)]
    pub original_language: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub publication_date: Option<String>,
    #[serde(default)]
    pub article_type: Option<String>,
}

/// One rendition (PDF) entry from `/documents/{id}/renditions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenditionData {
    pub filename: String,
    pub url: String,
    pub mimetype: String,
    pub lang: String,
    #[serde(default)]
    pub size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Catalog records (target store)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub id: String,
    pub title: Option<String>,
    pub acronym: Option<String>,
    pub scielo_issn: Option<String>,
    pub print_issn: Option<String>,
    pub electronic_issn: Option<String>,
    pub logo_url: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub id: String,
    pub journal_id: String,
    /// Ordering token of the issue within its journal.
    pub order: String,
    pub year: Option<String>,
    pub volume: Option<String>,
    pub number: Option<String>,
    pub supplement: Option<String>,
    pub label: String,
    pub pid: Option<String>,
    pub start_month: Option<u32>,
    pub end_month: Option<u32>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

/// A PDF link attached to an article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfLink {
    pub lang: String,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub id: String,
    pub issue_id: String,
    /// Display position within the issue.
    pub order: u32,
    pub title: Option<String>,
    pub doi: Option<String>,
    pub pid_v2: Option<String>,
    pub original_language: Option<String>,
    /// One entry per available HTML language.
    pub languages: Vec<String>,
    pub publication_date: Option<String>,
    pub article_type: Option<String>,
    pub xml_url: String,
    #[serde(default)]
    pub pdfs: Vec<PdfLink>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Any record the target store persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogRecord {
    Journal(JournalRecord),
    Issue(IssueRecord),
    Article(ArticleRecord),
}

impl CatalogRecord {
    pub fn id(&self) -> &str {
        match self {
            Self::Journal(r) => &r.id,
            Self::Issue(r) => &r.id,
            Self::Article(r) => &r.id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Journal(_) => RecordKind::Journal,
            Self::Issue(_) => RecordKind::Issue,
            Self::Article(_) => RecordKind::Article,
        }
    }
}

// ---------------------------------------------------------------------------
// Kinds & stages
// ---------------------------------------------------------------------------

/// Record kinds the record builder knows how to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Journal,
    Issue,
    Article,
    /// Renditions live on their article record.
    Rendition,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Journal => "journal",
            Self::Issue => "issue",
            Self::Article => "article",
            Self::Rendition => "rendition",
        })
    }
}

/// Registration pipelines, each with its own orphan ledger slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Issues,
    Documents,
    Renditions,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 3] = [Self::Issues, Self::Documents, Self::Renditions];

    /// Run-state slot holding this pipeline's orphan set.
    pub fn ledger_key(self) -> &'static str {
        match self {
            Self::Issues => "orphan_issues",
            Self::Documents => "orphan_documents",
            Self::Renditions => "orphan_renditions",
        }
    }

    pub fn record_kind(self) -> RecordKind {
        match self {
            Self::Issues => RecordKind::Issue,
            Self::Documents => RecordKind::Article,
            Self::Renditions => RecordKind::Rendition,
        }
    }

    pub fn stage(self) -> SyncStage {
        match self {
            Self::Issues => SyncStage::Issues,
            Self::Documents => SyncStage::Documents,
            Self::Renditions => SyncStage::Renditions,
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Issues => "issues",
            Self::Documents => "documents",
            Self::Renditions => "renditions",
        })
    }
}

/// Stages of a sync run, used to report where a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Drain,
    Journals,
    Issues,
    Documents,
    Renditions,
    Finalize,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Drain => "drain",
            Self::Journals => "journals",
            Self::Issues => "issues",
            Self::Documents => "documents",
            Self::Renditions => "renditions",
            Self::Finalize => "finalize",
        })
    }
}
