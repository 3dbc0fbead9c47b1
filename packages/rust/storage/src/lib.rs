//! libSQL storage layer for the website catalog and durable run state.
//!
//! The [`Storage`] struct wraps a libSQL database holding:
//! - the target catalog (journals, issues, articles with their renditions)
//! - run-state slots (feed cursor, membership snapshots, orphan ledgers)
//! - sync run history
//!
//! The sync pipeline is the single writer.

mod migrations;

use std::path::Path;

use chrono::Utc;
use kernelsync_shared::{CatalogRecord, RecordKind, Result, SyncError};
use libsql::{Connection, Database, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

/// Summary row of a sync run.
#[derive(Debug, Clone)]
pub struct SyncRunRow {
    pub id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub stats_json: Option<String>,
}

fn storage_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::Storage(e.to_string())
}

/// Table backing a record kind. Renditions are stored on their article.
fn table_for(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Journal => "journals",
        RecordKind::Issue => "issues",
        RecordKind::Article | RecordKind::Rendition => "articles",
    }
}

impl Storage {
    /// Open or create a database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        SyncError::Storage(format!("migration v{} failed: {e}", migration.version))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Run-state slots
    // -----------------------------------------------------------------------

    /// Read a structured value from a run-state slot.
    pub async fn get_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut rows = self
            .conn
            .query(
                "SELECT value_json FROM run_state WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row.get(0).map_err(storage_err)?;
                let value = serde_json::from_str(&json).map_err(|e| {
                    SyncError::Storage(format!("corrupt run_state slot '{key}': {e}"))
                })?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Overwrite a run-state slot with a structured value.
    pub async fn set_state<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO run_state (key, value_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value_json = excluded.value_json,
                   updated_at = excluded.updated_at",
                params![key, json.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Catalog records
    // -----------------------------------------------------------------------

    /// Look up a catalog record by kind and id.
    pub async fn find_record(&self, kind: RecordKind, id: &str) -> Result<Option<CatalogRecord>> {
        let sql = format!("SELECT data_json FROM {} WHERE id = ?1", table_for(kind));
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row.get(0).map_err(storage_err)?;
                let record = serde_json::from_str(&json).map_err(|e| {
                    SyncError::Storage(format!("corrupt {kind} record '{id}': {e}"))
                })?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Whether a record of `kind` with `id` exists.
    pub async fn record_exists(&self, kind: RecordKind, id: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE id = ?1", table_for(kind));
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(storage_err)?;
        Ok(rows.next().await.map_err(storage_err)?.is_some())
    }

    /// Count records of a kind.
    pub async fn count_records(&self, kind: RecordKind) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table_for(kind));
        let mut rows = self.conn.query(&sql, params![]).await.map_err(storage_err)?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(storage_err)? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Insert or replace a catalog record.
    ///
    /// Fails with [`SyncError::MissingDependency`] when the record's owner
    /// (journal for an issue, issue for an article) is not stored yet.
    pub async fn save(&self, record: &CatalogRecord) -> Result<()> {
        let json = serde_json::to_string(record).map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();

        match record {
            CatalogRecord::Journal(journal) => {
                self.conn
                    .execute(
                        "INSERT INTO journals (id, data_json, updated_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(id) DO UPDATE SET
                           data_json = excluded.data_json,
                           updated_at = excluded.updated_at",
                        params![journal.id.as_str(), json.as_str(), now.as_str()],
                    )
                    .await
                    .map_err(storage_err)?;
            }
            CatalogRecord::Issue(issue) => {
                if !self.record_exists(RecordKind::Journal, &issue.journal_id).await? {
                    return Err(SyncError::missing(RecordKind::Journal, &issue.journal_id));
                }
                self.conn
                    .execute(
                        "INSERT INTO issues (id, journal_id, data_json, updated_at) VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(id) DO UPDATE SET
                           journal_id = excluded.journal_id,
                           data_json = excluded.data_json,
                           updated_at = excluded.updated_at",
                        params![
                            issue.id.as_str(),
                            issue.journal_id.as_str(),
                            json.as_str(),
                            now.as_str()
                        ],
                    )
                    .await
                    .map_err(storage_err)?;
            }
            CatalogRecord::Article(article) => {
                if !self.record_exists(RecordKind::Issue, &article.issue_id).await? {
                    return Err(SyncError::missing(RecordKind::Issue, &article.issue_id));
                }
                self.conn
                    .execute(
                        "INSERT INTO articles (id, issue_id, data_json, updated_at) VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(id) DO UPDATE SET
                           issue_id = excluded.issue_id,
                           data_json = excluded.data_json,
                           updated_at = excluded.updated_at",
                        params![
                            article.id.as_str(),
                            article.issue_id.as_str(),
                            json.as_str(),
                            now.as_str()
                        ],
                    )
                    .await
                    .map_err(storage_err)?;
            }
        }

        tracing::debug!(kind = %record.kind(), id = record.id(), "record saved");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sync run history
    // -----------------------------------------------------------------------

    /// Record the start of a sync run.
    pub async fn insert_sync_run(&self, run_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO sync_runs (id, started_at) VALUES (?1, ?2)",
                params![run_id, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Close a sync run with its final status and stats.
    pub async fn finish_sync_run(
        &self,
        run_id: &str,
        status: &str,
        stats_json: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE sync_runs SET finished_at = ?1, status = ?2, stats_json = ?3 WHERE id = ?4",
                params![now.as_str(), status, stats_json, run_id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Most recently started sync run, if any.
    pub async fn last_sync_run(&self) -> Result<Option<SyncRunRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, status, stats_json
                 FROM sync_runs ORDER BY started_at DESC, id DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(SyncRunRow {
                id: row.get::<String>(0).map_err(storage_err)?,
                started_at: row.get::<String>(1).map_err(storage_err)?,
                finished_at: row.get::<String>(2).ok(),
                status: row.get::<String>(3).map_err(storage_err)?,
                stats_json: row.get::<String>(4).ok(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }
}
