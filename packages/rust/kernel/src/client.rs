//! Kernel API client.
//!
//! Endpoints used:
//! - `GET /changes?since=&limit=`: change feed, paged by timestamp
//! - `GET /journals/{id}`, `GET /bundles/{id}`: container snapshots
//! - `GET /documents/{id}/front`, `GET /documents/{id}/renditions`: member details

use std::collections::HashSet;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument};
use url::Url;

use kernelsync_shared::{
    ChangeEvent, ContainerSnapshot, DocumentFront, JournalSnapshot, RenditionData, Result,
    SyncConfig, SyncError,
};

/// User-Agent string for kernel requests.
pub const USER_AGENT: &str = concat!("kernelsync/", env!("CARGO_PKG_VERSION"));

/// One page of the change feed.
#[derive(Debug, Deserialize)]
struct ChangesPage {
    #[serde(default)]
    results: Vec<ChangeEvent>,
}

/// Read-only client for the kernel API.
pub struct KernelClient {
    client: Client,
    base_url: Url,
    page_size: u32,
}

impl KernelClient {
    /// Create a new client from the runtime sync configuration.
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.timeout)
            .build()
            .map_err(|e| SyncError::Upstream(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.kernel_url.clone(),
            page_size: config.page_size,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URL of `path` under the kernel base URL.
    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Canonical URL of a document's XML, stored on article records.
    pub fn document_url(&self, document_id: &str) -> String {
        self.endpoint(&format!("documents/{document_id}"))
    }

    /// Read every change event after `since` (or from the beginning).
    ///
    /// Pages are requested until a short page or a page with no unseen events.
    #[instrument(skip_all, fields(since = since.unwrap_or("<start>")))]
    pub async fn list_changes(&self, since: Option<&str>) -> Result<Vec<ChangeEvent>> {
        let mut events: Vec<ChangeEvent> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursor = since.map(str::to_string);

        loop {
            let mut query = vec![("limit", self.page_size.to_string())];
            if let Some(c) = &cursor {
                query.push(("since", c.clone()));
            }

            let page: ChangesPage = self.get_json("changes", &query).await?;
            let page_len = page.results.len();

            let mut fresh = 0usize;
            for event in page.results {
                if seen.insert(event.change_id.clone()) {
                    fresh += 1;
                    events.push(event);
                }
            }

            debug!(page_len, fresh, "read change feed page");

            if fresh == 0 || page_len < self.page_size as usize {
                break;
            }
            cursor = events.last().map(|e| e.timestamp.clone());
        }

        info!(events = events.len(), "change feed read");
        Ok(events)
    }

    /// Fetch the current snapshot of a documents bundle.
    pub async fn fetch_container(&self, container_id: &str) -> Result<ContainerSnapshot> {
        self.get_json(&format!("bundles/{container_id}"), &[]).await
    }

    /// Fetch the current snapshot of a journal.
    pub async fn fetch_journal(&self, journal_id: &str) -> Result<JournalSnapshot> {
        self.get_json(&format!("journals/{journal_id}"), &[]).await
    }

    /// Fetch a document's front matter (detail payload).
    pub async fn fetch_document_front(&self, document_id: &str) -> Result<DocumentFront> {
        self.get_json(&format!("documents/{document_id}/front"), &[])
            .await
    }

    /// Fetch a document's renditions.
    pub async fn fetch_renditions(&self, document_id: &str) -> Result<Vec<RenditionData>> {
        self.get_json(&format!("documents/{document_id}/renditions"), &[])
            .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.endpoint(path);
        debug!(%url, "GET");

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| SyncError::Upstream(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::not_found(format!("/{}", path.trim_start_matches('/'))));
        }
        if !status.is_success() {
            return Err(SyncError::Upstream(format!("{url}: HTTP {status}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Upstream(format!("{url}: invalid response body: {e}")))
    }
}
