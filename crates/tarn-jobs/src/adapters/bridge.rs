//! Bridge archive adapter: live proxy to an external system.
//!
//! A bridge archive owns no entries; every query goes out over its
//! configured endpoint and comes back as ephemeral results. The retrieval
//! handler materializes those into the provenance store before pooling, so
//! nothing here persists anything.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use tarn_core::{
    defaults, Archive, ArchiveKind, EntryRef, EphemeralEntry, Error, QueryConstraints, Result,
    ScoredEntry,
};

/// One scored result from a bridge endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeHit {
    pub locator: String,
    pub content: String,
    #[serde(default)]
    pub attributes: JsonValue,
    pub relevance: f32,
}

/// Transport seam for bridge queries, so tests can run without a network.
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    async fn query(&self, endpoint: &str, goal: &str, max_entries: i64) -> Result<Vec<BridgeHit>>;
}

#[derive(Serialize)]
struct BridgeRequest<'a> {
    goal: &'a str,
    max_entries: i64,
}

#[derive(Deserialize)]
struct BridgeResponse {
    hits: Vec<BridgeHit>,
}

/// HTTP transport posting the goal to the bridge endpoint.
pub struct HttpBridgeTransport {
    client: reqwest::Client,
}

impl HttpBridgeTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(defaults::BRIDGE_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }
}

impl Default for HttpBridgeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BridgeTransport for HttpBridgeTransport {
    async fn query(&self, endpoint: &str, goal: &str, max_entries: i64) -> Result<Vec<BridgeHit>> {
        let response = self
            .client
            .post(endpoint)
            .json(&BridgeRequest { goal, max_entries })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("bridge query timed out: {e}"))
                } else {
                    Error::Archive(format!("bridge request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Archive(format!("bridge returned {status}")));
        }

        let body: BridgeResponse = response
            .json()
            .await
            .map_err(|e| Error::Archive(format!("malformed bridge response: {e}")))?;
        Ok(body.hits)
    }
}

/// Adapter for Bridge archives.
pub struct BridgeAdapter {
    transport: Arc<dyn BridgeTransport>,
}

impl BridgeAdapter {
    pub fn new(transport: Arc<dyn BridgeTransport>) -> Self {
        Self { transport }
    }

    fn endpoint(archive: &Archive) -> Result<&str> {
        archive
            .config
            .get("endpoint")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::Config(format!(
                    "bridge archive {} has no endpoint configured",
                    archive.id
                ))
            })
    }
}

#[async_trait]
impl super::ArchiveAdapter for BridgeAdapter {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Bridge
    }

    async fn query(
        &self,
        archive: &Archive,
        goal: &str,
        constraints: QueryConstraints,
    ) -> Result<Vec<ScoredEntry>> {
        let endpoint = Self::endpoint(archive)?;
        let mut hits = self
            .transport
            .query(endpoint, goal, constraints.max_entries)
            .await?;
        hits.truncate(constraints.max_entries as usize);

        debug!(
            subsystem = "adapters",
            component = "bridge",
            archive_id = %archive.id,
            result_count = hits.len(),
            "Bridge lookup complete"
        );
        Ok(hits
            .into_iter()
            .map(|hit| ScoredEntry {
                relevance: hit.relevance,
                entry: EntryRef::Ephemeral(EphemeralEntry {
                    locator: hit.locator,
                    content: hit.content,
                    attributes: hit.attributes,
                }),
            })
            .collect())
    }
}
