/*
    AssetClient - peer-first fetches with origin fallback

    fetch_p2p_first(url):
      1. asset id = url
      2. ask the mesh (request timeout from config); a hit is returned as-is
      3. otherwise fetch from origin, count the bytes as origin traffic, and
         seed the asset so peers can get it from us next time

    The origin is a trait so the fetch-interception layer (or a test) can
    supply its own; `HttpOrigin` is the reqwest-backed default.
*/

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::errors::{MeshError, MeshResult};
use super::node::MeshHandle;
use super::types::{AssetLocation, FetchOutcome};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Bytes as served by the origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginResponse {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait OriginFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> MeshResult<OriginResponse>;
}

/// Plain HTTP(S) origin
pub struct HttpOrigin {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpOrigin {
    pub fn new() -> Self {
        HttpOrigin { client: reqwest::Client::new(), base_url: None }
    }

    /// Resolve path-only asset ids (`/img.png`) against `base_url`
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        HttpOrigin { client: reqwest::Client::new(), base_url: Some(base_url) }
    }

    fn resolve(&self, url: &str) -> String {
        match &self.base_url {
            Some(base) if url.starts_with('/') => format!("{}{}", base, url),
            _ => url.to_string(),
        }
    }
}

impl Default for HttpOrigin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OriginFetcher for HttpOrigin {
    async fn fetch(&self, url: &str) -> MeshResult<OriginResponse> {
        let target = self.resolve(url);
        let origin_err = |reason: String| MeshError::Origin { url: target.clone(), reason };

        let response = self.client.get(&target).send().await.map_err(|e| origin_err(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(origin_err(format!("HTTP {}", status)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(|e| origin_err(e.to_string()))?;
        Ok(OriginResponse { bytes: bytes.to_vec(), content_type })
    }
}

pub struct AssetClient {
    mesh: MeshHandle,
    origin: Arc<dyn OriginFetcher>,
    p2p_first: bool,
}

impl AssetClient {
    pub fn new(mesh: MeshHandle, origin: Arc<dyn OriginFetcher>) -> Self {
        AssetClient { mesh, origin, p2p_first: true }
    }

    /// With `false` every fetch goes straight to the origin
    pub fn with_p2p_first(mut self, p2p_first: bool) -> Self {
        self.p2p_first = p2p_first;
        self
    }

    pub fn mesh(&self) -> &MeshHandle {
        &self.mesh
    }

    pub async fn fetch_p2p_first(&self, url: &str) -> MeshResult<FetchOutcome> {
        let asset_id = url;

        if self.p2p_first {
            if let Some(asset) = self.mesh.request_asset(asset_id).await? {
                debug!(asset_id, peer_id = %asset.source, bytes = asset.bytes.len(), "Served by peer");
                return Ok(FetchOutcome {
                    bytes: asset.bytes,
                    content_type: asset.content_type,
                    location: AssetLocation::peer(asset.source),
                });
            }
            debug!(asset_id, "No peer had the asset, falling back to origin");
        }

        let response = self.origin.fetch(url).await?;
        let size = response.bytes.len();
        self.mesh.record_origin_bytes(size as u64).await?;

        if size <= self.mesh.max_asset_size() {
            let content_type = response.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
            if let Err(e) = self.mesh.seed_asset(asset_id, response.bytes.clone(), content_type).await {
                warn!(asset_id, "Failed to seed origin asset: {}", e);
            }
        } else {
            debug!(asset_id, bytes = size, "Origin asset too large to share");
        }

        Ok(FetchOutcome { bytes: response.bytes, content_type: response.content_type, location: AssetLocation::origin() })
    }
}
