//! Error types for the mesh

use thiserror::Error;

use super::transport::TransportError;
use super::types::AssetId;
use crate::core_rendezvous::RendezvousError;

pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Asset {asset_id} is {size} bytes, limit is {limit}")]
    AssetTooLarge { asset_id: AssetId, size: usize, limit: usize },

    #[error("Origin fetch failed for {url}: {reason}")]
    Origin { url: String, reason: String },

    #[error("Rendezvous error: {0}")]
    Rendezvous(#[from] RendezvousError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The node actor has stopped and no longer accepts commands
    #[error("Mesh node is shut down")]
    NodeStopped,

    #[error("Failed to install metrics exporter: {0}")]
    Metrics(String),
}
