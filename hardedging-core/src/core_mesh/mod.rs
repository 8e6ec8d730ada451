//! Peer mesh: sessions, the asset protocol, admission control and accounting

pub mod admission;
pub mod asset_client;
pub mod asset_store;
pub mod connection;
pub mod errors;
pub mod ledger;
pub mod metrics;
pub mod node;
pub mod pending;
pub mod protocol;
pub mod session_manager;
pub mod tcp_transport;
pub mod transport;
pub mod types;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionDecision, AdmissionStats, QueuePolicy};
pub use asset_client::{AssetClient, HttpOrigin, OriginFetcher, OriginResponse};
pub use connection::{ConnectionState, Role};
pub use errors::{MeshError, MeshResult};
pub use ledger::{MeshLedger, MeshStats, PeerCredit};
pub use node::{MeshEvent, MeshHandle, MeshNode, SignalingLink};
pub use protocol::{AssetMessage, AssetRequest, AssetResponse};
pub use tcp_transport::TcpTransport;
pub use transport::{Transport, TransportCommand, TransportError, TransportEvent};
pub use types::{AssetId, AssetLocation, AssetRecord, FetchOutcome, PeerAsset, PeerId};
