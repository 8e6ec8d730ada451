//! Hard-Edging core: a browser-style peer mesh that serves static assets
//! peer-to-peer and falls back to the origin only when no peer can help.
//!
//! - [`core_rendezvous`]: room membership and signaling relay
//! - [`core_mesh`]: per-peer sessions, the asset protocol, transfer admission
//!   control and the credit ledger
//! - [`config`], [`logging`]: ambient configuration and structured logging

pub mod config;
pub mod core_mesh;
pub mod core_rendezvous;
pub mod logging;

#[cfg(test)]
pub mod test_utils;

pub use config::Config;
pub use core_mesh::{
    AdmissionController, AdmissionDecision, AssetClient, MeshError, MeshHandle, MeshStats,
    PeerId, QueuePolicy,
};
pub use core_rendezvous::RendezvousServer;
pub use logging::{init_logging, LogLevel};
