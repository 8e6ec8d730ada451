//! Rendezvous error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("Failed to bind relay on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Relay server failed: {0}")]
    Serve(String),

    #[error("Failed to connect to relay at {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The signaling connection is gone
    #[error("Signaling connection closed")]
    Closed,
}
