//! Rendezvous: the relay peers use to find each other and exchange
//! negotiation payloads, plus the client side of that connection.

pub mod client;
pub mod error;
pub mod protocol;
pub mod room_registry;
pub mod server;

pub use client::{RendezvousClient, SignalingCommand, SignalingEvent};
pub use error::RendezvousError;
pub use protocol::{ClientMessage, ServerMessage, SignalPayload};
pub use room_registry::{Delivery, RegistryStats, RoomRegistry};
pub use server::{RendezvousHandle, RendezvousServer};
