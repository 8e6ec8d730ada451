//! Test utilities shared by the unit tests

pub mod async_helpers;
pub mod fixtures;
pub mod recording_transport;

pub use async_helpers::*;
pub use fixtures::*;
pub use recording_transport::*;
