//! Shared wire types for skyfuse.
//!
//! Feeders, webhook subscribers and live viewers only need this crate.
//! The HTTP and WebSocket clients live behind the `client` feature.

pub mod objects;
pub mod signature;

#[cfg(feature = "client")]
pub mod client;
