//! VLAN bridge network driver for container runtimes
//!
//! This crate manages durable, concurrency-safe state for networks and their
//! endpoints, and keeps the kernel topology in line with it:
//! - a VLAN sub-interface on the physical uplink and a bridge per network,
//!   created with the first endpoint and removed with the last
//! - a veth pair per endpoint, host side attached to the bridge
//! - network and endpoint records in a key-value store, replayed on startup

pub mod commands;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod link;
pub mod manager;
pub mod network;
pub mod options;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use config::PolypConfig;
pub use error::{Error, Result};
pub use manager::ResourceManager;
pub use options::NetworkOptions;
