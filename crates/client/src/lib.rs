//! Devchat Client - state synchronization layer
//!
//! This crate keeps client-side caches of channels, friends and workspace
//! roles consistent with the devchat server, using request/response calls
//! and three real-time socket connections.

pub mod api_client;
pub mod config;
pub mod storage;
pub mod stores;
pub mod sync;
pub mod ws;

#[cfg(test)]
mod testing;

pub use api_client::{ApiClient, Transport};
pub use config::ClientConfig;
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use sync::{MountGuard, SyncCoordinator, SyncNotice};
