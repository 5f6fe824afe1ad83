//! Real-time connections to the devchat socket endpoints.
//!
//! This module provides:
//! - Three named connections (`dm`, `channels`, `friends`) with auto-reconnect
//! - Connection state tracking per name
//! - A listener registry where every registration is released exactly once
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐ ┌────────────┐ ┌────────────┐
//! │WsConnection│ │WsConnection│ │WsConnection│
//! │   (dm)     │ │ (channels) │ │ (friends)  │
//! └────────────┘ └────────────┘ └────────────┘
//!        │              │              │
//!        └──────────────┼──────────────┘
//!                       ▼  TaggedEvent queue
//!              ┌─────────────────────┐
//!              │    SocketManager    │
//!              │ (handles, registry) │
//!              └─────────────────────┘
//!                       │  listeners
//!                       ▼
//!              ┌─────────────────────┐
//!              │   SyncCoordinator   │
//!              │ (cache invalidation)│
//!              └─────────────────────┘
//! ```
//!
//! Transports never touch caches. They report lifecycle and server events;
//! the sync layer decides what each event means for cached data.

pub mod connection;
pub mod manager;
pub mod registry;

pub use connection::{
    ConnectionHandle, ConnectionStatus, EventSink, ReconnectConfig, SendError, SocketConnection,
    SocketEvent, TaggedEvent, WsConnection, WsHandle,
};
pub use manager::{ListenerLifecycleError, SocketManager};
pub use registry::{Handler, ListenerRegistry, ListenerStats, Subscription};
