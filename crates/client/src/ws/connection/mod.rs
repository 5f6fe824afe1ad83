//! Socket connection state and the transport seam.
//!
//! This module provides the shared types and includes the native
//! tokio-tungstenite implementation.

use devchat_shared::{ClientCommand, ConnectionName, ServerEvent, WsEnvelope};
use futures_channel::mpsc::UnboundedSender;
use tokio::sync::mpsc;

/// Observable status of one named connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Event reported by a connection's transport
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// The transport started dialing (first attempt or reconnect)
    Connecting,
    Connect,
    Disconnect { reason: String },
    Error { message: String },
    /// Domain change notification pushed by the server
    Server(ServerEvent),
}

impl SocketEvent {
    pub const CONNECTING: &'static str = "connecting";
    pub const CONNECT: &'static str = "connect";
    pub const DISCONNECT: &'static str = "disconnect";
    pub const ERROR: &'static str = "error";

    /// Listener key for this event
    pub fn name(&self) -> &'static str {
        match self {
            SocketEvent::Connecting => Self::CONNECTING,
            SocketEvent::Connect => Self::CONNECT,
            SocketEvent::Disconnect { .. } => Self::DISCONNECT,
            SocketEvent::Error { .. } => Self::ERROR,
            SocketEvent::Server(event) => event.name(),
        }
    }
}

/// Logical state of one of the three connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub name: ConnectionName,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub last_disconnect_reason: Option<String>,
}

impl ConnectionHandle {
    pub fn new(name: ConnectionName) -> Self {
        Self {
            name,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            last_disconnect_reason: None,
        }
    }

    /// Apply a lifecycle event. Domain events leave the handle untouched.
    pub fn observe(&mut self, event: &SocketEvent) {
        match event {
            SocketEvent::Connecting => self.status = ConnectionStatus::Connecting,
            SocketEvent::Connect => {
                self.status = ConnectionStatus::Connected;
                self.last_error = None;
            }
            SocketEvent::Disconnect { reason } => {
                self.status = ConnectionStatus::Disconnected;
                self.last_disconnect_reason = Some(reason.clone());
            }
            SocketEvent::Error { message } => {
                self.status = ConnectionStatus::Error;
                self.last_error = Some(message.clone());
            }
            SocketEvent::Server(_) => {}
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Configuration for transport-level reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> u32 {
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(attempt as i32);
        (delay as u32).min(self.max_delay_ms)
    }
}

/// Event as queued for the manager, tagged with the connection that produced it.
#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub name: ConnectionName,
    pub generation: u64,
    pub event: SocketEvent,
}

/// Where a connection reports its events.
///
/// The generation identifies one attached connection instance, so events from
/// a replaced connection still in the queue can be told apart.
#[derive(Debug, Clone)]
pub struct EventSink {
    name: ConnectionName,
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    pub(crate) fn new(
        name: ConnectionName,
        generation: u64,
        tx: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        Self {
            name,
            generation,
            tx,
        }
    }

    pub fn name(&self) -> ConnectionName {
        self.name
    }

    /// Returns false once the manager has stopped listening.
    pub fn emit(&self, event: SocketEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                name: self.name,
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{connection} connection closed")]
pub struct SendError {
    pub connection: ConnectionName,
}

/// A live connection as seen by the manager.
pub trait SocketConnection: Send + Sync {
    fn send(&self, cmd: ClientCommand) -> Result<(), SendError>;
    /// Stop the transport. No events are reported afterwards.
    fn close(&self);
}

/// Handle for sending commands through a connection
#[derive(Clone)]
pub struct WsHandle {
    sender: UnboundedSender<WsEnvelope<ClientCommand>>,
    pub name: ConnectionName,
}

impl WsHandle {
    pub(crate) fn new(sender: UnboundedSender<WsEnvelope<ClientCommand>>, name: ConnectionName) -> Self {
        Self { sender, name }
    }

    /// Send a command to the server
    pub fn send(&self, cmd: ClientCommand) -> Result<(), SendError> {
        tracing::debug!(connection = %self.name, ?cmd, "queueing command");
        self.sender
            .unbounded_send(WsEnvelope::new(cmd))
            .map_err(|_| SendError {
                connection: self.name,
            })
    }
}

mod connection_native;
pub use connection_native::WsConnection;
