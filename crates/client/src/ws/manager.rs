//! Owner of the three named socket connections.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use devchat_shared::{ClientCommand, ConnectionName};
use tokio::sync::mpsc;

use super::connection::{ConnectionHandle, EventSink, SendError, SocketConnection, SocketEvent, TaggedEvent};
use super::registry::{Handler, ListenerRegistry, ListenerStats, Subscription};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListenerLifecycleError {
    #[error("{0} connection is not available")]
    Unavailable(ConnectionName),
    #[error(transparent)]
    Send(#[from] SendError),
}

struct Slot {
    generation: u64,
    /// `None` only while the transport is being created
    connection: Option<Arc<dyn SocketConnection>>,
    handle: ConnectionHandle,
    /// Scopes to re-subscribe after every (re)connect
    scopes: BTreeSet<String>,
}

impl Slot {
    /// The transport, if it exists and the server is reachable through it
    fn live_connection(&self) -> Option<Arc<dyn SocketConnection>> {
        if !self.handle.is_connected() {
            return None;
        }
        self.connection.clone()
    }
}

#[derive(Default)]
struct ManagerState {
    next_generation: u64,
    slots: HashMap<ConnectionName, Slot>,
}

/// Tracks connection state per name and routes events to registered listeners.
///
/// Connections report into a single queue drained by [`SocketManager::run`];
/// reconnection stays inside each connection's transport.
pub struct SocketManager {
    state: Mutex<ManagerState>,
    registry: Arc<ListenerRegistry>,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TaggedEvent>>>,
}

impl Default for SocketManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketManager {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(ManagerState::default()),
            registry: ListenerRegistry::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a connection under `name`, replacing (and closing) any previous one.
    ///
    /// `connect` receives the sink the new connection must report to. Listeners
    /// registered against the replaced connection are released.
    pub fn connect<F>(&self, name: ConnectionName, connect: F)
    where
        F: FnOnce(EventSink) -> Arc<dyn SocketConnection>,
    {
        // The slot exists before the transport can report anything.
        let (generation, previous) = {
            let mut state = self.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            let previous = state.slots.insert(
                name,
                Slot {
                    generation,
                    connection: None,
                    handle: ConnectionHandle::new(name),
                    scopes: BTreeSet::new(),
                },
            );
            (generation, previous)
        };

        if let Some(previous) = previous {
            let released = self.registry.release_connection(name);
            if let Some(connection) = previous.connection {
                connection.close();
            }
            tracing::debug!(connection = %name, released, "replaced connection");
        } else {
            tracing::debug!(connection = %name, "attached connection");
        }

        let connection = connect(EventSink::new(name, generation, self.events_tx.clone()));

        let installed = {
            let mut state = self.lock();
            match state.slots.get_mut(&name) {
                Some(slot) if slot.generation == generation => {
                    slot.connection = Some(Arc::clone(&connection));
                    // a connect seen before the transport was stored had nothing to replay on
                    let pending = if slot.handle.is_connected() {
                        slot.scopes.iter().cloned().collect()
                    } else {
                        Vec::new()
                    };
                    Some(pending)
                }
                _ => None,
            }
        };
        match installed {
            Some(pending) => {
                for scope in pending {
                    if let Err(e) = connection.send(ClientCommand::Subscribe { scope }) {
                        tracing::warn!(connection = %name, error = %e, "failed to restore subscription");
                    }
                }
            }
            // replaced or torn down while the transport was created
            None => connection.close(),
        }
    }

    /// Close one connection and release its listeners.
    pub fn disconnect(&self, name: ConnectionName) -> bool {
        let removed = self.lock().slots.remove(&name);
        match removed {
            Some(slot) => {
                let released = self.registry.release_connection(name);
                if let Some(connection) = slot.connection {
                    connection.close();
                }
                tracing::debug!(connection = %name, released, "connection torn down");
                true
            }
            None => false,
        }
    }

    /// Tear down all three connections.
    pub fn teardown(&self) {
        for name in ConnectionName::ALL {
            self.disconnect(name);
        }
    }

    /// Whether a connection exists under `name`; listeners can only attach to available connections.
    pub fn is_available(&self, name: ConnectionName) -> bool {
        self.lock().slots.contains_key(&name)
    }

    /// Current handle, `None` if the connection was never created or was torn down
    pub fn handle(&self, name: ConnectionName) -> Option<ConnectionHandle> {
        self.lock().slots.get(&name).map(|slot| slot.handle.clone())
    }

    pub fn on(
        &self,
        name: ConnectionName,
        event: &'static str,
        handler: Handler,
    ) -> Result<Subscription, ListenerLifecycleError> {
        if !self.is_available(name) {
            return Err(ListenerLifecycleError::Unavailable(name));
        }
        Ok(self.registry.on(name, event, handler))
    }

    pub fn listener_stats(&self, name: ConnectionName, event: &str) -> ListenerStats {
        self.registry.stats(name, event)
    }

    pub fn active_listeners(&self, name: ConnectionName) -> usize {
        self.registry.active(name)
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Ask the server for events in `scope` on this connection. Remembered across reconnects.
    ///
    /// While the connection is not up the scope is only recorded; the next
    /// `connect` event sends it.
    pub fn subscribe(&self, name: ConnectionName, scope: &str) -> Result<(), ListenerLifecycleError> {
        let connection = {
            let mut state = self.lock();
            let slot = state
                .slots
                .get_mut(&name)
                .ok_or(ListenerLifecycleError::Unavailable(name))?;
            slot.scopes.insert(scope.to_string());
            slot.live_connection()
        };
        if let Some(connection) = connection {
            connection.send(ClientCommand::Subscribe {
                scope: scope.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn is_subscribed(&self, name: ConnectionName, scope: &str) -> bool {
        self.lock()
            .slots
            .get(&name)
            .is_some_and(|slot| slot.scopes.contains(scope))
    }

    pub fn unsubscribe(&self, name: ConnectionName, scope: &str) -> Result<(), ListenerLifecycleError> {
        let connection = {
            let mut state = self.lock();
            let slot = state
                .slots
                .get_mut(&name)
                .ok_or(ListenerLifecycleError::Unavailable(name))?;
            slot.scopes.remove(scope);
            slot.live_connection()
        };
        if let Some(connection) = connection {
            connection.send(ClientCommand::Unsubscribe {
                scope: scope.to_string(),
            })?;
        }
        Ok(())
    }

    /// Apply one queued event: update the handle, then call listeners.
    ///
    /// Events from a replaced or torn-down connection are dropped.
    pub fn dispatch(&self, tagged: TaggedEvent) {
        let TaggedEvent {
            name,
            generation,
            event,
        } = tagged;

        let resubscribe = {
            let mut state = self.lock();
            let Some(slot) = state.slots.get_mut(&name) else {
                tracing::trace!(connection = %name, event = event.name(), "dropping event for absent connection");
                return;
            };
            if slot.generation != generation {
                tracing::trace!(connection = %name, event = event.name(), "dropping event from replaced connection");
                return;
            }
            slot.handle.observe(&event);

            match &event {
                SocketEvent::Connect => slot
                    .live_connection()
                    .map(|connection| (connection, slot.scopes.iter().cloned().collect::<Vec<_>>())),
                _ => None,
            }
        };

        match &event {
            SocketEvent::Error { message } => {
                tracing::warn!(connection = %name, error = %message, "socket error");
            }
            SocketEvent::Disconnect { reason } => {
                tracing::info!(connection = %name, %reason, "socket disconnected");
            }
            _ => {}
        }

        if let Some((connection, scopes)) = resubscribe {
            for scope in scopes {
                if let Err(e) = connection.send(ClientCommand::Subscribe { scope }) {
                    tracing::warn!(connection = %name, error = %e, "failed to restore subscription");
                }
            }
        }

        for handler in self.registry.handlers(name, event.name()) {
            handler(&event);
        }
    }

    /// Drain the event queue until every sender is gone. Only the first call runs.
    pub async fn run(self: Arc<Self>) {
        let receiver = self
            .events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut receiver) = receiver else {
            tracing::warn!("socket event loop already running");
            return;
        };

        while let Some(tagged) = receiver.recv().await {
            self.dispatch(tagged);
        }
    }
}
