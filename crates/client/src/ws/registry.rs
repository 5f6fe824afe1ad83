//! Listener registry keyed by `(connection, event name)`.
//!
//! Every registration hands back a [`Subscription`]. Releasing it, explicitly
//! or by drop, performs the matching de-registration exactly once. The
//! manager can also release every listener of a connection when that
//! connection is replaced or torn down; a guard released afterwards is a
//! no-op, so each `on` is paired with one `off`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use devchat_shared::ConnectionName;

use super::connection::SocketEvent;

pub type Handler = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

/// Registration counters for one `(connection, event)` key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub on: usize,
    pub off: usize,
}

impl ListenerStats {
    pub fn is_balanced(&self) -> bool {
        self.on == self.off
    }
}

struct Listener {
    connection: ConnectionName,
    event: &'static str,
    handler: Handler,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    listeners: BTreeMap<u64, Listener>,
    stats: HashMap<(ConnectionName, &'static str), ListenerStats>,
}

#[derive(Default)]
pub struct ListenerRegistry {
    state: Mutex<RegistryState>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn on(
        self: &Arc<Self>,
        connection: ConnectionName,
        event: &'static str,
        handler: Handler,
    ) -> Subscription {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.listeners.insert(
            id,
            Listener {
                connection,
                event,
                handler,
            },
        );
        state.stats.entry((connection, event)).or_default().on += 1;

        Subscription {
            id,
            connection,
            event,
            registry: Arc::downgrade(self),
        }
    }

    /// Remove one listener. Returns false if it was already released.
    fn off(&self, id: u64) -> bool {
        let mut state = self.lock();
        match state.listeners.remove(&id) {
            Some(listener) => {
                state
                    .stats
                    .entry((listener.connection, listener.event))
                    .or_default()
                    .off += 1;
                true
            }
            None => false,
        }
    }

    /// Release every listener attached to `connection`.
    pub fn release_connection(&self, connection: ConnectionName) -> usize {
        let ids: Vec<u64> = self
            .lock()
            .listeners
            .iter()
            .filter(|(_, l)| l.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter(|id| self.off(*id)).count()
    }

    /// Handlers for an event, in registration order
    pub fn handlers(&self, connection: ConnectionName, event: &str) -> Vec<Handler> {
        self.lock()
            .listeners
            .values()
            .filter(|l| l.connection == connection && l.event == event)
            .map(|l| Arc::clone(&l.handler))
            .collect()
    }

    pub fn active(&self, connection: ConnectionName) -> usize {
        self.lock()
            .listeners
            .values()
            .filter(|l| l.connection == connection)
            .count()
    }

    pub fn stats(&self, connection: ConnectionName, event: &str) -> ListenerStats {
        self.lock()
            .stats
            .iter()
            .find(|((c, e), _)| *c == connection && *e == event)
            .map(|(_, stats)| *stats)
            .unwrap_or_default()
    }

    /// Counters for every key ever registered
    pub fn all_stats(&self) -> Vec<((ConnectionName, &'static str), ListenerStats)> {
        let mut all: Vec<_> = self.lock().stats.iter().map(|(k, v)| (*k, *v)).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

/// Guard for one registration. Dropping it de-registers the listener.
#[must_use = "dropping a subscription removes the listener"]
pub struct Subscription {
    id: u64,
    connection: ConnectionName,
    event: &'static str,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    pub fn connection(&self) -> ConnectionName {
        self.connection
    }

    pub fn event(&self) -> &'static str {
        self.event
    }

    pub fn off(self) {
        drop(self);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("connection", &self.connection)
            .field("event", &self.event)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.off(self.id);
        }
    }
}
