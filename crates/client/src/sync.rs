//! Keeps the entity caches consistent with server-confirmed state.
//!
//! The coordinator listens on the three socket connections, maps every event
//! to a cache action and announces each invalidation on a broadcast channel so
//! observers can re-read. Local mutations go through the same announcement
//! path once the store has invalidated the owning scope.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use devchat_shared::{
    Channel, ConnectionName, CreateChannelRequest, Friend, ServerEvent, TransportError, WorkspaceRole,
    CURRENT_USER_SCOPE,
};
use tokio::sync::broadcast;
use url::Url;

use crate::api_client::{ApiClient, Transport};
use crate::config::ClientConfig;
use crate::storage::{read_token, KeyValueStore, CHANNELS_CACHE_KEY, TOKEN_KEY};
use crate::stores::{channels, friends, roles, ChannelStore, FriendStore, RoleStore};
use crate::ws::{
    EventSink, ListenerLifecycleError, SocketConnection, SocketEvent, SocketManager, Subscription,
    WsConnection,
};

const NOTICE_CAPACITY: usize = 64;

/// What observers are told after the caches change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// One cache entry was dropped and should be re-read
    Invalidated { family: &'static str, scope: String },
    /// Every cache was dropped (logout)
    Cleared,
    /// A direct message arrived. No cache holds messages, so it is only forwarded.
    DirectMessage {
        conversation_id: String,
        message_id: String,
    },
    /// A connection changed state; read the handle for details
    Connection { name: ConnectionName },
}

/// Cache consequence of one socket event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheAction {
    InvalidateChannels { workspace_id: String },
    InvalidateRoles,
    InvalidateFriends,
}

/// Map a socket event to its cache action. Lifecycle events never touch caches.
pub fn plan(event: &SocketEvent) -> Option<CacheAction> {
    let SocketEvent::Server(event) = event else {
        return None;
    };
    match event {
        ServerEvent::WorkspaceRolesChanged {} => Some(CacheAction::InvalidateRoles),
        ServerEvent::FriendsChanged { .. } => Some(CacheAction::InvalidateFriends),
        ServerEvent::DirectMessage { .. } => None,
        // channel events carry their workspace
        _ => event.workspace_id().map(|workspace_id| CacheAction::InvalidateChannels {
            workspace_id: workspace_id.to_string(),
        }),
    }
}

/// Events the coordinator listens to on each connection
fn listened_events(name: ConnectionName) -> &'static [&'static str] {
    match name {
        ConnectionName::Channel => &[
            SocketEvent::CONNECT,
            SocketEvent::DISCONNECT,
            SocketEvent::ERROR,
            "channel.created",
            "channel.deleted",
            "channel.members",
            "workspace.roles",
        ],
        ConnectionName::Friends => &[
            SocketEvent::CONNECT,
            SocketEvent::DISCONNECT,
            SocketEvent::ERROR,
            "friends.changed",
        ],
        ConnectionName::Dm => &[
            SocketEvent::CONNECT,
            SocketEvent::DISCONNECT,
            SocketEvent::ERROR,
            "dm.message",
        ],
    }
}

pub struct SyncCoordinator {
    channels: ChannelStore,
    friends: FriendStore,
    roles: RoleStore,
    sockets: Arc<SocketManager>,
    storage: Arc<dyn KeyValueStore>,
    notices: broadcast::Sender<SyncNotice>,
    listeners: Mutex<HashMap<ConnectionName, Vec<Subscription>>>,
    mounted: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        storage: Arc<dyn KeyValueStore>,
        max_age: Option<Duration>,
    ) -> Arc<Self> {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Arc::new(Self {
            channels: ChannelStore::new(Arc::clone(&transport), Some(Arc::clone(&storage)), max_age),
            friends: FriendStore::new(Arc::clone(&transport), max_age),
            roles: RoleStore::new(transport, max_age),
            sockets: Arc::new(SocketManager::new()),
            storage,
            notices,
            listeners: Mutex::new(HashMap::new()),
            mounted: AtomicBool::new(false),
        })
    }

    /// Build the whole layer for a session.
    ///
    /// Restores the persisted channel cache and, only when a bearer token is
    /// stored, opens the three socket connections. Must be called inside a
    /// tokio runtime.
    pub fn start(config: &ClientConfig, storage: Arc<dyn KeyValueStore>) -> Arc<Self> {
        let transport = ApiClient::new(Arc::clone(&storage))
            .with_base_url(config.api_base_url.clone())
            .with_timeout(config.http_timeout);
        let coordinator = Self::new(Arc::new(transport), Arc::clone(&storage), config.cache_max_age);

        coordinator.channels.hydrate();
        tokio::spawn(Arc::clone(&coordinator.sockets).run());

        if read_token(storage.as_ref()).is_none() {
            tracing::info!("no stored credentials, socket connections not created");
            return coordinator;
        }

        for name in ConnectionName::ALL {
            let endpoint = match Url::parse(&config.ws_url(name.path())) {
                Ok(url) => url,
                Err(e) => {
                    tracing::error!(connection = %name, error = %e, "invalid socket URL");
                    continue;
                }
            };
            let storage = Arc::clone(&storage);
            let url_builder = move || {
                let token = read_token(storage.as_ref())?;
                let mut url = endpoint.clone();
                url.query_pairs_mut().append_pair("token", &token);
                Some(url.to_string())
            };
            let reconnect = config.reconnect.clone();
            coordinator.connect_socket(name, move |sink| {
                Arc::new(WsConnection::spawn(url_builder, sink, reconnect)) as Arc<dyn SocketConnection>
            });
        }

        coordinator
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<ConnectionName, Vec<Subscription>>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn channels(&self) -> &ChannelStore {
        &self.channels
    }

    pub fn friends(&self) -> &FriendStore {
        &self.friends
    }

    pub fn roles(&self) -> &RoleStore {
        &self.roles
    }

    pub fn sockets(&self) -> &Arc<SocketManager> {
        &self.sockets
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    fn notify(&self, notice: SyncNotice) {
        // no receivers is fine
        let _ = self.notices.send(notice);
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Attach listeners on every available connection. Dropping the guard unmounts.
    pub fn mount(self: &Arc<Self>) -> MountGuard {
        if self.mounted.swap(true, Ordering::SeqCst) {
            tracing::warn!("coordinator mounted twice, listeners are re-attached");
        }
        for name in ConnectionName::ALL {
            if self.sockets.is_available(name) {
                if let Err(e) = self.attach_listeners(name) {
                    tracing::warn!(connection = %name, error = %e, "failed to attach listeners");
                }
            }
        }
        MountGuard {
            coordinator: Arc::downgrade(self),
        }
    }

    /// Release every listener the coordinator registered.
    pub fn unmount(&self) {
        self.mounted.store(false, Ordering::SeqCst);
        let released: Vec<Subscription> = self.listeners().drain().flat_map(|(_, subs)| subs).collect();
        tracing::debug!(listeners = released.len(), "coordinator unmounted");
        drop(released);
    }

    /// (Re)attach the coordinator's listeners for one connection.
    ///
    /// Previous registrations for the connection are released first, so
    /// calling this repeatedly never stacks handlers.
    pub fn attach_listeners(self: &Arc<Self>, name: ConnectionName) -> Result<usize, ListenerLifecycleError> {
        let previous = self.listeners().remove(&name);
        drop(previous);

        let mut subscriptions = Vec::new();
        for &event_name in listened_events(name) {
            let coordinator = Arc::downgrade(self);
            let subscription = self.sockets.on(
                name,
                event_name,
                Arc::new(move |event: &SocketEvent| {
                    if let Some(coordinator) = Weak::upgrade(&coordinator) {
                        coordinator.apply(name, event);
                    }
                }),
            )?;
            subscriptions.push(subscription);
        }

        let attached = subscriptions.len();
        self.listeners().insert(name, subscriptions);
        tracing::debug!(connection = %name, attached, "listeners attached");
        Ok(attached)
    }

    /// Attach or replace a connection. While mounted, listeners follow the new connection.
    pub fn connect_socket<F>(self: &Arc<Self>, name: ConnectionName, connect: F)
    where
        F: FnOnce(EventSink) -> Arc<dyn SocketConnection>,
    {
        self.sockets.connect(name, connect);
        if self.is_mounted() {
            if let Err(e) = self.attach_listeners(name) {
                tracing::warn!(connection = %name, error = %e, "failed to attach listeners");
            }
        }
    }

    fn apply(&self, name: ConnectionName, event: &SocketEvent) {
        match plan(event) {
            Some(CacheAction::InvalidateChannels { workspace_id }) => {
                if self.channels.invalidate(&workspace_id) {
                    tracing::debug!(connection = %name, event = event.name(), %workspace_id, "channel cache invalidated");
                }
                self.notify(SyncNotice::Invalidated {
                    family: channels::FAMILY,
                    scope: workspace_id,
                });
            }
            Some(CacheAction::InvalidateRoles) => {
                self.roles.invalidate();
                self.notify(SyncNotice::Invalidated {
                    family: roles::FAMILY,
                    scope: CURRENT_USER_SCOPE.to_string(),
                });
            }
            Some(CacheAction::InvalidateFriends) => {
                self.friends.invalidate();
                self.notify(SyncNotice::Invalidated {
                    family: friends::FAMILY,
                    scope: CURRENT_USER_SCOPE.to_string(),
                });
            }
            None => match event {
                SocketEvent::Server(ServerEvent::DirectMessage {
                    conversation_id,
                    message_id,
                }) => self.notify(SyncNotice::DirectMessage {
                    conversation_id: conversation_id.clone(),
                    message_id: message_id.clone(),
                }),
                SocketEvent::Connect | SocketEvent::Disconnect { .. } | SocketEvent::Error { .. } => {
                    self.notify(SyncNotice::Connection { name })
                }
                _ => {}
            },
        }
    }

    // =========================================
    // Reads
    // =========================================

    /// Read a workspace's channels and follow its changes on the channel socket.
    pub async fn fetch_workspace_channels(
        &self,
        workspace_id: &str,
        force_refresh: bool,
    ) -> Result<Arc<Vec<Channel>>, TransportError> {
        let channels = self.channels.fetch_workspace_channels(workspace_id, force_refresh).await?;
        self.watch_workspace(workspace_id);
        Ok(channels)
    }

    pub async fn fetch_friends(&self, force_refresh: bool) -> Result<Arc<Vec<Friend>>, TransportError> {
        self.friends.fetch_friends(force_refresh).await
    }

    pub async fn fetch_roles(&self, force_refresh: bool) -> Result<Arc<Vec<WorkspaceRole>>, TransportError> {
        self.roles.fetch_roles(force_refresh).await
    }

    fn watch_workspace(&self, workspace_id: &str) {
        let name = ConnectionName::Channel;
        if !self.sockets.is_available(name) || self.sockets.is_subscribed(name, workspace_id) {
            return;
        }
        if let Err(e) = self.sockets.subscribe(name, workspace_id) {
            tracing::warn!(workspace_id, error = %e, "failed to subscribe to workspace events");
        }
    }

    // =========================================
    // Mutations
    // =========================================

    fn channels_changed(&self, workspace_id: &str) {
        self.notify(SyncNotice::Invalidated {
            family: channels::FAMILY,
            scope: workspace_id.to_string(),
        });
    }

    fn friends_changed(&self) {
        self.notify(SyncNotice::Invalidated {
            family: friends::FAMILY,
            scope: CURRENT_USER_SCOPE.to_string(),
        });
    }

    pub async fn create_channel(
        &self,
        workspace_id: &str,
        request: &CreateChannelRequest,
    ) -> Result<Channel, TransportError> {
        let channel = self.channels.create_channel(workspace_id, request).await?;
        self.channels_changed(workspace_id);
        Ok(channel)
    }

    pub async fn delete_channel(&self, channel_id: &str, workspace_id: &str) -> Result<(), TransportError> {
        self.channels.delete_channel(channel_id, workspace_id).await?;
        self.channels_changed(workspace_id);
        Ok(())
    }

    pub async fn add_user_to_channel(
        &self,
        channel_id: &str,
        user_id: &str,
        workspace_id: &str,
    ) -> Result<(), TransportError> {
        self.channels
            .add_user_to_channel(channel_id, user_id, workspace_id)
            .await?;
        self.channels_changed(workspace_id);
        Ok(())
    }

    pub async fn remove_user_from_channel(
        &self,
        channel_id: &str,
        user_id: &str,
        workspace_id: &str,
    ) -> Result<(), TransportError> {
        self.channels
            .remove_user_from_channel(channel_id, user_id, workspace_id)
            .await?;
        self.channels_changed(workspace_id);
        Ok(())
    }

    pub async fn add_friend(&self, user_id: &str) -> Result<(), TransportError> {
        self.friends.add_friend(user_id).await?;
        self.friends_changed();
        Ok(())
    }

    pub async fn remove_friend(&self, user_id: &str) -> Result<(), TransportError> {
        self.friends.remove_friend(user_id).await?;
        self.friends_changed();
        Ok(())
    }

    /// Forget the session: caches, persisted state, credential and connections.
    pub fn logout(&self) {
        self.channels.invalidate_all();
        self.friends.invalidate_all();
        self.roles.invalidate_all();

        for key in [CHANNELS_CACHE_KEY, TOKEN_KEY] {
            if let Err(e) = self.storage.remove_raw(key) {
                tracing::warn!(key, error = %e, "failed to clear persisted state");
            }
        }

        self.unmount();
        self.sockets.teardown();
        self.notify(SyncNotice::Cleared);
        tracing::info!("logged out");
    }
}

/// Keeps the coordinator's listeners attached while alive
#[must_use = "dropping the guard unmounts the coordinator"]
pub struct MountGuard {
    coordinator: Weak<SyncCoordinator>,
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.unmount();
        }
    }
}
