//! Channel store: channels cached per workspace.
//!
//! The cache map is persisted under [`CHANNELS_CACHE_KEY`] after every change
//! and restored with [`ChannelStore::hydrate`]. Only settled entries are
//! written; in-flight fetches are never persisted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use devchat_shared::{Channel, CreateChannelRequest, TransportError};
use futures_util::FutureExt;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use super::cache::{CacheEntry, EntityCache, EntryState, Loader, Snapshot};
use super::call;
use crate::api_client::Transport;
use crate::storage::{self, KeyValueStore, CHANNELS_CACHE_KEY};

pub const FAMILY: &str = "channels";

/// Durable subset of the channel store
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedChannels {
    pub channels_cache: HashMap<String, Vec<Channel>>,
    #[serde(default)]
    pub fetched_at: HashMap<String, DateTime<Utc>>,
}

impl PersistedChannels {
    fn from_entries(entries: Vec<CacheEntry<Channel>>) -> Self {
        let mut persisted = Self::default();
        for entry in entries {
            persisted.fetched_at.insert(entry.scope_key.clone(), entry.fetched_at);
            persisted
                .channels_cache
                .insert(entry.scope_key, entry.value.as_ref().clone());
        }
        persisted
    }

    fn into_entries(mut self) -> Vec<CacheEntry<Channel>> {
        let now = Utc::now();
        self.channels_cache
            .into_iter()
            .map(|(workspace_id, channels)| CacheEntry {
                fetched_at: self.fetched_at.remove(&workspace_id).unwrap_or(now),
                scope_key: workspace_id,
                value: Arc::new(channels),
            })
            .collect()
    }
}

#[derive(Default)]
struct WriterState {
    /// Newest snapshot not yet written
    pending: Option<Snapshot<Channel>>,
    written: u64,
    writing: bool,
}

/// Writes cache snapshots to storage in version order.
///
/// One caller at a time acts as the writer and drains `pending`; others only
/// replace it with a newer snapshot, so an older snapshot never lands after a
/// newer one and no caller blocks on a slow store.
struct CacheWriter {
    storage: Arc<dyn KeyValueStore>,
    state: Mutex<WriterState>,
}

impl CacheWriter {
    fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            state: Mutex::new(WriterState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn submit(&self, snapshot: Snapshot<Channel>) {
        {
            let mut state = self.lock();
            let superseded = snapshot.version <= state.written
                || state
                    .pending
                    .as_ref()
                    .is_some_and(|pending| pending.version >= snapshot.version);
            if superseded {
                return;
            }
            state.pending = Some(snapshot);
            if state.writing {
                return;
            }
            state.writing = true;
        }

        loop {
            let snapshot = {
                let mut state = self.lock();
                match state.pending.take() {
                    Some(snapshot) => snapshot,
                    None => {
                        state.writing = false;
                        return;
                    }
                }
            };

            let version = snapshot.version;
            let persisted = PersistedChannels::from_entries(snapshot.entries);
            if let Err(e) = storage::save(self.storage.as_ref(), CHANNELS_CACHE_KEY, &persisted) {
                tracing::warn!(error = %e, version, "failed to persist channel cache");
            }
            self.lock().written = version;
        }
    }
}

pub struct ChannelStore {
    cache: EntityCache<Channel>,
    transport: Arc<dyn Transport>,
    storage: Option<Arc<dyn KeyValueStore>>,
}

impl ChannelStore {
    pub fn new(
        transport: Arc<dyn Transport>,
        storage: Option<Arc<dyn KeyValueStore>>,
        max_age: Option<Duration>,
    ) -> Self {
        let mut cache = EntityCache::new(FAMILY, loader(Arc::clone(&transport))).with_max_age(max_age);

        if let Some(storage) = storage.clone() {
            let writer = CacheWriter::new(storage);
            cache = cache.with_change_hook(Arc::new(move |snapshot: Snapshot<Channel>| {
                writer.submit(snapshot);
            }));
        }

        Self {
            cache,
            transport,
            storage,
        }
    }

    /// Restore the persisted cache map. Corrupt state is dropped.
    pub fn hydrate(&self) -> usize {
        let Some(storage) = &self.storage else {
            return 0;
        };
        match storage::load::<PersistedChannels>(storage.as_ref(), CHANNELS_CACHE_KEY) {
            Ok(Some(persisted)) => {
                let entries = persisted.into_entries();
                let restored = entries.len();
                self.cache.hydrate(entries);
                tracing::debug!(workspaces = restored, "restored channel cache");
                restored
            }
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable channel cache");
                if let Err(e) = storage.remove_raw(CHANNELS_CACHE_KEY) {
                    tracing::warn!(error = %e, "failed to remove channel cache");
                }
                0
            }
        }
    }

    pub async fn fetch_workspace_channels(
        &self,
        workspace_id: &str,
        force_refresh: bool,
    ) -> Result<Arc<Vec<Channel>>, TransportError> {
        self.cache.fetch(workspace_id, force_refresh).await
    }

    /// Create a channel and return the server's copy of it.
    pub async fn create_channel(
        &self,
        workspace_id: &str,
        request: &CreateChannelRequest,
    ) -> Result<Channel, TransportError> {
        let body = serde_json::to_value(request)
            .map_err(|e| TransportError::rejected(format!("invalid channel request: {e}")))?;
        let envelope = call(
            self.transport.as_ref(),
            Method::POST,
            &format!("/workspace/channels/{workspace_id}"),
            Some(body),
            "Failed to create channel",
        )
        .await?;

        self.cache.invalidate(workspace_id);
        tracing::info!(workspace_id, name = %request.name, "channel created");

        envelope
            .channel
            .ok_or_else(|| TransportError::rejected("Channel created but missing from response"))
    }

    pub async fn delete_channel(
        &self,
        channel_id: &str,
        workspace_id: &str,
    ) -> Result<(), TransportError> {
        call(
            self.transport.as_ref(),
            Method::DELETE,
            &format!("/workspace/channels/{channel_id}"),
            None,
            "Failed to delete channel",
        )
        .await?;

        self.cache.invalidate(workspace_id);
        tracing::info!(workspace_id, channel_id, "channel deleted");
        Ok(())
    }

    pub async fn add_user_to_channel(
        &self,
        channel_id: &str,
        user_id: &str,
        workspace_id: &str,
    ) -> Result<(), TransportError> {
        call(
            self.transport.as_ref(),
            Method::POST,
            &format!("/workspace/channels/{channel_id}/users/{user_id}"),
            None,
            "Failed to add user to channel",
        )
        .await?;

        self.cache.invalidate(workspace_id);
        tracing::info!(workspace_id, channel_id, user_id, "user added to channel");
        Ok(())
    }

    pub async fn remove_user_from_channel(
        &self,
        channel_id: &str,
        user_id: &str,
        workspace_id: &str,
    ) -> Result<(), TransportError> {
        call(
            self.transport.as_ref(),
            Method::DELETE,
            &format!("/workspace/channels/{channel_id}/users/{user_id}"),
            None,
            "Failed to remove user from channel",
        )
        .await?;

        self.cache.invalidate(workspace_id);
        tracing::info!(workspace_id, channel_id, user_id, "user removed from channel");
        Ok(())
    }

    pub fn invalidate(&self, workspace_id: &str) -> bool {
        self.cache.invalidate(workspace_id)
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn peek(&self, workspace_id: &str) -> Option<Arc<Vec<Channel>>> {
        self.cache.peek(workspace_id)
    }

    pub fn state(&self, workspace_id: &str) -> Option<EntryState> {
        self.cache.state(workspace_id)
    }

    pub fn workspaces(&self) -> Vec<String> {
        self.cache.scopes()
    }
}

fn loader(transport: Arc<dyn Transport>) -> Loader<Channel> {
    Arc::new(move |workspace_id: String| {
        let transport = Arc::clone(&transport);
        async move {
            let envelope = call(
                transport.as_ref(),
                Method::GET,
                &format!("/workspace/channels/{workspace_id}"),
                None,
                "Failed to fetch channels",
            )
            .await?;
            Ok(envelope.channels.unwrap_or_default())
        }
        .boxed()
    })
}
