//! Friend list store (single scope: the signed-in user).

use std::sync::Arc;
use std::time::Duration;

use devchat_shared::{Friend, TransportError, CURRENT_USER_SCOPE};
use futures_util::FutureExt;
use reqwest::Method;

use super::cache::{EntityCache, EntryState, Loader};
use super::call;
use crate::api_client::Transport;

pub const FAMILY: &str = "friends";

pub struct FriendStore {
    cache: EntityCache<Friend>,
    transport: Arc<dyn Transport>,
}

impl FriendStore {
    pub fn new(transport: Arc<dyn Transport>, max_age: Option<Duration>) -> Self {
        let loader: Loader<Friend> = {
            let transport = Arc::clone(&transport);
            Arc::new(move |_scope: String| {
                let transport = Arc::clone(&transport);
                async move {
                    let envelope = call(
                        transport.as_ref(),
                        Method::GET,
                        "/friends",
                        None,
                        "Failed to fetch friends",
                    )
                    .await?;
                    Ok(envelope.friends.unwrap_or_default())
                }
                .boxed()
            })
        };

        Self {
            cache: EntityCache::new(FAMILY, loader).with_max_age(max_age),
            transport,
        }
    }

    pub async fn fetch_friends(&self, force_refresh: bool) -> Result<Arc<Vec<Friend>>, TransportError> {
        self.cache.fetch(CURRENT_USER_SCOPE, force_refresh).await
    }

    pub async fn add_friend(&self, user_id: &str) -> Result<(), TransportError> {
        call(
            self.transport.as_ref(),
            Method::POST,
            &format!("/friends/{user_id}"),
            None,
            "Failed to add friend",
        )
        .await?;
        self.invalidate();
        tracing::info!(user_id, "friend added");
        Ok(())
    }

    pub async fn remove_friend(&self, user_id: &str) -> Result<(), TransportError> {
        call(
            self.transport.as_ref(),
            Method::DELETE,
            &format!("/friends/{user_id}"),
            None,
            "Failed to remove friend",
        )
        .await?;
        self.invalidate();
        tracing::info!(user_id, "friend removed");
        Ok(())
    }

    pub fn invalidate(&self) -> bool {
        self.cache.invalidate(CURRENT_USER_SCOPE)
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn peek(&self) -> Option<Arc<Vec<Friend>>> {
        self.cache.peek(CURRENT_USER_SCOPE)
    }

    pub fn state(&self) -> Option<EntryState> {
        self.cache.state(CURRENT_USER_SCOPE)
    }
}
