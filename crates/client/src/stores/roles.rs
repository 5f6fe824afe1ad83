//! Workspace roles of the signed-in user.

use std::sync::Arc;
use std::time::Duration;

use devchat_shared::{TransportError, WorkspaceRole, CURRENT_USER_SCOPE};
use futures_util::FutureExt;
use reqwest::Method;

use super::cache::{EntityCache, EntryState, Loader};
use super::call;
use crate::api_client::Transport;

pub const FAMILY: &str = "roles";

pub struct RoleStore {
    cache: EntityCache<WorkspaceRole>,
}

impl RoleStore {
    pub fn new(transport: Arc<dyn Transport>, max_age: Option<Duration>) -> Self {
        let loader: Loader<WorkspaceRole> = Arc::new(move |_scope: String| {
            let transport = Arc::clone(&transport);
            async move {
                let envelope = call(
                    transport.as_ref(),
                    Method::GET,
                    "/workspace/roles",
                    None,
                    "Failed to fetch workspace roles",
                )
                .await?;
                Ok(envelope.roles.unwrap_or_default())
            }
            .boxed()
        });

        Self {
            cache: EntityCache::new(FAMILY, loader).with_max_age(max_age),
        }
    }

    pub async fn fetch_roles(
        &self,
        force_refresh: bool,
    ) -> Result<Arc<Vec<WorkspaceRole>>, TransportError> {
        self.cache.fetch(CURRENT_USER_SCOPE, force_refresh).await
    }

    /// Role held in one workspace, read through the cache
    pub async fn role_in(&self, workspace_id: &str) -> Result<Option<WorkspaceRole>, TransportError> {
        let roles = self.fetch_roles(false).await?;
        Ok(roles.iter().find(|r| r.workspace_id == workspace_id).cloned())
    }

    pub fn invalidate(&self) -> bool {
        self.cache.invalidate(CURRENT_USER_SCOPE)
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn state(&self) -> Option<EntryState> {
        self.cache.state(CURRENT_USER_SCOPE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use devchat_shared::Role;
    use serde_json::json;

    #[tokio::test]
    async fn role_lookup_reads_through_cache() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            Method::GET,
            "/workspace/roles",
            Ok(json!({
                "success": true,
                "roles": [
                    { "_id": "r1", "workspaceId": "W1", "role": "owner" },
                    { "_id": "r2", "workspaceId": "W2", "role": "member" }
                ]
            })),
        );
        let store = RoleStore::new(transport.clone(), None);

        let owner = store.role_in("W1").await.unwrap().unwrap();
        assert_eq!(owner.role, Role::Owner);
        assert!(store.role_in("W9").await.unwrap().is_none());
        assert_eq!(transport.calls_to(&Method::GET, "/workspace/roles"), 1);
    }
}
