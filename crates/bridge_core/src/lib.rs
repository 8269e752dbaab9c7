use std::sync::{Arc, Weak};

use anyhow::Result;
use futures::future::join_all;
use gateway::{GatewayConnector, MissingGatewayConnector};
use shared::error::ErrorCode;
use storage::BridgeStore;
use thiserror::Error;
use tracing::{info, warn};

pub mod config;
mod dispatch;
pub mod guild;
pub mod matrix;
pub mod membership;
pub mod portal;
pub mod puppet;
pub mod queue;
mod registry;
pub mod user;

pub use config::BridgeConfig;
pub use guild::Guild;
pub use matrix::{
    is_already_in_room_error, Intent, MatrixClient, MessageRelay, MissingMatrixClient,
    MissingMessageRelay,
};
pub use membership::{merge_direct_chats, DirectChatMode, DirectChats, MembershipCache};
pub use portal::Portal;
pub use puppet::Puppet;
pub use user::{User, UserStatus};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("not connected")]
    NotConnected,
    #[error("no token specified")]
    MissingToken,
    #[error("gateway session failed: {source}")]
    Gateway { source: anyhow::Error },
    #[error("failed to persist user: {source}")]
    Store { source: anyhow::Error },
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::NotLoggedIn | SessionError::MissingToken => ErrorCode::NotAuthenticated,
            SessionError::NotConnected => ErrorCode::NotConnected,
            SessionError::Gateway { .. } => ErrorCode::Relay,
            SessionError::Store { .. } => ErrorCode::Internal,
        }
    }
}

/// The bridge engine: identity registries, event ingestion and the
/// per-portal pipelines, wired to its outside collaborators.
pub struct Bridge {
    config: BridgeConfig,
    store: Arc<dyn BridgeStore>,
    connector: Arc<dyn GatewayConnector>,
    matrix: Arc<dyn MatrixClient>,
    relay: Arc<dyn MessageRelay>,
    registry: registry::Registry,
    memberships: MembershipCache,
    self_ref: Weak<Bridge>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, store: Arc<dyn BridgeStore>) -> Arc<Self> {
        Self::new_with_dependencies(
            config,
            store,
            Arc::new(MissingGatewayConnector),
            Arc::new(MissingMatrixClient),
            Arc::new(MissingMessageRelay),
        )
    }

    pub fn new_with_dependencies(
        config: BridgeConfig,
        store: Arc<dyn BridgeStore>,
        connector: Arc<dyn GatewayConnector>,
        matrix: Arc<dyn MatrixClient>,
        relay: Arc<dyn MessageRelay>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            store,
            connector,
            matrix,
            relay,
            registry: registry::Registry::default(),
            memberships: MembershipCache::default(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BridgeStore> {
        &self.store
    }

    pub fn memberships(&self) -> &MembershipCache {
        &self.memberships
    }

    /// Revalidates stored double puppets, then connects every logged-in
    /// user concurrently. Connect failures are logged per user.
    pub async fn start_users(&self) -> Result<()> {
        self.start_double_puppets().await?;

        let mut logged_in = Vec::new();
        for user in self.all_users().await? {
            if user.logged_in().await {
                logged_in.push(user);
            }
        }
        info!(users = logged_in.len(), "connecting users to gateway");

        let results = join_all(logged_in.iter().map(|user| self.connect(user))).await;
        for (user, result) in logged_in.iter().zip(results) {
            if let Err(err) = result {
                warn!(user = %user.mxid, code = ?err.code(), error = %err, "failed to connect user");
            }
        }
        Ok(())
    }

    /// Closes every open gateway session. Queued portal events are abandoned.
    pub async fn shutdown(&self) {
        let users = match self.all_users().await {
            Ok(users) => users,
            Err(err) => {
                warn!(error = %err, "failed to list users during shutdown");
                return;
            }
        };
        for user in users {
            if !user.connected().await {
                continue;
            }
            if let Err(err) = self.disconnect(&user).await {
                warn!(user = %user.mxid, error = %err, "failed to close gateway session");
            }
        }
        info!("bridge stopped");
    }

    pub async fn user_statuses(&self) -> Result<Vec<UserStatus>> {
        let mut statuses = Vec::new();
        for user in self.all_users().await? {
            statuses.push(user.status().await);
        }
        Ok(statuses)
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
