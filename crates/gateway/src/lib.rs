use std::sync::Arc;

use async_trait::async_trait;
use shared::{domain::GuildId, protocol::GatewayEvent};

const CDN_BASE_URL: &str = "https://cdn.discordapp.com";

/// Receives every event a live session observes. Sessions may call this
/// concurrently from several tasks and in any order.
#[async_trait]
pub trait GatewayEventSink: Send + Sync {
    async fn dispatch(&self, event: GatewayEvent);
}

/// A live connection to the remote gateway for one account.
#[async_trait]
pub trait GatewaySession: Send + Sync {
    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait GatewayConnector: Send + Sync {
    /// Opens a session authenticated with `token`. Events start flowing
    /// into `sink` once the returned session is live.
    async fn connect(
        &self,
        token: &str,
        sink: Arc<dyn GatewayEventSink>,
    ) -> anyhow::Result<Arc<dyn GatewaySession>>;
}

pub struct MissingGatewayConnector;

#[async_trait]
impl GatewayConnector for MissingGatewayConnector {
    async fn connect(
        &self,
        _token: &str,
        _sink: Arc<dyn GatewayEventSink>,
    ) -> anyhow::Result<Arc<dyn GatewaySession>> {
        Err(anyhow::anyhow!("gateway transport is not configured"))
    }
}

pub fn guild_icon_url(guild_id: &GuildId, icon: &str) -> String {
    format!("{CDN_BASE_URL}/icons/{guild_id}/{icon}.png")
}
