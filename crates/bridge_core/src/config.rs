use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::Deserialize;
use shared::domain::{ChannelId, ContentUri, GuildId, MatrixUserId, RemoteUserId};

const USER_ID_PLACEHOLDER: &str = "{userid}";

/// Bridge behaviour knobs. Loaded from the `[bridge]` table of the server
/// settings file, every field has a usable default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub homeserver_domain: String,
    pub bot_localpart: String,
    /// Ghost localpart template, `{userid}` is replaced with the remote user ID.
    pub username_template: String,
    pub protocol_id: String,
    pub protocol_name: String,
    pub protocol_url: String,
    pub bot_avatar: Option<ContentUri>,
    pub bridge_info_prefix: String,
    pub federate_rooms: bool,
    pub sync_direct_chat_list: bool,
    /// Bridge flag given to guild memberships the bridge has never seen.
    pub default_guild_bridging: bool,
    pub portal_queue_capacity: usize,
    /// Shared-secret login keys, keyed by homeserver name.
    pub double_puppet_secrets: HashMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            homeserver_domain: "localhost".to_owned(),
            bot_localpart: "discordbot".to_owned(),
            username_template: "discord_{userid}".to_owned(),
            protocol_id: "discord".to_owned(),
            protocol_name: "Discord".to_owned(),
            protocol_url: "https://discord.com/".to_owned(),
            bot_avatar: None,
            bridge_info_prefix: "fi.mau.discord".to_owned(),
            federate_rooms: true,
            sync_direct_chat_list: false,
            default_guild_bridging: false,
            portal_queue_capacity: 128,
            double_puppet_secrets: HashMap::new(),
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.homeserver_domain.trim().is_empty() {
            bail!("bridge.homeserver_domain must not be empty");
        }
        if self.bot_localpart.trim().is_empty() {
            bail!("bridge.bot_localpart must not be empty");
        }
        if self.username_template.matches(USER_ID_PLACEHOLDER).count() != 1 {
            bail!("bridge.username_template must contain {USER_ID_PLACEHOLDER} exactly once");
        }
        if self.portal_queue_capacity == 0 {
            bail!("bridge.portal_queue_capacity must be greater than zero");
        }
        Ok(())
    }

    pub fn bot_mxid(&self) -> MatrixUserId {
        MatrixUserId::new(format!(
            "@{}:{}",
            self.bot_localpart, self.homeserver_domain
        ))
    }

    pub fn format_puppet_mxid(&self, remote_id: &RemoteUserId) -> MatrixUserId {
        let localpart = self
            .username_template
            .replace(USER_ID_PLACEHOLDER, remote_id.as_str());
        MatrixUserId::new(format!("@{localpart}:{}", self.homeserver_domain))
    }

    /// Inverse of [`BridgeConfig::format_puppet_mxid`]. Anything that is not
    /// one of our ghosts yields `None`.
    pub fn parse_puppet_mxid(&self, mxid: &MatrixUserId) -> Option<RemoteUserId> {
        if mxid.server_name()? != self.homeserver_domain {
            return None;
        }
        let (prefix, suffix) = self.username_template.split_once(USER_ID_PLACEHOLDER)?;
        let remote_id = mxid
            .localpart()?
            .strip_prefix(prefix)?
            .strip_suffix(suffix)?;
        if remote_id.is_empty() {
            return None;
        }
        Some(RemoteUserId::from(remote_id))
    }

    pub fn is_bridge_account(&self, mxid: &MatrixUserId) -> bool {
        *mxid == self.bot_mxid() || self.parse_puppet_mxid(mxid).is_some()
    }

    pub fn shared_secret_for(&self, mxid: &MatrixUserId) -> Option<&str> {
        let server = mxid.server_name()?;
        self.double_puppet_secrets
            .get(server)
            .map(String::as_str)
            .filter(|secret| !secret.is_empty())
    }

    pub fn guild_bridge_state_key(&self, guild_id: &GuildId) -> String {
        format!(
            "{}://{}/{}",
            self.bridge_info_prefix, self.protocol_id, guild_id
        )
    }

    pub fn portal_bridge_state_key(
        &self,
        guild_id: Option<&GuildId>,
        channel_id: &ChannelId,
    ) -> String {
        match guild_id {
            Some(guild_id) => format!(
                "{}://{}/{}/{}",
                self.bridge_info_prefix, self.protocol_id, guild_id, channel_id
            ),
            None => format!(
                "{}://{}/{}",
                self.bridge_info_prefix, self.protocol_id, channel_id
            ),
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
