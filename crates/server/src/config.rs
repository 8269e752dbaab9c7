use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use bridge_core::BridgeConfig;
use serde::Deserialize;

const SETTINGS_FILE: &str = "bridge.toml";
const ENV_PREFIX: &str = "BRIDGE__";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Default tracing filter, `RUST_LOG` wins when set.
    pub log_level: String,
    pub bridge: BridgeConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:29334".into(),
            database_url: "sqlite://./data/bridge.db".into(),
            log_level: "info".into(),
            bridge: BridgeConfig::default(),
        }
    }
}

/// Defaults, then `bridge.toml` when present, then the environment.
pub fn load_settings() -> anyhow::Result<Settings> {
    let file = match fs::read_to_string(SETTINGS_FILE) {
        Ok(raw) => Some(raw),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return Err(err).with_context(|| format!("failed to read {SETTINGS_FILE}")),
    };
    let env: HashMap<String, String> = std::env::vars().collect();
    settings_from_sources(file.as_deref(), &env)
}

pub(crate) fn settings_from_sources(
    file: Option<&str>,
    env: &HashMap<String, String>,
) -> anyhow::Result<Settings> {
    let mut settings = match file {
        Some(raw) => toml::from_str::<Settings>(raw)
            .with_context(|| format!("failed to parse {SETTINGS_FILE}"))?,
        None => Settings::default(),
    };
    apply_env(&mut settings, env)?;
    settings.bridge.validate()?;
    Ok(settings)
}

fn apply_env(settings: &mut Settings, env: &HashMap<String, String>) -> anyhow::Result<()> {
    let var = |name: &str| env.get(name).filter(|v| !v.trim().is_empty()).cloned();
    let prefixed = |name: &str| var(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = prefixed("BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = prefixed("DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = prefixed("LOG_LEVEL") {
        settings.log_level = v;
    }

    let bridge = &mut settings.bridge;
    if let Some(v) = prefixed("HOMESERVER_DOMAIN") {
        bridge.homeserver_domain = v;
    }
    if let Some(v) = prefixed("BOT_LOCALPART") {
        bridge.bot_localpart = v;
    }
    if let Some(v) = prefixed("USERNAME_TEMPLATE") {
        bridge.username_template = v;
    }
    if let Some(v) = prefixed("FEDERATE_ROOMS") {
        bridge.federate_rooms = parse_var("FEDERATE_ROOMS", &v)?;
    }
    if let Some(v) = prefixed("SYNC_DIRECT_CHAT_LIST") {
        bridge.sync_direct_chat_list = parse_var("SYNC_DIRECT_CHAT_LIST", &v)?;
    }
    if let Some(v) = prefixed("DEFAULT_GUILD_BRIDGING") {
        bridge.default_guild_bridging = parse_var("DEFAULT_GUILD_BRIDGING", &v)?;
    }
    if let Some(v) = prefixed("PORTAL_QUEUE_CAPACITY") {
        bridge.portal_queue_capacity = parse_var("PORTAL_QUEUE_CAPACITY", &v)?;
    }
    Ok(())
}

fn parse_var<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value '{value}' for {ENV_PREFIX}{name}"))
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
