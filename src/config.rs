use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::db::StoreDefaults;
use crate::reconcile::MAX_PAGE_SIZE;

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub owner_id: Option<u64>,
    /// One SQLite file per guild lives here.
    pub database_dir: PathBuf,
    pub flush_interval: Duration,
    pub history_page_size: u8,
    pub default_marker_emoji: String,
    pub default_url_blacklist: Vec<String>,
    pub status_message: String,
    pub dev_guild_id: Option<u64>,
    pub register_commands: bool,
}

pub const DEFAULT_MARKER_EMOJI: &str = "♻️";
const DEFAULT_FLUSH_INTERVAL: &str = "15m";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        let flush_interval = env::var("FLUSH_INTERVAL")
            .unwrap_or_else(|_| DEFAULT_FLUSH_INTERVAL.to_string());
        let flush_interval = humantime::parse_duration(&flush_interval)
            .map_err(|e| anyhow::anyhow!("FLUSH_INTERVAL is not a duration: {}", e))?;
        if flush_interval.is_zero() {
            anyhow::bail!("FLUSH_INTERVAL must be greater than zero");
        }

        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            owner_id: env::var("OWNER_ID").ok().and_then(|id| id.parse().ok()),
            database_dir: env::var("DATABASE_DIR")
                .unwrap_or_else(|_| "data/guilds".to_string())
                .into(),
            flush_interval,
            history_page_size: env::var("HISTORY_PAGE_SIZE")
                .unwrap_or_else(|_| MAX_PAGE_SIZE.to_string())
                .parse::<u8>()
                .unwrap_or(MAX_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
            default_marker_emoji: env::var("DEFAULT_MARKER_EMOJI")
                .ok()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MARKER_EMOJI.to_string()),
            default_url_blacklist: env::var("DEFAULT_URL_BLACKLIST")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            status_message: env::var("STATUS_MESSAGE")
                .unwrap_or_else(|_| "Watching for reposts".to_string()),
            dev_guild_id: env::var("DEV_GUILD_ID").ok().and_then(|id| id.parse().ok()),
            register_commands: env::var("REGISTER_COMMANDS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        })
    }

    /// Settings new guild stores are seeded with.
    pub fn store_defaults(&self) -> StoreDefaults {
        StoreDefaults {
            marker_emoji: self.default_marker_emoji.clone(),
            url_blacklist: self.default_url_blacklist.clone(),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("owner_id", &self.owner_id)
            .field("database_dir", &self.database_dir)
            .field("flush_interval", &humantime::format_duration(self.flush_interval).to_string())
            .field("history_page_size", &self.history_page_size)
            .field("default_marker_emoji", &self.default_marker_emoji)
            .field("default_url_blacklist", &self.default_url_blacklist)
            .field("status_message", &self.status_message)
            .field("dev_guild_id", &self.dev_guild_id)
            .field("register_commands", &self.register_commands)
            .finish()
    }
}

/// Embed description limit is 4096 characters
pub const DISCORD_EMBED_LIMIT: usize = 4096;
