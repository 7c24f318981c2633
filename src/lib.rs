pub mod classifier;
pub mod commands;
pub mod config;
pub mod db;
pub mod discord;
pub mod emoji;
pub mod extract;
pub mod flush;
pub mod model;
pub mod reconcile;
pub mod review;
pub mod roster;
pub mod source;
pub mod sweep;
pub mod tracker;

#[cfg(test)]
mod testing;

/// Custom data passed to all commands
pub struct Data {
    pub config: config::Config,
    pub tracker: std::sync::Arc<tracker::RepostTracker>,
    pub gateway: std::sync::Arc<discord::DiscordGateway>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
