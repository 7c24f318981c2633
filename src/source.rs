//! Seams to the chat platform. `crate::discord` implements these over serenity;
//! tests use in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};

use crate::model::{ChannelInfo, IncomingMessage, MessageRef};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("access to channel {0} was denied")]
    AccessDenied(ChannelId),
    #[error("{0}")]
    Transport(String),
}

/// Where the next history page starts (exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryCursor {
    After(DateTime<Utc>),
    AfterMessage(MessageId),
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Text channels of the guild that can hold URL posts.
    async fn text_channels(&self, guild_id: GuildId) -> Result<Vec<ChannelInfo>, SourceError>;

    /// Up to `limit` messages strictly after `cursor`, oldest first.
    async fn history_page(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        cursor: HistoryCursor,
        limit: u8,
    ) -> Result<Vec<IncomingMessage>, SourceError>;
}

#[async_trait]
pub trait MemberSource: Send + Sync {
    async fn member_ids(&self, guild_id: GuildId) -> Result<Vec<UserId>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionResult {
    Applied,
    Failed(String),
}

#[async_trait]
pub trait ReactionGateway: Send + Sync {
    /// Puts `emoji` on `target`. Failures are reported, never retried.
    async fn react(&self, guild_id: GuildId, target: MessageRef, emoji: &str) -> ReactionResult;

    /// Takes this bot's own `emoji` reaction off `target`.
    async fn unreact(&self, guild_id: GuildId, target: MessageRef, emoji: &str) -> ReactionResult;
}
