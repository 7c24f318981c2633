//! Typed entities shared by the store, the classifier and the reconciler.

use chrono::{DateTime, Utc};
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};

/// One sighting of a URL: the message it appeared in and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub timestamp: DateTime<Utc>,
}

impl Occurrence {
    /// Total order used to decide which sighting is the original.
    /// Equal timestamps fall back to the snowflake id, then the channel.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId, ChannelId) {
        (self.timestamp, self.message_id, self.channel_id)
    }

    pub fn message(&self) -> MessageRef {
        MessageRef {
            message_id: self.message_id,
            channel_id: self.channel_id,
        }
    }

    pub fn is_same_message(&self, other: &Occurrence) -> bool {
        self.message() == other.message()
    }
}

/// Identity of a posted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
}

/// The occurrence currently considered the original post of `url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlHolder {
    pub url: String,
    pub holder: Occurrence,
}

/// A later (or demoted) occurrence of an already held URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepostEntry {
    pub url: String,
    pub occurrence: Occurrence,
}

/// Scalar per-guild settings and progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildState {
    pub active: bool,
    pub marker_emoji: String,
    pub watermark: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
}

/// A message as handed to the engine by a message source, live or historical.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub guild_id: GuildId,
    pub occurrence: Occurrence,
    pub from_bot: bool,
    pub content: String,
    pub embed_urls: Vec<String>,
    /// Reactions this bot has already put on the message.
    pub own_reactions: Vec<String>,
}

/// A text channel eligible for history scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
}
