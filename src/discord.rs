//! serenity-backed implementations of the message, member and reaction seams.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use poise::serenity_prelude as serenity;
use serenity::{ChannelId, ChannelType, GetMessages, GuildId, MessageId, UserId};
use tracing::{debug, warn};

use crate::emoji::{resolve_marker, KnownEmoji};
use crate::model::{ChannelInfo, IncomingMessage, MessageRef, Occurrence};
use crate::source::{
    HistoryCursor, MemberSource, MessageSource, ReactionGateway, ReactionResult, SourceError,
};

/// First millisecond of 2015, the origin of Discord snowflakes.
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;
const MEMBER_PAGE_SIZE: u64 = 1000;

pub struct DiscordGateway {
    http: Arc<serenity::Http>,
}

impl DiscordGateway {
    pub fn new(http: Arc<serenity::Http>) -> Self {
        Self { http }
    }

    pub async fn guild_emojis(&self, guild_id: GuildId) -> Result<Vec<KnownEmoji>, serenity::Error> {
        let emojis = guild_id.emojis(&self.http).await?;
        Ok(emojis
            .into_iter()
            .map(|e| KnownEmoji {
                id: e.id,
                name: e.name,
                animated: e.animated,
            })
            .collect())
    }
}

/// Creation time encoded in a snowflake. Messages are stamped with exactly this.
pub fn snowflake_time(id: u64) -> DateTime<Utc> {
    let ms = (id >> 22) + DISCORD_EPOCH_MS;
    DateTime::from_timestamp_millis(ms as i64).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Smallest snowflake that could have been created at `ts`.
pub fn snowflake_at(ts: DateTime<Utc>) -> MessageId {
    let ms = ts.timestamp_millis().max(0) as u64;
    let id = ms.saturating_sub(DISCORD_EPOCH_MS) << 22;
    MessageId::new(id.max(1))
}

/// Converts a gateway or HTTP message into the engine's view of it, inside `guild_id`.
pub fn incoming_in(guild_id: GuildId, message: &serenity::Message) -> IncomingMessage {
    IncomingMessage {
        guild_id,
        occurrence: Occurrence {
            message_id: message.id,
            channel_id: message.channel_id,
            author_id: message.author.id,
            timestamp: snowflake_time(message.id.get()),
        },
        from_bot: message.author.bot,
        content: message.content.clone(),
        embed_urls: message.embeds.iter().filter_map(|e| e.url.clone()).collect(),
        own_reactions: message
            .reactions
            .iter()
            .filter(|r| r.me)
            .map(|r| r.reaction_type.to_string())
            .collect(),
    }
}

/// Same as [`incoming_in`] for messages that carry their own guild id. Direct
/// messages have none and yield `None`.
pub fn incoming_from(message: &serenity::Message) -> Option<IncomingMessage> {
    message.guild_id.map(|guild_id| incoming_in(guild_id, message))
}

fn is_forbidden(err: &serenity::Error) -> bool {
    match err {
        serenity::Error::Http(e) => e.status_code().map(|s| s.as_u16()) == Some(403),
        _ => false,
    }
}

fn history_error(channel_id: ChannelId, err: serenity::Error) -> SourceError {
    if is_forbidden(&err) {
        SourceError::AccessDenied(channel_id)
    } else {
        SourceError::Transport(err.to_string())
    }
}

#[async_trait]
impl MessageSource for DiscordGateway {
    async fn text_channels(&self, guild_id: GuildId) -> Result<Vec<ChannelInfo>, SourceError> {
        let channels = guild_id
            .channels(&self.http)
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let mut text: Vec<ChannelInfo> = channels
            .into_values()
            .filter(|c| matches!(c.kind, ChannelType::Text | ChannelType::News))
            .map(|c| ChannelInfo {
                id: c.id,
                name: c.name,
            })
            .collect();
        text.sort_by_key(|c| c.id);
        Ok(text)
    }

    async fn history_page(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        cursor: HistoryCursor,
        limit: u8,
    ) -> Result<Vec<IncomingMessage>, SourceError> {
        let after = match cursor {
            HistoryCursor::After(ts) => snowflake_at(ts),
            HistoryCursor::AfterMessage(id) => id,
        };
        debug!("Fetching up to {} messages in {} after {}", limit, channel_id, after);

        let mut messages = channel_id
            .messages(&self.http, GetMessages::new().after(after).limit(limit))
            .await
            .map_err(|e| history_error(channel_id, e))?;
        messages.sort_by_key(|m| m.id);

        Ok(messages.iter().map(|m| incoming_in(guild_id, m)).collect())
    }
}

#[async_trait]
impl MemberSource for DiscordGateway {
    async fn member_ids(&self, guild_id: GuildId) -> Result<Vec<UserId>, SourceError> {
        let mut ids = Vec::new();
        let mut after: Option<UserId> = None;
        loop {
            let page = guild_id
                .members(&self.http, Some(MEMBER_PAGE_SIZE), after)
                .await
                .map_err(|e| SourceError::Transport(e.to_string()))?;
            let full = page.len() as u64 == MEMBER_PAGE_SIZE;
            after = page.last().map(|m| m.user.id);
            ids.extend(page.into_iter().map(|m| m.user.id));
            if !full || after.is_none() {
                break;
            }
        }
        Ok(ids)
    }
}

impl DiscordGateway {
    /// Guild emojis are only fetched when the text is neither markup nor Unicode.
    async fn reaction_for(
        &self,
        guild_id: GuildId,
        emoji: &str,
    ) -> Result<serenity::ReactionType, String> {
        if let Ok(reaction) = resolve_marker(emoji, &[]) {
            return Ok(reaction);
        }
        let known = self.guild_emojis(guild_id).await.map_err(|e| e.to_string())?;
        resolve_marker(emoji, &known).map_err(|e| {
            warn!("Guild {} marker emoji is unusable: {}", guild_id, e);
            e.to_string()
        })
    }
}

#[async_trait]
impl ReactionGateway for DiscordGateway {
    async fn react(&self, guild_id: GuildId, target: MessageRef, emoji: &str) -> ReactionResult {
        let reaction = match self.reaction_for(guild_id, emoji).await {
            Ok(reaction) => reaction,
            Err(e) => return ReactionResult::Failed(e),
        };

        match target
            .channel_id
            .create_reaction(&self.http, target.message_id, reaction)
            .await
        {
            Ok(()) => ReactionResult::Applied,
            Err(e) => ReactionResult::Failed(e.to_string()),
        }
    }

    async fn unreact(&self, guild_id: GuildId, target: MessageRef, emoji: &str) -> ReactionResult {
        let reaction = match self.reaction_for(guild_id, emoji).await {
            Ok(reaction) => reaction,
            Err(e) => return ReactionResult::Failed(e),
        };

        // No user id: removes the bot's own reaction.
        match target
            .channel_id
            .delete_reaction(&self.http, target.message_id, None, reaction)
            .await
        {
            Ok(()) => ReactionResult::Applied,
            Err(e) => ReactionResult::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snowflakes_round_trip_through_time() {
        // Created 2016-04-30 11:18:25.796 UTC.
        let id = 175_928_847_299_117_063u64;
        let ts = snowflake_time(id);
        assert_eq!(ts.timestamp_millis(), 1_462_015_105_796);

        let lower = snowflake_at(ts);
        assert!(lower.get() <= id);
        assert_eq!(snowflake_time(lower.get()), ts);
    }

    #[test]
    fn times_before_the_epoch_clamp_to_the_first_snowflake() {
        let ts = DateTime::from_timestamp(0, 0).unwrap();
        assert_eq!(snowflake_at(ts), MessageId::new(1));
    }

    #[test]
    fn converts_guild_messages() {
        let mut message = serenity::Message::default();
        message.id = MessageId::new(175_928_847_299_117_063);
        message.channel_id = ChannelId::new(5);
        message.author.id = UserId::new(9);
        message.author.bot = true;
        message.content = "see https://a.test".to_string();

        assert!(incoming_from(&message).is_none());

        message.guild_id = Some(GuildId::new(3));
        let incoming = incoming_from(&message).unwrap();
        assert_eq!(incoming.guild_id, GuildId::new(3));
        assert!(incoming.from_bot);
        assert_eq!(incoming.occurrence.author_id, UserId::new(9));
        assert_eq!(incoming.occurrence.timestamp.timestamp_millis(), 1_462_015_105_796);
        assert!(incoming.embed_urls.is_empty());
        assert!(incoming.own_reactions.is_empty());
    }
}
