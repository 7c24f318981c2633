//! Fakes and builders shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};

use crate::db::{GuildStore, StoreDefaults, StoreLocation};
use crate::model::{ChannelInfo, IncomingMessage, MessageRef, Occurrence};
use crate::source::{
    HistoryCursor, MemberSource, MessageSource, ReactionGateway, ReactionResult, SourceError,
};

pub fn defaults() -> StoreDefaults {
    StoreDefaults {
        marker_emoji: "♻️".to_string(),
        url_blacklist: vec!["https://skip.test/".to_string()],
    }
}

pub fn memory_store(guild: u64) -> GuildStore {
    GuildStore::open(GuildId::new(guild), &StoreLocation::Memory, defaults())
        .unwrap()
        .0
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

pub fn message(
    guild: u64,
    message_id: u64,
    channel: u64,
    author: u64,
    secs: i64,
    content: &str,
) -> IncomingMessage {
    IncomingMessage {
        guild_id: GuildId::new(guild),
        occurrence: Occurrence {
            message_id: MessageId::new(message_id),
            channel_id: ChannelId::new(channel),
            author_id: UserId::new(author),
            timestamp: ts(secs),
        },
        from_bot: false,
        content: content.to_string(),
        embed_urls: Vec::new(),
        own_reactions: Vec::new(),
    }
}

#[derive(Default)]
pub struct RecordingGateway {
    marked: Mutex<Vec<MessageRef>>,
    unmarked: Mutex<Vec<(MessageRef, String)>>,
    fail: bool,
}

impl RecordingGateway {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn marked(&self) -> Vec<MessageRef> {
        self.marked.lock().unwrap().clone()
    }

    pub fn unmarked(&self) -> Vec<(MessageRef, String)> {
        self.unmarked.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReactionGateway for RecordingGateway {
    async fn react(&self, _guild_id: GuildId, target: MessageRef, _emoji: &str) -> ReactionResult {
        if self.fail {
            return ReactionResult::Failed("missing permissions".to_string());
        }
        self.marked.lock().unwrap().push(target);
        ReactionResult::Applied
    }

    async fn unreact(&self, _guild_id: GuildId, target: MessageRef, emoji: &str) -> ReactionResult {
        if self.fail {
            return ReactionResult::Failed("missing permissions".to_string());
        }
        self.unmarked.lock().unwrap().push((target, emoji.to_string()));
        ReactionResult::Applied
    }
}

/// In-memory guild with channels, history and members.
#[derive(Default)]
pub struct FakeGuild {
    channels: Vec<ChannelInfo>,
    history: HashMap<ChannelId, Vec<IncomingMessage>>,
    denied: HashSet<ChannelId>,
    revoked_after_first_page: HashSet<ChannelId>,
    crashing: HashSet<ChannelId>,
    members: Mutex<Vec<UserId>>,
    pages_served: Mutex<HashMap<ChannelId, usize>>,
}

impl FakeGuild {
    pub fn with_channel(mut self, id: u64, name: &str) -> Self {
        self.channels.push(ChannelInfo {
            id: ChannelId::new(id),
            name: name.to_string(),
        });
        self
    }

    pub fn with_message(mut self, message: IncomingMessage) -> Self {
        self.history
            .entry(message.occurrence.channel_id)
            .or_default()
            .push(message);
        self
    }

    pub fn denying(mut self, channel: u64) -> Self {
        self.denied.insert(ChannelId::new(channel));
        self
    }

    pub fn revoking_after_first_page(mut self, channel: u64) -> Self {
        self.revoked_after_first_page.insert(ChannelId::new(channel));
        self
    }

    /// Reading this channel's history panics, standing in for a process crash.
    pub fn crashing_on(mut self, channel: u64) -> Self {
        self.crashing.insert(ChannelId::new(channel));
        self
    }

    pub fn set_members(&self, ids: &[u64]) {
        *self.members.lock().unwrap() = ids.iter().map(|id| UserId::new(*id)).collect();
    }
}

#[async_trait]
impl MessageSource for FakeGuild {
    async fn text_channels(&self, _guild_id: GuildId) -> Result<Vec<ChannelInfo>, SourceError> {
        Ok(self.channels.clone())
    }

    async fn history_page(
        &self,
        _guild_id: GuildId,
        channel_id: ChannelId,
        cursor: HistoryCursor,
        limit: u8,
    ) -> Result<Vec<IncomingMessage>, SourceError> {
        if self.denied.contains(&channel_id) {
            return Err(SourceError::AccessDenied(channel_id));
        }
        if self.crashing.contains(&channel_id) {
            panic!("process died while reading {}", channel_id);
        }
        {
            let mut served = self.pages_served.lock().unwrap();
            let count = served.entry(channel_id).or_default();
            if *count > 0 && self.revoked_after_first_page.contains(&channel_id) {
                return Err(SourceError::AccessDenied(channel_id));
            }
            *count += 1;
        }

        let mut page: Vec<IncomingMessage> = self
            .history
            .get(&channel_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| match cursor {
                        HistoryCursor::After(ts) => m.occurrence.timestamp > ts,
                        HistoryCursor::AfterMessage(id) => m.occurrence.message_id > id,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        page.sort_by_key(|m| m.occurrence.message_id);
        page.truncate(limit as usize);
        Ok(page)
    }
}

#[async_trait]
impl MemberSource for FakeGuild {
    async fn member_ids(&self, _guild_id: GuildId) -> Result<Vec<UserId>, SourceError> {
        Ok(self.members.lock().unwrap().clone())
    }
}
