//! Removes every reaction this bot has placed across a guild's channel history.

use chrono::{DateTime, Utc};
use serenity::model::id::GuildId;
use tracing::{debug, info, warn};

use crate::model::ChannelInfo;
use crate::reconcile::MAX_PAGE_SIZE;
use crate::source::{HistoryCursor, MessageSource, ReactionGateway, ReactionResult, SourceError};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub channels_scanned: usize,
    pub channels_skipped: usize,
    pub messages: usize,
    pub removed: usize,
    pub failed: usize,
}

pub struct ReactionSweep<'a> {
    source: &'a dyn MessageSource,
    gateway: &'a dyn ReactionGateway,
    page_size: u8,
}

impl<'a> ReactionSweep<'a> {
    pub fn new(source: &'a dyn MessageSource, gateway: &'a dyn ReactionGateway) -> Self {
        Self {
            source,
            gateway,
            page_size: MAX_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u8) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Walks all text channels from the beginning, blacklisted ones included, since
    /// markers may predate the blacklist entry. Unreadable channels are skipped.
    pub async fn run(&self, guild_id: GuildId) -> Result<SweepReport, SourceError> {
        let channels = self.source.text_channels(guild_id).await?;
        let mut report = SweepReport::default();

        for channel in channels {
            match self.sweep_channel(guild_id, &channel, &mut report).await {
                Ok(()) => report.channels_scanned += 1,
                Err(SourceError::AccessDenied(_)) => {
                    warn!("#{} ({}) cannot be accessed; skipping", channel.name, channel.id);
                    report.channels_skipped += 1;
                }
                Err(e) => {
                    warn!("#{} ({}) history failed: {}; skipping", channel.name, channel.id, e);
                    report.channels_skipped += 1;
                }
            }
        }

        info!(
            "Guild {} swept: {} channels, {} skipped, {} reactions removed, {} failed",
            guild_id, report.channels_scanned, report.channels_skipped, report.removed, report.failed
        );
        Ok(report)
    }

    async fn sweep_channel(
        &self,
        guild_id: GuildId,
        channel: &ChannelInfo,
        report: &mut SweepReport,
    ) -> Result<(), SourceError> {
        let mut cursor = HistoryCursor::After(DateTime::<Utc>::MIN_UTC);
        loop {
            let page = self
                .source
                .history_page(guild_id, channel.id, cursor, self.page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = HistoryCursor::AfterMessage(last.occurrence.message_id);
            let exhausted = page.len() < self.page_size as usize;

            for message in &page {
                report.messages += 1;
                let target = message.occurrence.message();
                for emoji in &message.own_reactions {
                    match self.gateway.unreact(guild_id, target, emoji).await {
                        ReactionResult::Applied => report.removed += 1,
                        ReactionResult::Failed(e) => {
                            debug!("Could not remove {} from {}: {}", emoji, target.message_id, e);
                            report.failed += 1;
                        }
                    }
                }
            }

            if exhausted {
                break;
            }
        }
        Ok(())
    }
}
