//! Catch-up scan over channel history after downtime.

use chrono::{DateTime, Utc};
use serenity::model::id::ChannelId;
use tracing::{debug, info, warn};

use crate::classifier::Outcome;
use crate::db::{GuildStore, StoreError};
use crate::model::ChannelInfo;
use crate::review::replay_message;
use crate::source::{HistoryCursor, MessageSource, ReactionGateway, SourceError};

/// Discord serves at most 100 messages per history request.
pub const MAX_PAGE_SIZE: u8 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not list channels: {0}")]
    Channels(#[source] SourceError),
}

#[derive(Debug, thiserror::Error)]
enum ChannelScanError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inactive: bool,
    pub scanned_from: Option<DateTime<Utc>>,
    pub channels_scanned: usize,
    pub channels_skipped: Vec<ChannelId>,
    pub messages: usize,
    pub new_urls: usize,
    pub reposts: usize,
    pub reverse_reposts: usize,
    /// Newest message replayed; the watermark moves here once the pass completes.
    pub reviewed_through: Option<DateTime<Utc>>,
}

pub struct Reconciler<'a> {
    source: &'a dyn MessageSource,
    gateway: &'a dyn ReactionGateway,
    page_size: u8,
}

impl<'a> Reconciler<'a> {
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

    /// Replays everything after the stored watermark.
    pub async fn reconcile(&self, store: &mut GuildStore) -> Result<ReconcileReport, ReconcileError> {
        self.reconcile_from(store, None).await
    }

    /// Replays history after `since`, or after the watermark when `since` is `None`.
    ///
    /// Every channel is scanned from the same starting point. The watermark is only
    /// advanced after the last channel, so an interrupted pass is replayed in full next
    /// time. A channel that cannot be read is logged and skipped; only store failures
    /// abort the pass.
    pub async fn reconcile_from(
        &self,
        store: &mut GuildStore,
        since: Option<DateTime<Utc>>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let guild_id = store.guild_id();
        let state = store.state()?;
        let mut report = ReconcileReport::default();

        if !state.active {
            info!("Guild {} is inactive; skipping history scan", guild_id);
            report.inactive = true;
            return Ok(report);
        }

        let start = match since {
            Some(ts) => {
                store.note_scan_start(ts)?;
                ts
            }
            None => state.watermark,
        };
        report.scanned_from = Some(start);
        info!("Updating channels in guild {} since {}", guild_id, start);

        let blacklist = store.channel_blacklist()?;
        let channels = self
            .source
            .text_channels(guild_id)
            .await
            .map_err(ReconcileError::Channels)?;

        for channel in channels {
            if blacklist.contains(&channel.id) {
                warn!("#{} ({}) is blacklisted", channel.name, channel.id);
                continue;
            }

            match self.scan_channel(store, &channel, start, &mut report).await {
                Ok(messages) => {
                    report.channels_scanned += 1;
                    debug!("#{}: {} messages reviewed", channel.name, messages);
                }
                Err(ChannelScanError::Source(SourceError::AccessDenied(_))) => {
                    warn!("#{} ({}) cannot be accessed; skipping", channel.name, channel.id);
                    report.channels_skipped.push(channel.id);
                }
                Err(ChannelScanError::Source(e)) => {
                    warn!("#{} ({}) history failed: {}; skipping", channel.name, channel.id, e);
                    report.channels_skipped.push(channel.id);
                }
                Err(ChannelScanError::Store(e)) => return Err(e.into()),
            }
        }

        if let Some(ts) = report.reviewed_through {
            store.advance_watermark(ts)?;
        }

        info!(
            "Guild {} updated: {} channels, {} skipped, {} messages, {} new URLs, {} reposts, {} reverse reposts",
            guild_id,
            report.channels_scanned,
            report.channels_skipped.len(),
            report.messages,
            report.new_urls,
            report.reposts,
            report.reverse_reposts
        );
        Ok(report)
    }

    async fn scan_channel(
        &self,
        store: &mut GuildStore,
        channel: &ChannelInfo,
        start: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<usize, ChannelScanError> {
        let guild_id = store.guild_id();
        let mut cursor = HistoryCursor::After(start);
        let mut reviewed = 0usize;

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
                let review = replay_message(store, message, self.gateway).await?;
                reviewed += 1;
                let ts = message.occurrence.timestamp;
                report.reviewed_through = Some(report.reviewed_through.map_or(ts, |t| t.max(ts)));
                report.messages += 1;
                report.new_urls += review.count(|o| *o == Outcome::New);
                report.reposts += review.count(|o| *o == Outcome::Repost);
                report.reverse_reposts +=
                    review.count(|o| matches!(o, Outcome::ReverseRepost { .. }));
            }

            if exhausted {
                break;
            }
        }
        Ok(reviewed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RepostFilter, StoreLocation};
    use crate::review::review_message;
    use crate::testing::{defaults, memory_store, message, ts, FakeGuild, RecordingGateway};
    use serenity::model::id::GuildId;
    use serenity::model::id::UserId;

    const U1: &str = "https://u1.test/clip";

    #[tokio::test]
    async fn replays_history_in_order_across_pages() {
        let mut store = memory_store(1);
        let base = store.watermark().unwrap().timestamp();

        let mut guild = FakeGuild::default().with_channel(1, "general");
        for i in 1..=5u64 {
            guild = guild.with_message(message(1, i, 1, i, base + i as i64, U1));
        }
        let gateway = RecordingGateway::default();

        let report = Reconciler::new(&guild, &gateway)
            .with_page_size(2)
            .reconcile(&mut store)
            .await
            .unwrap();

        assert_eq!(report.messages, 5);
        assert_eq!(report.new_urls, 1);
        assert_eq!(report.reposts, 4);
        assert_eq!(store.holder(U1).unwrap().unwrap().holder.author_id, UserId::new(1));
        assert_eq!(store.watermark().unwrap(), ts(base + 5));
    }

    #[tokio::test]
    async fn reverse_repost_found_during_reconciliation() {
        let mut store = memory_store(1);
        let gateway = RecordingGateway::default();

        // m1 posted u1 at t=10 and was recorded live.
        let live = message(1, 10, 1, 1, 10, U1);
        review_message(&mut store, &live, &gateway).await.unwrap();

        // Catch-up from t=0 finds m3's post at t=5 in another channel.
        let guild = FakeGuild::default()
            .with_channel(2, "memes")
            .with_message(message(1, 5, 2, 3, 5, U1));
        let report = Reconciler::new(&guild, &gateway)
            .reconcile_from(&mut store, Some(ts(0)))
            .await
            .unwrap();

        assert_eq!(report.reverse_reposts, 1);
        let holder = store.holder(U1).unwrap().unwrap().holder;
        assert_eq!((holder.author_id, holder.timestamp), (UserId::new(3), ts(5)));
        let demoted = store.reposts(&RepostFilter::default().with_url(U1)).unwrap();
        assert_eq!(demoted.len(), 1);
        assert_eq!(demoted[0].occurrence, live.occurrence);
        assert_eq!(gateway.marked(), vec![live.occurrence.message()]);
        assert_eq!(store.state().unwrap().first_seen, ts(0));
    }

    #[tokio::test]
    async fn denied_channel_is_skipped_and_others_complete() {
        let mut store = memory_store(1);
        let base = store.watermark().unwrap().timestamp();
        let guild = FakeGuild::default()
            .with_channel(1, "general")
            .with_channel(2, "private")
            .with_channel(3, "links")
            .denying(2)
            .with_message(message(1, 1, 1, 1, base + 10, "https://a.test"))
            .with_message(message(1, 2, 2, 1, base + 50, "https://b.test"))
            .with_message(message(1, 3, 3, 2, base + 20, "https://a.test"));
        let gateway = RecordingGateway::default();

        let report = Reconciler::new(&guild, &gateway)
            .reconcile(&mut store)
            .await
            .unwrap();

        assert_eq!(report.channels_scanned, 2);
        assert_eq!(report.channels_skipped, vec![ChannelId::new(2)]);
        assert_eq!(report.reposts, 1);
        assert_eq!(store.holder("https://b.test").unwrap(), None);
        assert_eq!(store.watermark().unwrap(), ts(base + 20));
    }

    #[tokio::test]
    async fn access_revoked_mid_scan_keeps_committed_progress() {
        let mut store = memory_store(1);
        let base = store.watermark().unwrap().timestamp();
        let guild = FakeGuild::default()
            .with_channel(1, "general")
            .revoking_after_first_page(1)
            .with_message(message(1, 1, 1, 1, base + 1, "https://a.test"))
            .with_message(message(1, 2, 1, 1, base + 2, "https://b.test"))
            .with_message(message(1, 3, 1, 1, base + 3, "https://c.test"));
        let gateway = RecordingGateway::default();

        let report = Reconciler::new(&guild, &gateway)
            .with_page_size(2)
            .reconcile(&mut store)
            .await
            .unwrap();

        assert_eq!(report.messages, 2);
        assert_eq!(report.channels_skipped, vec![ChannelId::new(1)]);
        assert_eq!(store.holder_count().unwrap(), 2);
        assert_eq!(store.watermark().unwrap(), ts(base + 2));
    }

    #[tokio::test]
    async fn blacklisted_channels_and_inactive_guilds_are_not_scanned() {
        let mut store = memory_store(1);
        let base = store.watermark().unwrap().timestamp();
        store.blacklist_channel(ChannelId::new(1)).unwrap();
        let guild = FakeGuild::default()
            .with_channel(1, "spam")
            .with_message(message(1, 1, 1, 1, base + 1, "https://a.test"));
        let gateway = RecordingGateway::default();

        let report = Reconciler::new(&guild, &gateway)
            .reconcile(&mut store)
            .await
            .unwrap();
        assert_eq!(report.channels_scanned, 0);
        assert_eq!(store.holder_count().unwrap(), 0);

        store.unblacklist_channel(ChannelId::new(1)).unwrap();
        store.set_active(false).unwrap();
        let report = Reconciler::new(&guild, &gateway)
            .reconcile(&mut store)
            .await
            .unwrap();
        assert!(report.inactive);
        assert_eq!(store.holder_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn rerunning_a_pass_is_idempotent() {
        let mut store = memory_store(1);
        let guild = FakeGuild::default()
            .with_channel(1, "general")
            .with_message(message(1, 1, 1, 1, 1, U1))
            .with_message(message(1, 2, 1, 2, 2, U1));
        let gateway = RecordingGateway::default();
        let reconciler = Reconciler::new(&guild, &gateway);

        reconciler.reconcile_from(&mut store, Some(ts(0))).await.unwrap();
        let second = reconciler.reconcile_from(&mut store, Some(ts(0))).await.unwrap();

        assert_eq!(second.new_urls + second.reposts + second.reverse_reposts, 0);
        assert_eq!(store.reposts(&RepostFilter::default()).unwrap().len(), 1);
        assert_eq!(gateway.marked().len(), 1);
    }

    #[tokio::test]
    async fn interrupted_pass_does_not_skip_unscanned_channels() {
        let dir = tempfile::tempdir().unwrap();
        let location = StoreLocation::for_guild(dir.path(), GuildId::new(1));
        let (store, _) = GuildStore::open(GuildId::new(1), &location, defaults()).unwrap();
        let before = store.watermark().unwrap();
        let base = before.timestamp();

        let history = |guild: FakeGuild| {
            guild
                .with_channel(1, "general")
                .with_channel(2, "links")
                .with_message(message(1, 1, 1, 1, base + 50, "https://a.test"))
                .with_message(message(1, 2, 2, 2, base + 20, "https://b.test"))
        };

        // The process dies while reading the second channel.
        let crashing = history(FakeGuild::default().crashing_on(2));
        let interrupted = tokio::spawn(async move {
            let mut store = store;
            let gateway = RecordingGateway::default();
            let _ = Reconciler::new(&crashing, &gateway).reconcile(&mut store).await;
        })
        .await;
        assert!(interrupted.is_err());

        let (mut store, _) = GuildStore::open(GuildId::new(1), &location, defaults()).unwrap();
        assert!(store.holder("https://a.test").unwrap().is_some());
        assert_eq!(store.watermark().unwrap(), before);

        let guild = history(FakeGuild::default());
        let gateway = RecordingGateway::default();
        let report = Reconciler::new(&guild, &gateway)
            .reconcile(&mut store)
            .await
            .unwrap();
        assert_eq!(report.new_urls, 1);
        let holder = store.holder("https://b.test").unwrap().unwrap().holder;
        assert_eq!(holder.timestamp, ts(base + 20));
        assert_eq!(store.watermark().unwrap(), ts(base + 50));
    }

    #[tokio::test]
    async fn pass_without_messages_keeps_the_watermark() {
        let mut store = memory_store(1);
        let before = store.watermark().unwrap();
        let base = before.timestamp();
        let guild = FakeGuild::default()
            .with_channel(1, "general")
            .with_message(message(1, 1, 1, 1, base + 10, "https://a.test"));
        let gateway = RecordingGateway::default();

        let report = Reconciler::new(&guild, &gateway)
            .reconcile(&mut store)
            .await
            .unwrap();
        assert_eq!(report.reviewed_through, Some(ts(base + 10)));

        let empty = FakeGuild::default().with_channel(1, "general");
        let report = Reconciler::new(&empty, &gateway)
            .reconcile(&mut store)
            .await
            .unwrap();
        assert_eq!(report.reviewed_through, None);
        assert_eq!(store.watermark().unwrap(), ts(base + 10));
        assert!(before < ts(base + 10));
    }
}
