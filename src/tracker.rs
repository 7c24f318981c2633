//! Registry of open guild stores.
//!
//! Each guild's store sits behind its own `tokio::sync::Mutex`, which is the guild's
//! processing lane: live messages, catch-up scans, roster syncs, commands and flushes
//! for one guild run one at a time, while different guilds proceed independently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serenity::model::id::{GuildId, UserId};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::db::{GuildStore, OpenOutcome, StoreDefaults, StoreLocation, StoreResult};
use crate::model::IncomingMessage;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::review::{review_message, MessageReview};
use crate::roster::sync_members;
use crate::source::{MemberSource, MessageSource, ReactionGateway};
use crate::sweep::{ReactionSweep, SweepReport};

pub type GuildLane = Arc<Mutex<GuildStore>>;

/// Where stores are opened: one SQLite file per guild under a directory, or
/// throwaway in-memory stores.
#[derive(Debug, Clone)]
pub enum StoreRoot {
    Directory(PathBuf),
    Memory,
}

pub struct RepostTracker {
    root: StoreRoot,
    defaults: StoreDefaults,
    page_size: u8,
    guilds: RwLock<HashMap<GuildId, GuildLane>>,
}

impl RepostTracker {
    pub fn new(root: StoreRoot, defaults: StoreDefaults, page_size: u8) -> Self {
        Self {
            root,
            defaults,
            page_size,
            guilds: RwLock::new(HashMap::new()),
        }
    }

    /// Opens (or finds) the guild's store and returns its lane already locked.
    ///
    /// A newly opened store is published only after its lock is taken, so live
    /// events for the guild queue behind whatever the caller does first.
    pub async fn attach(&self, guild_id: GuildId) -> StoreResult<OwnedMutexGuard<GuildStore>> {
        let mut guilds = self.guilds.write().await;
        if let Some(lane) = guilds.get(&guild_id).cloned() {
            drop(guilds);
            return Ok(lane.lock_owned().await);
        }

        let location = match &self.root {
            StoreRoot::Directory(dir) => StoreLocation::for_guild(dir, guild_id),
            StoreRoot::Memory => StoreLocation::Memory,
        };
        let (store, outcome) = GuildStore::open(guild_id, &location, self.defaults.clone())?;
        if let OpenOutcome::Rebuilt { found_version, .. } = outcome {
            warn!(
                "Guild {} history was discarded (schema v{}); it will be rebuilt by reconciliation",
                guild_id, found_version
            );
        }

        let lane = Arc::new(Mutex::new(store));
        let guard = lane.clone().lock_owned().await;
        guilds.insert(guild_id, lane);
        Ok(guard)
    }

    pub async fn lane(&self, guild_id: GuildId) -> Option<GuildLane> {
        self.guilds.read().await.get(&guild_id).cloned()
    }

    pub async fn guild_ids(&self) -> Vec<GuildId> {
        self.guilds.read().await.keys().copied().collect()
    }

    /// Startup path for a guild: roster sync then a full catch-up scan, both under
    /// the lane lock obtained from `attach`.
    pub async fn catch_up(
        &self,
        guild_id: GuildId,
        source: &dyn MessageSource,
        members: &dyn MemberSource,
        gateway: &dyn ReactionGateway,
    ) -> anyhow::Result<ReconcileReport> {
        let mut store = self.attach(guild_id).await?;
        if let Err(e) = sync_members(&mut store, members).await {
            warn!("Guild {} roster sync failed: {}", guild_id, e);
        }
        let report = Reconciler::new(source, gateway)
            .with_page_size(self.page_size)
            .reconcile(&mut store)
            .await?;
        Ok(report)
    }

    /// Manual re-scan from `since` (or the watermark), queued on the guild's lane.
    pub async fn update(
        &self,
        guild_id: GuildId,
        since: Option<DateTime<Utc>>,
        source: &dyn MessageSource,
        gateway: &dyn ReactionGateway,
    ) -> anyhow::Result<ReconcileReport> {
        let lane = self
            .lane(guild_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("guild {} is not tracked", guild_id))?;
        let mut store = lane.lock().await;
        let report = Reconciler::new(source, gateway)
            .with_page_size(self.page_size)
            .reconcile_from(&mut store, since)
            .await?;
        Ok(report)
    }

    /// Wipes the guild's history and rebuilds it from channel history since the old
    /// `first_seen`, without releasing the lane in between.
    pub async fn reset_and_replay(
        &self,
        guild_id: GuildId,
        source: &dyn MessageSource,
        gateway: &dyn ReactionGateway,
    ) -> anyhow::Result<ReconcileReport> {
        let lane = self
            .lane(guild_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("guild {} is not tracked", guild_id))?;
        let mut store = lane.lock().await;
        let first_seen = store.state()?.first_seen;
        store.reset()?;
        let report = Reconciler::new(source, gateway)
            .with_page_size(self.page_size)
            .reconcile_from(&mut store, Some(first_seen))
            .await?;
        Ok(report)
    }

    /// Takes this bot's reactions off the guild's whole history. The lane stays held
    /// so no live message can add a marker mid-sweep.
    pub async fn remove_reactions(
        &self,
        guild_id: GuildId,
        source: &dyn MessageSource,
        gateway: &dyn ReactionGateway,
    ) -> anyhow::Result<SweepReport> {
        let lane = self
            .lane(guild_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("guild {} is not tracked", guild_id))?;
        let _store = lane.lock().await;
        let report = ReactionSweep::new(source, gateway)
            .with_page_size(self.page_size)
            .run(guild_id)
            .await?;
        Ok(report)
    }

    /// Live message (new or edited) path.
    pub async fn handle_message(
        &self,
        message: &IncomingMessage,
        gateway: &dyn ReactionGateway,
    ) -> anyhow::Result<Option<MessageReview>> {
        if message.from_bot {
            return Ok(None);
        }
        let Some(lane) = self.lane(message.guild_id).await else {
            debug!(
                "Message {} in untracked guild {}; leaving it to catch-up",
                message.occurrence.message_id, message.guild_id
            );
            return Ok(None);
        };

        let mut store = lane.lock().await;
        if !store.is_active()? || store.is_channel_blacklisted(message.occurrence.channel_id)? {
            return Ok(None);
        }
        let review = review_message(&mut store, message, gateway).await?;
        Ok(Some(review))
    }

    pub async fn member_joined(&self, guild_id: GuildId, member_id: UserId) -> anyhow::Result<()> {
        if let Some(lane) = self.lane(guild_id).await {
            lane.lock().await.add_member(member_id)?;
        }
        Ok(())
    }

    pub async fn member_left(&self, guild_id: GuildId, member_id: UserId) -> anyhow::Result<()> {
        if let Some(lane) = self.lane(guild_id).await {
            lane.lock().await.remove_member(member_id)?;
        }
        Ok(())
    }

    pub async fn flush_guild(&self, guild_id: GuildId) -> anyhow::Result<()> {
        let lane = self
            .lane(guild_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("guild {} is not tracked", guild_id))?;
        let store = lane.lock().await;
        store.flush()?;
        Ok(())
    }

    /// Flushes every tracked guild whose lane is free. Guilds busy with a catch-up or
    /// command are left for the next round. Returns how many were flushed.
    pub async fn flush_all(&self) -> usize {
        let lanes: Vec<(GuildId, GuildLane)> = self
            .guilds
            .read()
            .await
            .iter()
            .map(|(id, lane)| (*id, lane.clone()))
            .collect();

        let mut flushed = 0;
        let mut busy = 0;
        for (guild_id, lane) in lanes {
            let Ok(store) = lane.try_lock() else {
                debug!("Guild {} is busy; flushing it next round", guild_id);
                busy += 1;
                continue;
            };
            match store.flush() {
                Ok(()) => flushed += 1,
                Err(e) => error!("Failed to flush guild {}: {}", guild_id, e),
            }
        }
        info!("Flushed {} guild stores ({} busy)", flushed, busy);
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{defaults, message, ts, FakeGuild, RecordingGateway};
    use std::time::Duration;

    fn tracker() -> Arc<RepostTracker> {
        Arc::new(RepostTracker::new(StoreRoot::Memory, defaults(), 100))
    }

    #[tokio::test]
    async fn live_messages_wait_for_catch_up() {
        let tracker = tracker();
        let guild_id = GuildId::new(1);
        let gateway = Arc::new(RecordingGateway::default());

        let guard = tracker.attach(guild_id).await.unwrap();
        let base = guard.watermark().unwrap().timestamp();

        let live_tracker = tracker.clone();
        let live_gateway = gateway.clone();
        let live = message(1, 20, 1, 2, base + 20, "https://a.test");
        let pending = tokio::spawn(async move {
            live_tracker
                .handle_message(&live, live_gateway.as_ref())
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        // The "catch-up" records the earlier post while the live one is queued.
        let mut store = guard;
        review_message(
            &mut store,
            &message(1, 10, 1, 1, base + 10, "https://a.test"),
            gateway.as_ref(),
        )
        .await
        .unwrap();
        drop(store);

        let review = pending.await.unwrap().unwrap();
        assert_eq!(review.verdicts[0].outcome, crate::classifier::Outcome::Repost);
    }

    #[tokio::test]
    async fn inactive_guilds_and_blacklisted_channels_ignore_live_messages() {
        let tracker = tracker();
        let gateway = RecordingGateway::default();
        {
            let store = tracker.attach(GuildId::new(1)).await.unwrap();
            store.blacklist_channel(serenity::model::id::ChannelId::new(9)).unwrap();
        }

        let blocked = message(1, 1, 9, 1, 1, "https://a.test");
        assert!(tracker.handle_message(&blocked, &gateway).await.unwrap().is_none());

        tracker.lane(GuildId::new(1)).await.unwrap().lock().await.set_active(false).unwrap();
        let other = message(1, 2, 1, 1, 2, "https://a.test");
        assert!(tracker.handle_message(&other, &gateway).await.unwrap().is_none());

        let untracked = message(2, 3, 1, 1, 3, "https://a.test");
        assert!(tracker.handle_message(&untracked, &gateway).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn catch_up_syncs_roster_and_scans() {
        let tracker = tracker();
        let gateway = RecordingGateway::default();
        let guild = FakeGuild::default().with_channel(1, "general");
        guild.set_members(&[1, 2]);

        let report = tracker
            .catch_up(GuildId::new(1), &guild, &guild, &gateway)
            .await
            .unwrap();
        assert_eq!(report.channels_scanned, 1);

        let lane = tracker.lane(GuildId::new(1)).await.unwrap();
        assert_eq!(lane.lock().await.members().unwrap().len(), 2);

        tracker.member_left(GuildId::new(1), UserId::new(1)).await.unwrap();
        tracker.member_joined(GuildId::new(1), UserId::new(3)).await.unwrap();
        let members = lane.lock().await.members().unwrap();
        assert!(members.contains(&UserId::new(3)) && !members.contains(&UserId::new(1)));
    }

    #[tokio::test]
    async fn flush_all_visits_every_guild() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = RepostTracker::new(StoreRoot::Directory(dir.path().to_path_buf()), defaults(), 100);
        drop(tracker.attach(GuildId::new(1)).await.unwrap());
        drop(tracker.attach(GuildId::new(2)).await.unwrap());

        assert_eq!(tracker.flush_all().await, 2);
        assert!(dir.path().join("1.sqlite3").exists());
        assert!(tracker.flush_guild(GuildId::new(3)).await.is_err());
    }

    #[tokio::test]
    async fn reset_replays_history_before_live_messages() {
        let tracker = tracker();
        let guild_id = GuildId::new(1);
        let gateway = Arc::new(RecordingGateway::default());

        let base = {
            let store = tracker.attach(guild_id).await.unwrap();
            store.note_scan_start(ts(0)).unwrap();
            store.blacklist_channel(serenity::model::id::ChannelId::new(7)).unwrap();
            store.watermark().unwrap().timestamp()
        };
        let guild = Arc::new(
            FakeGuild::default()
                .with_channel(1, "general")
                .with_message(message(1, 10, 1, 1, 10, "https://old.test")),
        );

        // Hold the lane so the reset and a live repost queue up behind it in order.
        let held = tracker.lane(guild_id).await.unwrap().lock_owned().await;
        let reset = {
            let (tracker, guild, gateway) = (tracker.clone(), guild.clone(), gateway.clone());
            tokio::spawn(async move {
                tracker
                    .reset_and_replay(guild_id, guild.as_ref(), gateway.as_ref())
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let live = {
            let (tracker, gateway) = (tracker.clone(), gateway.clone());
            let repost = message(1, 20, 1, 2, base + 20, "https://old.test");
            tokio::spawn(async move {
                tracker
                    .handle_message(&repost, gateway.as_ref())
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let report = reset.await.unwrap();
        assert_eq!(report.new_urls, 1);
        let review = live.await.unwrap().unwrap();
        assert_eq!(review.verdicts[0].outcome, crate::classifier::Outcome::Repost);

        let lane = tracker.lane(guild_id).await.unwrap();
        let store = lane.lock().await;
        assert!(store.channel_blacklist().unwrap().is_empty());
        assert_eq!(store.holder("https://old.test").unwrap().unwrap().holder.timestamp, ts(10));
    }

    #[tokio::test]
    async fn reaction_sweep_waits_for_the_guild_lane() {
        let tracker = tracker();
        let guild_id = GuildId::new(1);
        drop(tracker.attach(guild_id).await.unwrap());
        let mut marked = message(1, 10, 1, 1, 10, "https://a.test");
        marked.own_reactions = vec!["♻️".to_string()];
        let guild = Arc::new(FakeGuild::default().with_channel(1, "general").with_message(marked));
        let gateway = Arc::new(RecordingGateway::default());

        let held = tracker.lane(guild_id).await.unwrap().lock_owned().await;
        let sweep = {
            let (tracker, guild, gateway) = (tracker.clone(), guild.clone(), gateway.clone());
            tokio::spawn(async move {
                tracker
                    .remove_reactions(guild_id, guild.as_ref(), gateway.as_ref())
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gateway.unmarked().is_empty());
        drop(held);

        let report = sweep.await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(gateway.unmarked().len(), 1);
    }

    #[tokio::test]
    async fn flush_all_skips_busy_guilds() {
        let tracker = tracker();
        let busy = tracker.attach(GuildId::new(1)).await.unwrap();
        drop(tracker.attach(GuildId::new(2)).await.unwrap());

        let flushed = tokio::time::timeout(Duration::from_secs(1), tracker.flush_all())
            .await
            .expect("flush must not wait for a held lane");
        assert_eq!(flushed, 1);

        drop(busy);
        assert_eq!(tracker.flush_all().await, 2);
    }
}
