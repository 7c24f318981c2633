use std::collections::BTreeSet;

use serenity::model::id::UserId;
use tracing::info;

use crate::db::{Batch, Change, GuildStore};
use crate::source::MemberSource;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RosterDiff {
    pub added: Vec<UserId>,
    pub removed: Vec<UserId>,
}

impl RosterDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Brings the stored member set in line with the live list in a single commit.
pub async fn sync_members(
    store: &mut GuildStore,
    members: &dyn MemberSource,
) -> anyhow::Result<RosterDiff> {
    let guild_id = store.guild_id();
    let live: BTreeSet<UserId> = members.member_ids(guild_id).await?.into_iter().collect();
    let stored = store.members()?;

    let diff = RosterDiff {
        added: live.difference(&stored).copied().collect(),
        removed: stored.difference(&live).copied().collect(),
    };
    if diff.is_empty() {
        return Ok(diff);
    }

    let mut batch = Batch::new();
    for id in &diff.added {
        batch.push(Change::AddMember(*id));
    }
    for id in &diff.removed {
        batch.push(Change::RemoveMember(*id));
    }
    store.commit(&batch)?;

    info!(
        "Guild {} roster synced: {} added, {} removed",
        guild_id,
        diff.added.len(),
        diff.removed.len()
    );
    Ok(diff)
}
