//! Repost decision logic.
//!
//! `classify` only reads through a [`UrlLedger`] and hands back the outcome together
//! with the [`Batch`] that records it. Committing the batch and putting a marker on
//! the flagged message are left to the caller.

use std::fmt;

use crate::db::{Batch, Change, GuildStore, StoreResult};
use crate::model::{MessageRef, Occurrence, RepostEntry, UrlHolder};

/// Read access the classifier needs from a guild's records.
pub trait UrlLedger {
    fn is_url_blacklisted(&self, url: &str) -> StoreResult<bool>;
    fn holder(&self, url: &str) -> StoreResult<Option<UrlHolder>>;
    fn has_repost(&self, url: &str, message: MessageRef) -> StoreResult<bool>;
}

impl UrlLedger for GuildStore {
    fn is_url_blacklisted(&self, url: &str) -> StoreResult<bool> {
        GuildStore::is_url_blacklisted(self, url)
    }

    fn holder(&self, url: &str) -> StoreResult<Option<UrlHolder>> {
        GuildStore::holder(self, url)
    }

    fn has_repost(&self, url: &str, message: MessageRef) -> StoreResult<bool> {
        GuildStore::has_repost(self, url, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// URL is exempt from tracking.
    Ignored,
    /// First sighting; the occurrence became the holder.
    New,
    /// This exact message was already accounted for.
    AlreadyRecorded,
    /// Later than the holder; recorded as a repost.
    Repost,
    /// Earlier than the holder; the old holder was demoted to a repost.
    ReverseRepost { demoted: Occurrence },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Ignored => "ignored",
            Outcome::New => "new",
            Outcome::AlreadyRecorded => "already recorded",
            Outcome::Repost => "repost",
            Outcome::ReverseRepost { .. } => "reverse repost",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub url: String,
    pub occurrence: Occurrence,
    pub outcome: Outcome,
    pub batch: Batch,
}

impl Verdict {
    /// The message that should carry the repost marker, if any.
    pub fn marker_target(&self) -> Option<MessageRef> {
        match &self.outcome {
            Outcome::Repost => Some(self.occurrence.message()),
            Outcome::ReverseRepost { demoted } => Some(demoted.message()),
            Outcome::Ignored | Outcome::New | Outcome::AlreadyRecorded => None,
        }
    }
}

pub fn classify(
    url: &str,
    occurrence: &Occurrence,
    ledger: &impl UrlLedger,
) -> StoreResult<Verdict> {
    let mut batch = Batch::new();

    let outcome = if ledger.is_url_blacklisted(url)? {
        Outcome::Ignored
    } else {
        match ledger.holder(url)? {
            None => {
                batch.push(Change::SetHolder(UrlHolder {
                    url: url.to_string(),
                    holder: *occurrence,
                }));
                Outcome::New
            }
            Some(current) if current.holder.is_same_message(occurrence) => {
                Outcome::AlreadyRecorded
            }
            Some(_) if ledger.has_repost(url, occurrence.message())? => Outcome::AlreadyRecorded,
            Some(current) if current.holder.order_key() < occurrence.order_key() => {
                batch.push(Change::AppendRepost(RepostEntry {
                    url: url.to_string(),
                    occurrence: *occurrence,
                }));
                Outcome::Repost
            }
            Some(current) => {
                let demoted = current.holder;
                batch.push(Change::AppendRepost(RepostEntry {
                    url: url.to_string(),
                    occurrence: demoted,
                }));
                batch.push(Change::SetHolder(UrlHolder {
                    url: url.to_string(),
                    holder: *occurrence,
                }));
                Outcome::ReverseRepost { demoted }
            }
        }
    };

    if !batch.changes().is_empty() {
        batch.advance_watermark(occurrence.timestamp);
    }

    Ok(Verdict {
        url: url.to_string(),
        occurrence: *occurrence,
        outcome,
        batch,
    })
}
