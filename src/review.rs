use tracing::{debug, info, warn};

use crate::classifier::{classify, Outcome, Verdict};
use crate::db::{Batch, GuildStore, StoreResult};
use crate::extract::find_urls;
use crate::model::{IncomingMessage, MessageRef};
use crate::source::{ReactionGateway, ReactionResult};

/// What happened to one message.
#[derive(Debug, Default)]
pub struct MessageReview {
    pub verdicts: Vec<Verdict>,
    pub markers: Vec<(MessageRef, ReactionResult)>,
}

impl MessageReview {
    pub fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.verdicts.iter().filter(|v| pred(&v.outcome)).count()
    }
}

/// Classifies every URL in `message`, commits the result together with the watermark
/// advance, then asks the gateway to mark whatever got flagged.
///
/// The caller must hold the guild's lane for the whole call.
pub async fn review_message(
    store: &mut GuildStore,
    message: &IncomingMessage,
    gateway: &dyn ReactionGateway,
) -> StoreResult<MessageReview> {
    review(store, message, gateway, true).await
}

/// Same as [`review_message`] for history replay: classification is committed but the
/// watermark is left for the reconciler to move once the whole pass is done.
pub async fn replay_message(
    store: &mut GuildStore,
    message: &IncomingMessage,
    gateway: &dyn ReactionGateway,
) -> StoreResult<MessageReview> {
    review(store, message, gateway, false).await
}

async fn review(
    store: &mut GuildStore,
    message: &IncomingMessage,
    gateway: &dyn ReactionGateway,
    advance_watermark: bool,
) -> StoreResult<MessageReview> {
    if message.from_bot {
        return Ok(MessageReview::default());
    }

    let occurrence = message.occurrence;
    let urls = find_urls(&message.content, message.embed_urls.iter().map(String::as_str));

    let mut batch = Batch::new();
    let mut verdicts = Vec::with_capacity(urls.len());
    for url in &urls {
        let verdict = classify(url, &occurrence, &*store)?;
        match &verdict.outcome {
            Outcome::New => debug!(
                "New URL in #{} by {}: {}",
                occurrence.channel_id, occurrence.author_id, url
            ),
            Outcome::Repost => info!(
                "Repost in #{} at {} by {}: {}",
                occurrence.channel_id, occurrence.timestamp, occurrence.author_id, url
            ),
            Outcome::ReverseRepost { demoted } => warn!(
                "Reverse repost of {}: original {} in #{} by {}, demoted {} in #{} by {}",
                url,
                occurrence.message_id,
                occurrence.channel_id,
                occurrence.author_id,
                demoted.message_id,
                demoted.channel_id,
                demoted.author_id
            ),
            Outcome::Ignored => debug!("Blacklisted URL in #{}: {}", occurrence.channel_id, url),
            Outcome::AlreadyRecorded => {}
        }
        batch.merge(verdict.batch.clone());
        verdicts.push(verdict);
    }
    if advance_watermark {
        batch.advance_watermark(occurrence.timestamp);
    } else {
        batch.hold_watermark();
    }
    store.commit(&batch)?;

    let mut targets: Vec<MessageRef> = Vec::new();
    for target in verdicts.iter().filter_map(Verdict::marker_target) {
        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    let mut markers = Vec::with_capacity(targets.len());
    if !targets.is_empty() {
        let emoji = store.marker_emoji()?;
        let guild_id = store.guild_id();
        for target in targets {
            let result = gateway.react(guild_id, target, &emoji).await;
            if let ReactionResult::Failed(reason) = &result {
                warn!(
                    "Could not mark message {} in #{}: {}",
                    target.message_id, target.channel_id, reason
                );
            }
            markers.push((target, result));
        }
    }

    Ok(MessageReview { verdicts, markers })
}
