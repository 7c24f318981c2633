//! Resolution of the stored marker symbol into something Discord can react with.

use lazy_static::lazy_static;
use regex::Regex;
use serenity::model::channel::ReactionType;
use serenity::model::id::EmojiId;

lazy_static! {
    static ref CUSTOM_EMOJI_RE: Regex = Regex::new(r"^<(a?):(\w{2,32}):(\d+)>$").unwrap();
}

/// A custom emoji available in the guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownEmoji {
    pub id: EmojiId,
    pub name: String,
    pub animated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmojiError {
    #[error("no emoji matches '{0}'")]
    Unresolved(String),
}

/// Tries, in order: custom emoji markup (`<:name:id>` / `<a:name:id>`), a guild emoji
/// with that name (`name` or `:name:`), then a literal Unicode emoji.
pub fn resolve_marker(raw: &str, guild_emojis: &[KnownEmoji]) -> Result<ReactionType, EmojiError> {
    let raw = raw.trim();

    if let Some(caps) = CUSTOM_EMOJI_RE.captures(raw) {
        if let Some(id) = caps[3].parse::<u64>().ok().filter(|id| *id != 0) {
            return Ok(ReactionType::Custom {
                animated: &caps[1] == "a",
                id: EmojiId::new(id),
                name: Some(caps[2].to_string()),
            });
        }
    }

    let name = raw.trim_matches(':');
    if let Some(known) = guild_emojis.iter().find(|e| e.name == name) {
        return Ok(ReactionType::Custom {
            animated: known.animated,
            id: known.id,
            name: Some(known.name.clone()),
        });
    }

    let looks_unicode = !raw.is_ascii()
        && !raw.chars().any(|c| c.is_whitespace() || c.is_ascii_alphabetic());
    if looks_unicode {
        return Ok(ReactionType::Unicode(raw.to_string()));
    }

    Err(EmojiError::Unresolved(raw.to_string()))
}
