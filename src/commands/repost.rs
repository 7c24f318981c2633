use crate::config::DISCORD_EMBED_LIMIT;
use crate::db::RepostFilter;
use crate::emoji::resolve_marker;
use crate::extract::find_urls;
use crate::reconcile::ReconcileReport;
use crate::sweep::SweepReport;
use crate::tracker::GuildLane;
use crate::{Context, Error};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use humantime::parse_duration;
use poise::serenity_prelude as serenity;
use tracing::{info, warn};

const LEADERBOARD_SIZE: usize = 10;

/// Repost tracking for this server
#[poise::command(
    slash_command,
    subcommands(
        "status",
        "leaderboard",
        "stats",
        "ignore_channel",
        "watch_channel",
        "ignore_url",
        "watch_url",
        "emoji",
        "enable",
        "disable",
        "update",
        "reset",
        "remove_reactions",
        "save"
    ),
    guild_only
)]
pub async fn repost(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

async fn guild_lane(ctx: Context<'_>) -> Result<(serenity::GuildId, GuildLane), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let lane = ctx
        .data()
        .tracker
        .lane(guild_id)
        .await
        .ok_or("This server is still being indexed, try again shortly.")?;
    Ok((guild_id, lane))
}

/// Show tracking status and blacklists
#[poise::command(slash_command)]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let (_, lane) = guild_lane(ctx).await?;
    let (state, holders, channels, urls) = {
        let store = lane.lock().await;
        (
            store.state()?,
            store.holder_count()?,
            store.channel_blacklist()?,
            store.url_blacklist()?,
        )
    };

    let channels = if channels.is_empty() {
        "None".to_string()
    } else {
        channels
            .iter()
            .map(|id| format!("<#{}>", id))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let urls = if urls.is_empty() {
        "None".to_string()
    } else {
        truncate(&urls.join("\n"), 1024)
    };

    let embed = serenity::CreateEmbed::new()
        .title("♻️ Repost Tracking")
        .field(
            "State",
            if state.active { "✅ Active" } else { "⏸️ Paused" },
            true,
        )
        .field("Marker", state.marker_emoji.as_str(), true)
        .field("Unique URLs", format!("`{}`", holders), true)
        .field("Updated Through", format!("<t:{}:f>", state.watermark.timestamp()), true)
        .field("Tracking Since", format!("<t:{}:D>", state.first_seen.timestamp()), true)
        .field("Ignored Channels", channels, false)
        .field("Ignored URLs", urls, false)
        .color(0x5865F2);

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Members with the most reposts
#[poise::command(slash_command)]
pub async fn leaderboard(ctx: Context<'_>) -> Result<(), Error> {
    let (_, lane) = guild_lane(ctx).await?;
    let (since, rows) = {
        let store = lane.lock().await;
        (store.state()?.first_seen, store.repost_leaderboard(LEADERBOARD_SIZE)?)
    };

    let description = if rows.is_empty() {
        "No reposts yet.".to_string()
    } else {
        let lines: Vec<String> = rows
            .iter()
            .enumerate()
            .map(|(i, (user_id, count))| format!("**{}.** <@{}> - {}", i + 1, user_id, count))
            .collect();
        truncate(&lines.join("\n"), DISCORD_EMBED_LIMIT)
    };

    let embed = serenity::CreateEmbed::new()
        .title("🏆 Repost Leaderboard")
        .description(description)
        .footer(serenity::CreateEmbedFooter::new(format!(
            "Since {}",
            since.format("%Y-%m-%d")
        )))
        .color(0x5865F2);

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Posting record of one member
#[poise::command(slash_command)]
pub async fn stats(
    ctx: Context<'_>,
    #[description = "Member to look up"] member: serenity::User,
) -> Result<(), Error> {
    let (_, lane) = guild_lane(ctx).await?;
    let (originals, reposts) = {
        let store = lane.lock().await;
        let originals = store.holder_count_for(member.id)?;
        let reposts = store
            .reposts(&RepostFilter::default().with_author(member.id))?
            .len() as u64;
        (originals, reposts)
    };

    let total = originals + reposts;
    let rate = if total == 0 {
        0.0
    } else {
        reposts as f64 / total as f64 * 100.0
    };

    let embed = serenity::CreateEmbed::new()
        .title(format!("📊 {}", member.name))
        .field("URLs Posted", format!("`{}`", total), true)
        .field("Reposts", format!("`{}`", reposts), true)
        .field("Repost Rate", format!("`{:.2}%`", rate), true)
        .color(0x5865F2);

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Stop tracking this channel
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
pub async fn ignore_channel(ctx: Context<'_>) -> Result<(), Error> {
    let (guild_id, lane) = guild_lane(ctx).await?;
    let channel_id = ctx.channel_id();
    let added = lane.lock().await.blacklist_channel(channel_id)?;

    if added {
        info!("Channel {} ignored in guild {} by {}", channel_id, guild_id, ctx.author().name);
        ctx.say(format!("✅ <#{}> is no longer tracked.", channel_id)).await?;
    } else {
        ctx.say(format!("ℹ️ <#{}> is already ignored.", channel_id)).await?;
    }
    Ok(())
}

/// Resume tracking this channel
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
pub async fn watch_channel(ctx: Context<'_>) -> Result<(), Error> {
    let (guild_id, lane) = guild_lane(ctx).await?;
    let channel_id = ctx.channel_id();
    let removed = lane.lock().await.unblacklist_channel(channel_id)?;

    if removed {
        info!("Channel {} watched in guild {} by {}", channel_id, guild_id, ctx.author().name);
        ctx.say(format!("✅ <#{}> is tracked again.", channel_id)).await?;
    } else {
        ctx.say(format!("ℹ️ <#{}> was not ignored.", channel_id)).await?;
    }
    Ok(())
}

/// Stop counting URLs as reposts
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
pub async fn ignore_url(
    ctx: Context<'_>,
    #[description = "One or more URLs"] urls: String,
) -> Result<(), Error> {
    let (_, lane) = guild_lane(ctx).await?;
    let urls = find_urls(&urls, std::iter::empty::<&str>());
    if urls.is_empty() {
        ctx.say("❌ No URLs found.").await?;
        return Ok(());
    }

    let mut added = 0;
    {
        let store = lane.lock().await;
        for url in &urls {
            if store.blacklist_url(url)? {
                added += 1;
            }
        }
    }
    info!("{} URLs ignored by {}", added, ctx.author().name);
    ctx.say(format!("✅ Ignoring {} new URL(s).", added)).await?;
    Ok(())
}

/// Count URLs as reposts again
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
pub async fn watch_url(
    ctx: Context<'_>,
    #[description = "One or more URLs"] urls: String,
) -> Result<(), Error> {
    let (_, lane) = guild_lane(ctx).await?;
    let urls = find_urls(&urls, std::iter::empty::<&str>());
    if urls.is_empty() {
        ctx.say("❌ No URLs found.").await?;
        return Ok(());
    }

    let mut removed = 0;
    {
        let store = lane.lock().await;
        for url in &urls {
            if store.unblacklist_url(url)? {
                removed += 1;
            }
        }
    }
    ctx.say(format!("✅ Watching {} URL(s) again.", removed)).await?;
    Ok(())
}

/// Set the emoji used to mark reposts
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
pub async fn emoji(
    ctx: Context<'_>,
    #[description = "Unicode emoji, custom emoji, or custom emoji name"] emoji: String,
) -> Result<(), Error> {
    let (guild_id, lane) = guild_lane(ctx).await?;
    let known = ctx.data().gateway.guild_emojis(guild_id).await?;

    let reaction = match resolve_marker(&emoji, &known) {
        Ok(reaction) => reaction,
        Err(e) => {
            ctx.say(format!("❌ {}", e)).await?;
            return Ok(());
        }
    };

    let marker = reaction.to_string();
    lane.lock().await.set_marker_emoji(&marker)?;
    info!("Guild {} marker emoji set to {}", guild_id, marker);
    ctx.say(format!("✅ Reposts will be marked with {}", marker)).await?;
    Ok(())
}

/// Resume tracking in this server
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
pub async fn enable(ctx: Context<'_>) -> Result<(), Error> {
    set_active(ctx, true).await
}

/// Pause tracking in this server
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
pub async fn disable(ctx: Context<'_>) -> Result<(), Error> {
    set_active(ctx, false).await
}

async fn set_active(ctx: Context<'_>, active: bool) -> Result<(), Error> {
    let (guild_id, lane) = guild_lane(ctx).await?;
    {
        let store = lane.lock().await;
        if store.is_active()? == active {
            drop(store);
            ctx.say(if active {
                "ℹ️ Tracking is already active."
            } else {
                "ℹ️ Tracking is already paused."
            })
            .await?;
            return Ok(());
        }
        store.set_active(active)?;
    }

    if active {
        info!("Tracking resumed in guild {}", guild_id);
        ctx.say("✅ Tracking resumed. Run `/repost update` to cover the pause.")
            .await?;
    } else {
        warn!("Tracking paused in guild {}", guild_id);
        ctx.say("⏸️ Tracking paused.").await?;
    }
    Ok(())
}

/// Re-scan history (since a date like 2024-01-31 or a duration like 7days)
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
pub async fn update(
    ctx: Context<'_>,
    #[description = "YYYY-MM-DD or a duration such as 7days (default: last update)"]
    since: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let since = match since.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => match parse_since(raw, Utc::now()) {
            Some(ts) => Some(ts),
            None => {
                ctx.say("❌ Invalid start. Examples: `2024-01-31`, `7days`, `12h`.")
                    .await?;
                return Ok(());
            }
        },
    };

    ctx.defer().await?;
    warn!(
        "Update of guild {} requested by {} (since {:?})",
        guild_id,
        ctx.author().name,
        since
    );

    let data = ctx.data();
    let gateway = data.gateway.as_ref();
    let report = data.tracker.update(guild_id, since, gateway, gateway).await?;
    ctx.say(summarize_report(&report)).await?;
    Ok(())
}

/// Wipe URL history and settings, then rebuild it from channel history
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
pub async fn reset(
    ctx: Context<'_>,
    #[description = "Type \"confirm\" to proceed"] confirm: Option<String>,
) -> Result<(), Error> {
    if confirm.as_deref().map(str::trim) != Some("confirm") {
        ctx.say("⚠️ This deletes all repost history for this server. Run `/repost reset confirm:confirm` to proceed.")
            .await?;
        return Ok(());
    }

    let (guild_id, _) = guild_lane(ctx).await?;
    ctx.defer().await?;
    warn!("Guild {} reset by {}", guild_id, ctx.author().name);

    let data = ctx.data();
    let gateway = data.gateway.as_ref();
    let report = data
        .tracker
        .reset_and_replay(guild_id, gateway, gateway)
        .await?;
    ctx.say(format!("🗑️ Reset complete. {}", summarize_report(&report)))
        .await?;
    Ok(())
}

/// Take every repost marker this bot has placed off the server's messages
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
pub async fn remove_reactions(ctx: Context<'_>) -> Result<(), Error> {
    let (guild_id, _) = guild_lane(ctx).await?;
    ctx.defer().await?;
    warn!(
        "Reaction removal in guild {} requested by {}",
        guild_id,
        ctx.author().name
    );

    let data = ctx.data();
    let gateway = data.gateway.as_ref();
    let report = data
        .tracker
        .remove_reactions(guild_id, gateway, gateway)
        .await?;
    ctx.say(summarize_sweep(&report)).await?;
    Ok(())
}

/// Write this server's data to disk now
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
pub async fn save(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    ctx.data().tracker.flush_guild(guild_id).await?;
    ctx.say("💾 Saved.").await?;
    Ok(())
}

/// Accepts a calendar date (midnight UTC) or a duration counted back from `now`.
fn parse_since(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    let delta = ChronoDuration::from_std(parse_duration(raw).ok()?).ok()?;
    now.checked_sub_signed(delta)
}

fn summarize_report(report: &ReconcileReport) -> String {
    if report.inactive {
        return "ℹ️ Tracking is paused in this server; nothing was scanned.".to_string();
    }
    let mut summary = format!(
        "✅ Scanned {} channel(s), {} message(s): {} new URL(s), {} repost(s), {} reverse repost(s).",
        report.channels_scanned,
        report.messages,
        report.new_urls,
        report.reposts,
        report.reverse_reposts
    );
    if !report.channels_skipped.is_empty() {
        let skipped: Vec<String> = report
            .channels_skipped
            .iter()
            .map(|id| format!("<#{}>", id))
            .collect();
        summary.push_str(&format!(" Skipped: {}", skipped.join(", ")));
    }
    summary
}

fn summarize_sweep(report: &SweepReport) -> String {
    let mut summary = format!(
        "🧹 Removed {} reaction(s) across {} channel(s), {} message(s).",
        report.removed, report.channels_scanned, report.messages
    );
    if report.failed > 0 {
        summary.push_str(&format!(" {} could not be removed.", report.failed));
    }
    if report.channels_skipped > 0 {
        summary.push_str(&format!(
            " {} channel(s) were not readable.",
            report.channels_skipped
        ));
    }
    summary
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit.saturating_sub(1)).collect();
    out.push('…');
    out
}
