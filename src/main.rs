use poise::serenity_prelude as serenity;
use repostwatch::commands::repost;
use repostwatch::discord::{incoming_from, incoming_in, DiscordGateway};
use repostwatch::flush::DurabilityFlusher;
use repostwatch::tracker::{RepostTracker, StoreRoot};
use repostwatch::{config::Config, Data, Error};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration: {:?}", config);
    let discord_token = config.discord_token.clone();

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![repost::repost()],
            owners: config
                .owner_id
                .map(serenity::UserId::new)
                .into_iter()
                .collect(),
            skip_checks_for_owners: true,
            event_handler: |ctx, event, _framework, data| Box::pin(handle_event(ctx, event, data)),
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                info!("Bot is ready!");
                if config.register_commands {
                    match config.dev_guild_id {
                        Some(guild_id) => {
                            poise::builtins::register_in_guild(
                                ctx,
                                &framework.options().commands,
                                serenity::GuildId::new(guild_id),
                            )
                            .await?
                        }
                        None => {
                            poise::builtins::register_globally(ctx, &framework.options().commands)
                                .await?
                        }
                    }
                }

                // Set bot status
                ctx.set_activity(Some(serenity::ActivityData::custom(&config.status_message)));

                let tracker = Arc::new(RepostTracker::new(
                    StoreRoot::Directory(config.database_dir.clone()),
                    config.store_defaults(),
                    config.history_page_size,
                ));
                let gateway = Arc::new(DiscordGateway::new(ctx.http.clone()));

                let flusher = DurabilityFlusher::new(tracker.clone(), config.flush_interval);
                tokio::spawn(flusher.run());

                Ok(Data {
                    config,
                    tracker,
                    gateway,
                })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::GUILDS
        | serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MEMBERS
        | serenity::GatewayIntents::GUILD_EMOJIS_AND_STICKERS;

    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    info!("Starting bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}

async fn handle_event(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::GuildCreate { guild, .. } => {
            let guild_id = guild.id;
            info!("Catching up on {} ({})", guild.name, guild_id);
            let tracker = data.tracker.clone();
            let gateway = data.gateway.clone();
            tokio::spawn(async move {
                let gateway = gateway.as_ref();
                if let Err(e) = tracker.catch_up(guild_id, gateway, gateway, gateway).await {
                    error!("Catch-up for guild {} failed: {}", guild_id, e);
                }
            });
        }
        serenity::FullEvent::Message { new_message } => {
            if let Some(message) = incoming_from(new_message) {
                data.tracker
                    .handle_message(&message, data.gateway.as_ref())
                    .await?;
            }
        }
        serenity::FullEvent::MessageUpdate { new, event, .. } => {
            let Some(guild_id) = event.guild_id else {
                return Ok(());
            };
            let message = match new {
                Some(message) => message.clone(),
                None => match event.channel_id.message(&ctx.http, event.id).await {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Could not fetch edited message {}: {}", event.id, e);
                        return Ok(());
                    }
                },
            };
            data.tracker
                .handle_message(&incoming_in(guild_id, &message), data.gateway.as_ref())
                .await?;
        }
        serenity::FullEvent::GuildMemberAddition { new_member } => {
            data.tracker
                .member_joined(new_member.guild_id, new_member.user.id)
                .await?;
        }
        serenity::FullEvent::GuildMemberRemoval { guild_id, user, .. } => {
            data.tracker.member_left(*guild_id, user.id).await?;
        }
        _ => {}
    }
    Ok(())
}
