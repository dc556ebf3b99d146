//! Discord front end.
//!
//! Thin wiring around the capture pipeline: a serenity client with songbird
//! registered for voice receive, a `/join` command that binds a voice
//! channel to the text channel it was invoked from, and a `/leave` command
//! that tears everything down.

mod receiver;

pub use receiver::VoiceReceiver;

use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};
use serenity::all::{
    ChannelId, Command, CommandInteraction, CreateCommand, CreateInteractionResponse,
    CreateInteractionResponseMessage, GatewayIntents, GuildId, Interaction, Ready,
};
use serenity::client::{Client, Context, EventHandler};
use serenity::http::Http;
use serenity::prelude::TypeMapKey;
use songbird::driver::DecodeMode;
use songbird::{CoreEvent, SerenityInit};

use crate::config::Config;
use crate::delivery::{format_transcript_line, TextSink};
use crate::decoder::OpusDecoderFactory;
use crate::dispatcher::{HttpSttClient, SttClient, TranscriptionDispatcher};
use crate::pipeline::UtterancePipeline;
use crate::registry::SpeakerRegistry;

/// Process-wide collaborators shared by every voice connection.
pub struct BotContext {
    pub registry: Arc<SpeakerRegistry>,
    pub stt: Arc<dyn SttClient>,
    pub config: Config,
}

struct BotContextKey;

impl TypeMapKey for BotContextKey {
    type Value = Arc<BotContext>;
}

/// Posts transcripts to the text channel the bot was invited from.
pub struct ChannelSink {
    http: Arc<Http>,
    channel: ChannelId,
}

impl ChannelSink {
    pub fn new(http: Arc<Http>, channel: ChannelId) -> Self {
        Self { http, channel }
    }
}

#[async_trait]
impl TextSink for ChannelSink {
    async fn deliver(&self, speaker: &str, text: &str) -> Result<(), String> {
        info!("transcript for {}: {}", speaker, text);
        self.channel
            .say(&self.http, format_transcript_line(speaker, text))
            .await
            .map(|_| ())
            .map_err(|e| format!("failed to post transcript: {}", e))
    }
}

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("connected as {}", ready.user.name);

        let commands = vec![
            CreateCommand::new("join")
                .description("Join your voice channel and start transcribing"),
            CreateCommand::new("leave").description("Leave the voice channel"),
        ];

        let deps = bot_context(&ctx).await;
        let registered = match deps.config.guild_id {
            Some(guild) => GuildId::new(guild).set_commands(&ctx.http, commands).await,
            None => Command::set_global_commands(&ctx.http, commands).await,
        };
        match registered {
            Ok(commands) => info!("registered {} slash commands", commands.len()),
            Err(e) => error!("failed to register slash commands: {}", e),
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };
        match command.data.name.as_str() {
            "join" => handle_join(&ctx, &command).await,
            "leave" => handle_leave(&ctx, &command).await,
            _ => {}
        }
    }
}

async fn bot_context(ctx: &Context) -> Arc<BotContext> {
    ctx.data
        .read()
        .await
        .get::<BotContextKey>()
        .cloned()
        .expect("bot context not installed")
}

async fn handle_join(ctx: &Context, command: &CommandInteraction) {
    let deps = bot_context(ctx).await;

    let Some(guild_id) = command.guild_id else {
        respond(ctx, command, "This command only works in a server.").await;
        return;
    };

    let connect_to = {
        ctx.cache.guild(guild_id).and_then(|guild| {
            guild
                .voice_states
                .get(&command.user.id)
                .and_then(|vs| vs.channel_id)
        })
    };
    let Some(channel_id) = connect_to else {
        respond(ctx, command, "Join a voice channel first.").await;
        return;
    };

    let Some(manager) = songbird::get(ctx).await else {
        respond(ctx, command, "Voice driver is not available.").await;
        return;
    };

    // Re-joining resets any previous receiver for this guild
    if manager.get(guild_id).is_some() {
        let _ = manager.remove(guild_id).await;
    }

    match manager.join(guild_id, channel_id).await {
        Ok(call_lock) => {
            let sink: Arc<dyn TextSink> =
                Arc::new(ChannelSink::new(ctx.http.clone(), command.channel_id));
            let dispatcher = Arc::new(TranscriptionDispatcher::new(deps.stt.clone(), sink));
            let pipeline = Arc::new(UtterancePipeline::new(
                deps.registry.clone(),
                dispatcher,
                Arc::new(OpusDecoderFactory),
                deps.config.silence,
            ));

            let receiver = VoiceReceiver::new(pipeline);
            {
                let mut call = call_lock.lock().await;
                call.add_global_event(CoreEvent::SpeakingStateUpdate.into(), receiver.clone());
                call.add_global_event(CoreEvent::VoiceTick.into(), receiver.clone());
                call.add_global_event(CoreEvent::DriverDisconnect.into(), receiver);
            }

            info!(
                "joined voice channel {} in guild {}",
                channel_id, guild_id
            );
            respond(
                ctx,
                command,
                &format!(
                    "Listening (silence threshold: {}ms)",
                    deps.config.silence.as_millis()
                ),
            )
            .await;
        }
        Err(e) => {
            error!("failed to join voice channel: {:?}", e);
            respond(ctx, command, "Failed to join the voice channel.").await;
        }
    }
}

async fn handle_leave(ctx: &Context, command: &CommandInteraction) {
    let Some(guild_id) = command.guild_id else {
        respond(ctx, command, "This command only works in a server.").await;
        return;
    };

    let Some(manager) = songbird::get(ctx).await else {
        respond(ctx, command, "Voice driver is not available.").await;
        return;
    };

    if manager.get(guild_id).is_none() {
        respond(ctx, command, "Not in a voice channel.").await;
        return;
    }

    // Disconnecting fires DriverDisconnect, which tears down open sessions
    match manager.remove(guild_id).await {
        Ok(()) => respond(ctx, command, "Left the voice channel.").await,
        Err(e) => {
            error!("failed to leave voice channel: {:?}", e);
            respond(ctx, command, "Failed to leave the voice channel.").await;
        }
    }
}

async fn respond(ctx: &Context, command: &CommandInteraction, message: &str) {
    let response = CreateInteractionResponse::Message(
        CreateInteractionResponseMessage::new().content(message),
    );
    if let Err(e) = command.create_response(&ctx.http, response).await {
        warn!("failed to respond to interaction: {}", e);
    }
}

/// Build the Discord client and run it until the gateway connection ends.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let stt: Arc<dyn SttClient> = Arc::new(HttpSttClient::new(
        config.stt_url.clone(),
        config.stt_timeout,
    )?);
    let context = Arc::new(BotContext {
        registry: Arc::new(SpeakerRegistry::new()),
        stt,
        config: config.clone(),
    });

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    // Decrypt only: packets reach the receiver still Opus-encoded and each
    // capture session runs its own decoder instance
    let songbird_config = songbird::Config::default().decode_mode(DecodeMode::Decrypt);

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(Handler)
        .register_songbird_from_config(songbird_config)
        .type_map_insert::<BotContextKey>(context)
        .await?;

    info!("starting Discord client");
    client.start().await?;
    Ok(())
}
