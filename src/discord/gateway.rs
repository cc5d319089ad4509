use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serenity::all::{
    ChannelId, CommandInteraction, Context, CreateAttachment, CreateCommand, CreateInteractionResponse,
    CreateInteractionResponseMessage, CreateMessage, EventHandler, GatewayIntents, GuildId,
    Interaction, Ready, UserId, VoiceState,
};
use serenity::cache::Cache;
use serenity::gateway::ShardManager;
use serenity::gateway::VoiceGatewayManager;
use serenity::http::Http;
use songbird::driver::DecodeMode;
use songbird::{Call, Config as SongbirdConfig, CoreEvent, EventContext, Songbird};
use tracing::{debug, info, warn};

use super::{
    AudioCallback, Client, EphemeralResponder, FileMessage, SlashCommandDefinition,
    SlashCommandEvent, SlashCommandHandler, TranscriptMetadata, TranscriptParticipant,
    VoiceConnection, VoiceParticipant, VoiceStateEvent, VoiceStateHandler,
};

/// Serenity-backed gateway client with a songbird voice manager.
///
/// Handlers may be registered before or after `connect`; the dispatcher reads
/// them from shared slots on every event.
pub struct GatewayClient {
    token: String,
    songbird: Arc<Songbird>,
    shared: Arc<GatewayShared>,
    client: tokio::sync::Mutex<Option<serenity::Client>>,
    http: StdRwLock<Option<Arc<Http>>>,
    cache: StdRwLock<Option<Arc<Cache>>>,
    shard_manager: StdRwLock<Option<Arc<ShardManager>>>,
}

#[derive(Default)]
struct GatewayShared {
    voice_handler: StdRwLock<Option<VoiceStateHandler>>,
    slash_handler: StdRwLock<Option<SlashCommandHandler>>,
    bot_user_id: StdRwLock<String>,
}

impl GatewayClient {
    pub fn new(token: impl Into<String>) -> Self {
        let songbird = Songbird::serenity();
        // The driver must hand us raw opus; decoding happens in the mixer.
        songbird.set_config(SongbirdConfig::default().decode_mode(DecodeMode::Pass));
        Self {
            token: token.into(),
            songbird,
            shared: Arc::new(GatewayShared::default()),
            client: tokio::sync::Mutex::new(None),
            http: StdRwLock::new(None),
            cache: StdRwLock::new(None),
            shard_manager: StdRwLock::new(None),
        }
    }

    fn http(&self) -> Result<Arc<Http>> {
        self.http
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .context("discord client is not connected")
    }

    fn cache(&self) -> Result<Arc<Cache>> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .context("discord client is not connected")
    }
}

fn parse_guild_id(guild_id: &str) -> Result<GuildId> {
    let raw: u64 = guild_id.parse().context("invalid guild id")?;
    Ok(GuildId::new(raw))
}

fn parse_channel_id(channel_id: &str) -> Result<ChannelId> {
    let raw: u64 = channel_id.parse().context("invalid channel id")?;
    Ok(ChannelId::new(raw))
}

fn parse_user_id(user_id: &str) -> Result<UserId> {
    let raw: u64 = user_id.parse().context("invalid user id")?;
    Ok(UserId::new(raw))
}

fn preferred_display_name(
    global_name: Option<&str>,
    username: &str,
    fallback: &str,
) -> String {
    if let Some(name) = global_name {
        if !name.is_empty() {
            return name.to_string();
        }
    }
    if !username.is_empty() {
        return username.to_string();
    }
    fallback.to_string()
}

#[async_trait]
impl Client for GatewayClient {
    async fn connect(&self) -> Result<()> {
        let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
        let dispatcher = EventDispatcher {
            shared: Arc::clone(&self.shared),
        };
        let client = serenity::Client::builder(&self.token, intents)
            .event_handler(dispatcher)
            .voice_manager_arc(Arc::clone(&self.songbird) as Arc<dyn VoiceGatewayManager>)
            .await
            .context("failed to build discord client")?;

        *self.http.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&client.http));
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&client.cache));
        *self
            .shard_manager
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&client.shard_manager));
        *self.client.lock().await = Some(client);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let shard_manager = self
            .shard_manager
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(shard_manager) = shard_manager {
            shard_manager.shutdown_all().await;
        }
        Ok(())
    }

    async fn join_voice_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Arc<dyn VoiceConnection>> {
        let gid = parse_guild_id(guild_id)?;
        let cid = parse_channel_id(channel_id)?;
        let call = self
            .songbird
            .join(gid, cid)
            .await
            .context("failed to join voice channel")?;
        Ok(Arc::new(GatewayVoice { call }))
    }

    async fn send_channel_message(&self, channel_id: &str, content: &str) -> Result<()> {
        let http = self.http()?;
        let cid = parse_channel_id(channel_id)?;
        cid.say(&*http, content)
            .await
            .context("failed to send channel message")?;
        Ok(())
    }

    async fn send_channel_message_with_file(&self, msg: FileMessage) -> Result<()> {
        let http = self.http()?;
        let cid = parse_channel_id(&msg.channel_id)?;
        let attachment = CreateAttachment::bytes(msg.file_body, msg.filename);
        cid.send_files(
            &*http,
            [attachment],
            CreateMessage::new().content(msg.content),
        )
        .await
        .context("failed to send channel message with file")?;
        Ok(())
    }

    fn register_voice_state_update_handler(&self, handler: VoiceStateHandler) {
        *self
            .shared
            .voice_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn register_slash_command_handler(&self, handler: SlashCommandHandler) {
        *self
            .shared
            .slash_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    async fn upsert_guild_slash_commands(
        &self,
        guild_id: &str,
        defs: &[SlashCommandDefinition],
    ) -> Result<()> {
        let http = self.http()?;
        let gid = parse_guild_id(guild_id)?;
        let existing = gid
            .get_commands(&*http)
            .await
            .context("failed to list guild slash commands")?;

        for def in defs {
            if def.name.is_empty() {
                continue;
            }
            let builder = CreateCommand::new(&def.name).description(&def.description);
            match existing.iter().find(|cmd| cmd.name == def.name) {
                None => {
                    gid.create_command(&*http, builder)
                        .await
                        .with_context(|| format!("failed to create slash command {}", def.name))?;
                }
                Some(cmd) if cmd.description != def.description => {
                    gid.edit_command(&*http, cmd.id, builder)
                        .await
                        .with_context(|| format!("failed to edit slash command {}", def.name))?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn get_user_voice_channel_id(&self, guild_id: &str, user_id: &str) -> Result<String> {
        let cache = self.cache()?;
        let gid = parse_guild_id(guild_id)?;
        let uid = parse_user_id(user_id)?;
        let channel_id = cache.guild(gid).and_then(|guild| {
            guild
                .voice_states
                .get(&uid)
                .and_then(|vs| vs.channel_id)
                .map(|c| c.to_string())
        });
        Ok(channel_id.unwrap_or_default())
    }

    async fn list_voice_channel_participants(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Vec<VoiceParticipant>> {
        let cache = self.cache()?;
        let gid = parse_guild_id(guild_id)?;
        let cid = parse_channel_id(channel_id)?;
        let Some(guild) = cache.guild(gid) else {
            return Ok(Vec::new());
        };
        let mut participants = Vec::new();
        for (user_id, vs) in guild.voice_states.iter() {
            if vs.channel_id != Some(cid) {
                continue;
            }
            let is_bot = vs
                .member
                .as_ref()
                .map(|m| m.user.bot)
                .or_else(|| guild.members.get(user_id).map(|m| m.user.bot))
                .unwrap_or(false);
            participants.push(VoiceParticipant {
                user_id: user_id.to_string(),
                is_bot,
            });
        }
        Ok(participants)
    }

    async fn get_bot_user_id(&self) -> Result<String> {
        {
            let cached = self
                .shared
                .bot_user_id
                .read()
                .unwrap_or_else(|e| e.into_inner());
            if !cached.is_empty() {
                return Ok(cached.clone());
            }
        }
        let http = self.http()?;
        let user = http
            .get_current_user()
            .await
            .context("failed to resolve bot user")?;
        let id = user.id.to_string();
        *self
            .shared
            .bot_user_id
            .write()
            .unwrap_or_else(|e| e.into_inner()) = id.clone();
        Ok(id)
    }

    async fn resolve_transcript_metadata(
        &self,
        guild_id: &str,
        channel_id: &str,
        participant_user_ids: &[String],
    ) -> Result<TranscriptMetadata> {
        let mut meta = TranscriptMetadata {
            discord_server_id: guild_id.to_string(),
            discord_server_name: guild_id.to_string(),
            discord_voice_channel_id: channel_id.to_string(),
            discord_voice_channel_name: channel_id.to_string(),
            participants: Vec::new(),
        };
        let http = self.http()?;
        let gid = parse_guild_id(guild_id)?;
        let cid = parse_channel_id(channel_id)?;

        let cached_guild_name = self
            .cache()
            .ok()
            .and_then(|cache| cache.guild(gid).map(|g| g.name.clone()));
        match cached_guild_name {
            Some(name) if !name.is_empty() => meta.discord_server_name = name,
            _ => {
                if let Ok(guild) = http.get_guild(gid).await {
                    if !guild.name.is_empty() {
                        meta.discord_server_name = guild.name;
                    }
                }
            }
        }
        if meta.discord_server_name == guild_id {
            warn!(guild_id, "discord guild name could not be resolved; using guild id fallback");
        }

        let cached_channel_name = self.cache().ok().and_then(|cache| {
            cache
                .guild(gid)
                .and_then(|g| g.channels.get(&cid).map(|c| c.name.clone()))
        });
        match cached_channel_name {
            Some(name) if !name.is_empty() => meta.discord_voice_channel_name = name,
            _ => {
                if let Ok(channel) = http.get_channel(cid).await {
                    if let Some(guild_channel) = channel.guild() {
                        if !guild_channel.name.is_empty() {
                            meta.discord_voice_channel_name = guild_channel.name;
                        }
                    }
                }
            }
        }
        if meta.discord_voice_channel_name == channel_id {
            warn!(channel_id, "discord channel name could not be resolved; using channel id fallback");
        }

        let mut seen = std::collections::HashSet::new();
        for user_id in participant_user_ids {
            let user_id = user_id.trim();
            if user_id.is_empty() || !seen.insert(user_id.to_string()) {
                continue;
            }
            meta.participants
                .push(self.resolve_participant(&http, gid, user_id).await);
        }
        Ok(meta)
    }

    async fn run(&self) -> Result<()> {
        let mut client = self
            .client
            .lock()
            .await
            .take()
            .context("discord client is not connected")?;
        client.start().await.context("discord gateway loop failed")
    }
}

impl GatewayClient {
    async fn resolve_participant(
        &self,
        http: &Http,
        gid: GuildId,
        user_id: &str,
    ) -> TranscriptParticipant {
        let uid = match parse_user_id(user_id) {
            Ok(uid) => uid,
            Err(_) => {
                return TranscriptParticipant {
                    user_id: user_id.to_string(),
                    display_name: user_id.to_string(),
                    is_bot: false,
                }
            }
        };

        // Cache first; the gateway keeps members of active voice channels warm.
        let cached = self.cache().ok().and_then(|cache| {
            cache.guild(gid).and_then(|guild| {
                guild.members.get(&uid).map(|member| {
                    let name = member.nick.clone().unwrap_or_else(|| {
                        preferred_display_name(
                            member.user.global_name.as_deref(),
                            &member.user.name,
                            user_id,
                        )
                    });
                    (name, member.user.bot)
                })
            })
        });
        if let Some((display_name, is_bot)) = cached {
            return TranscriptParticipant {
                user_id: user_id.to_string(),
                display_name,
                is_bot,
            };
        }

        if let Ok(member) = http.get_member(gid, uid).await {
            let name = member.nick.clone().unwrap_or_else(|| {
                preferred_display_name(
                    member.user.global_name.as_deref(),
                    &member.user.name,
                    user_id,
                )
            });
            return TranscriptParticipant {
                user_id: user_id.to_string(),
                display_name: name,
                is_bot: member.user.bot,
            };
        }

        if let Ok(user) = http.get_user(uid).await {
            return TranscriptParticipant {
                user_id: user_id.to_string(),
                display_name: preferred_display_name(
                    user.global_name.as_deref(),
                    &user.name,
                    user_id,
                ),
                is_bot: user.bot,
            };
        }

        TranscriptParticipant {
            user_id: user_id.to_string(),
            display_name: user_id.to_string(),
            is_bot: false,
        }
    }
}

struct EventDispatcher {
    shared: Arc<GatewayShared>,
}

#[serenity::async_trait]
impl EventHandler for EventDispatcher {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(bot_user = %ready.user.name, "discord gateway ready");
        *self
            .shared
            .bot_user_id
            .write()
            .unwrap_or_else(|e| e.into_inner()) = ready.user.id.to_string();
    }

    async fn voice_state_update(&self, _ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let before_channel_id = old
            .as_ref()
            .and_then(|o| o.channel_id)
            .map(|c| c.to_string())
            .unwrap_or_default();
        let after_channel_id = new.channel_id.map(|c| c.to_string()).unwrap_or_default();
        // Mute/deafen toggles arrive as updates within the same channel.
        if before_channel_id == after_channel_id && !before_channel_id.is_empty() {
            return;
        }
        let guild_id = new.guild_id.map(|g| g.to_string()).unwrap_or_default();
        let user_id = new.user_id.to_string();
        if guild_id.is_empty() || user_id.is_empty() {
            return;
        }
        let user_is_bot = new.member.as_ref().map(|m| m.user.bot).unwrap_or(false);

        let handler = self
            .shared
            .voice_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(VoiceStateEvent {
                guild_id,
                user_id,
                user_is_bot,
                before_channel_id,
                after_channel_id,
            })
            .await;
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };
        if command.data.name.is_empty() {
            return;
        }
        let guild_id = command.guild_id.map(|g| g.to_string()).unwrap_or_default();
        let channel_id = command.channel_id.to_string();
        let command_name = command.data.name.to_string();
        let user_id = command.user.id.to_string();
        if user_id.is_empty() {
            return;
        }
        info!(guild_id, channel_id, command = %command_name, user_id, "slash command interaction received");

        let handler = self
            .shared
            .slash_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(handler) = handler else {
            return;
        };

        let responder = ephemeral_responder(ctx, command);
        handler(SlashCommandEvent {
            guild_id,
            channel_id,
            command_name,
            user_id,
            respond_ephemeral: Some(responder),
        })
        .await;
    }
}

fn ephemeral_responder(ctx: Context, command: CommandInteraction) -> EphemeralResponder {
    let command = Arc::new(command);
    Arc::new(move |content: String| {
        let http = Arc::clone(&ctx.http);
        let command = Arc::clone(&command);
        Box::pin(async move {
            command
                .create_response(
                    &*http,
                    CreateInteractionResponse::Message(
                        CreateInteractionResponseMessage::new()
                            .content(content)
                            .ephemeral(true),
                    ),
                )
                .await
                .context("failed to respond to interaction")
        })
    })
}

/// One songbird call, owned by one session.
struct GatewayVoice {
    call: Arc<tokio::sync::Mutex<Call>>,
}

#[async_trait]
impl VoiceConnection for GatewayVoice {
    async fn disconnect(&self) -> Result<()> {
        let mut call = self.call.lock().await;
        call.leave().await.context("failed to leave voice channel")
    }

    async fn receive_audio(&self, callback: AudioCallback) -> Result<()> {
        let ssrc_to_user: Arc<StdRwLock<HashMap<u32, String>>> = Arc::default();
        let mut call = self.call.lock().await;
        call.add_global_event(
            CoreEvent::SpeakingStateUpdate.into(),
            SpeakingHandler {
                ssrc_to_user: Arc::clone(&ssrc_to_user),
            },
        );
        call.add_global_event(
            CoreEvent::RtpPacket.into(),
            PacketHandler {
                ssrc_to_user,
                callback,
            },
        );
        Ok(())
    }
}

struct SpeakingHandler {
    ssrc_to_user: Arc<StdRwLock<HashMap<u32, String>>>,
}

#[async_trait]
impl songbird::EventHandler for SpeakingHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<songbird::Event> {
        if let EventContext::SpeakingStateUpdate(speaking) = ctx {
            if let Some(user_id) = speaking.user_id {
                self.ssrc_to_user
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(speaking.ssrc, user_id.0.to_string());
            }
        }
        None
    }
}

struct PacketHandler {
    ssrc_to_user: Arc<StdRwLock<HashMap<u32, String>>>,
    callback: AudioCallback,
}

#[async_trait]
impl songbird::EventHandler for PacketHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<songbird::Event> {
        if let EventContext::RtpPacket(data) = ctx {
            let packet = &data.packet;
            if packet.len() < 12 {
                return None;
            }
            // SSRC sits at bytes 8..12 of the fixed RTP header.
            let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
            let start = data.payload_offset;
            let end = packet.len().saturating_sub(data.payload_end_pad);
            if start >= end {
                return None;
            }
            let user_id = self
                .ssrc_to_user
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&ssrc)
                .cloned()
                .unwrap_or_else(|| ssrc.to_string());
            (self.callback)(&user_id, &packet[start..end]);
        } else {
            debug!("unexpected event in rtp packet handler");
        }
        None
    }
}
