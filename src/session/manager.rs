use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration as StdDuration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audio::{Mixer, MixerFactory, FRAME_BYTES};
use crate::config::Config;
use crate::discord::{
    AudioCallback, Client, FileMessage, SlashCommandDefinition, SlashCommandEvent,
    TranscriptMetadata, TranscriptParticipant, VoiceConnection, VoiceStateEvent,
};
use crate::speech::{ResultReceiver, StreamWriter, Transcriber};
use crate::storage::{
    CompleteSessionInput, CreateSessionInput, InsertSegmentInput, Repository,
    SaveSessionOutputInput, Session, SessionParticipantSnapshot, TranscriptSegment,
};
use crate::webhook::Sender;

use super::formatter::{build_transcript_text, build_transcript_webhook_payload};
use super::messages::{
    start_ephemeral_title, stop_ephemeral_title, stop_reason_detail,
    stop_reason_needs_restart_again, MESSAGE_ATTACHMENT_TITLE, MESSAGE_EPHEMERAL_ALREADY_RUNNING,
    MESSAGE_EPHEMERAL_JOIN_VC_FIRST, MESSAGE_EPHEMERAL_NOT_RUNNING,
    MESSAGE_EPHEMERAL_START_FAILED,
    MESSAGE_EPHEMERAL_UNKNOWN_COMMAND, MESSAGE_EPHEMERAL_VOICE_LOOKUP_FAILED,
    MESSAGE_EPHEMERAL_WRONG_GUILD, MESSAGE_POWERED_BY_LINE, MESSAGE_START_CHANNEL_HINT,
    MESSAGE_START_CHANNEL_TITLE, MESSAGE_START_EPHEMERAL_HINT,
    MESSAGE_START_EPHEMERAL_SECOND_LINE, MESSAGE_STOP_CHANNEL_TITLE, MESSAGE_STOP_EPHEMERAL_HINT,
    MESSAGE_STOP_RESTART, MESSAGE_STOP_RESTART_AGAIN, SLASH_COMMAND_START_DESCRIPTION,
    SLASH_COMMAND_STOP_DESCRIPTION,
};

const AUDIO_MIX_INTERVAL: StdDuration = StdDuration::from_millis(20);
const AUDIO_STATS_INTERVAL: StdDuration = StdDuration::from_secs(5);
const STOP_ALL_WAIT_LIMIT: StdDuration = StdDuration::from_secs(15);

pub const COMMAND_MOJIOKOSHI: &str = "mojiokoshi";
pub const COMMAND_MOJIOKOSHI_STOP: &str = "mojiokoshi-stop";

pub const STOP_REASON_PARTICIPANTS_LEFT: &str = "all participants left voice channel";
pub const STOP_REASON_MANUAL_SLASH: &str = "stopped by slash command";
pub const STOP_REASON_MAX_DURATION: &str = "maximum transcribe duration exceeded";
pub const STOP_REASON_BOT_REMOVED: &str = "transcription bot was removed from voice channel";
pub const STOP_REASON_SERVER_CLOSED: &str = "transcription server closed";
pub const STOP_REASON_UNKNOWN_ERROR: &str = "unknown error";

/// Reported when an error arrives after the stop reason was already consumed
/// or never recorded.
const STOP_REASON_ABSENT: &str = "unknown (likely remote stream close or network interruption)";

/// Definitions for the two guild slash commands, upserted at startup.
pub fn slash_command_definitions() -> Vec<SlashCommandDefinition> {
    vec![
        SlashCommandDefinition {
            name: COMMAND_MOJIOKOSHI.to_string(),
            description: SLASH_COMMAND_START_DESCRIPTION.to_string(),
        },
        SlashCommandDefinition {
            name: COMMAND_MOJIOKOSHI_STOP.to_string(),
            description: SLASH_COMMAND_STOP_DESCRIPTION.to_string(),
        },
    ]
}

#[derive(Debug, Clone, Copy)]
struct ParticipantState {
    is_bot: bool,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

#[derive(Default)]
struct ParticipantMaps {
    /// Users whose presence keeps the session alive.
    active: HashMap<String, ParticipantState>,
    /// Every user ever observed during the session, for final metadata.
    all: HashMap<String, ParticipantState>,
}

impl ParticipantMaps {
    /// Monotonic merge: the bot flag is sticky, seen bounds only widen.
    fn observe(&mut self, user_id: &str, is_bot: bool, at: DateTime<Utc>) {
        self.all
            .entry(user_id.to_string())
            .and_modify(|state| {
                state.is_bot |= is_bot;
                if at < state.first_seen_at {
                    state.first_seen_at = at;
                }
                if at > state.last_seen_at {
                    state.last_seen_at = at;
                }
            })
            .or_insert(ParticipantState {
                is_bot,
                first_seen_at: at,
                last_seen_at: at,
            });
    }
}

/// In-memory state of one live session. Registered in the manager's registry
/// until a stop path extracts it; the extracting path owns the teardown.
struct RunningSession {
    repo_session: Session,
    voice: Option<Arc<dyn VoiceConnection>>,
    mixer: Option<Arc<dyn Mixer>>,
    writer: Option<Arc<dyn StreamWriter>>,
    cancel: CancellationToken,
    participants: StdMutex<ParticipantMaps>,
}

type SessionKey = (String, String);

struct RegistryState {
    sessions: HashMap<SessionKey, Arc<RunningSession>>,
    /// sessionID -> reason, published by the extracting stop path so the
    /// recognition receiver can report why its stream died.
    stop_reasons: HashMap<Uuid, String>,
    bot_user_id: String,
}

/// Concurrent, per-(guild, channel) owner of the complete transcription
/// session lifecycle.
pub struct Manager {
    cfg: Config,
    repo: Arc<dyn Repository>,
    discord: Arc<dyn Client>,
    transcriber: Arc<dyn Transcriber>,
    webhook: Arc<dyn Sender>,
    mixer_factory: MixerFactory,
    transcript_tz: Tz,
    state: StdMutex<RegistryState>,
    /// Back-reference to the owning `Arc` so spawned workers and detached
    /// finalizers can hold the manager alive.
    weak_self: Weak<Manager>,
}

impl Manager {
    pub fn new(
        cfg: Config,
        repo: Arc<dyn Repository>,
        discord: Arc<dyn Client>,
        transcriber: Arc<dyn Transcriber>,
        webhook: Arc<dyn Sender>,
        mixer_factory: MixerFactory,
    ) -> Arc<Self> {
        let transcript_tz = cfg.transcript_timezone.parse().unwrap_or_else(|_| {
            warn!(
                timezone = %cfg.transcript_timezone,
                "failed to load transcript timezone; falling back to UTC"
            );
            chrono_tz::UTC
        });
        Arc::new_cyclic(|weak_self| Self {
            cfg,
            repo,
            discord,
            transcriber,
            webhook,
            mixer_factory,
            transcript_tz,
            state: StdMutex::new(RegistryState {
                sessions: HashMap::new(),
                stop_reasons: HashMap::new(),
                bot_user_id: String::new(),
            }),
            weak_self: weak_self.clone(),
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `None` only during final teardown, once the last owning `Arc` is gone.
    fn upgrade_self(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    pub fn set_bot_user_id(&self, bot_user_id: &str) {
        let bot_user_id = bot_user_id.trim();
        if bot_user_id.is_empty() {
            return;
        }
        self.lock_state().bot_user_id = bot_user_id.to_string();
    }

    async fn get_bot_user_id(&self) -> String {
        {
            let state = self.lock_state();
            if !state.bot_user_id.is_empty() {
                return state.bot_user_id.clone();
            }
        }
        let Ok(resolved) = self.discord.get_bot_user_id().await else {
            return String::new();
        };
        let mut state = self.lock_state();
        if state.bot_user_id.is_empty() {
            state.bot_user_id = resolved.trim().to_string();
        }
        state.bot_user_id.clone()
    }

    fn is_session_running(&self, guild_id: &str, channel_id: &str) -> bool {
        let key = (guild_id.to_string(), channel_id.to_string());
        self.lock_state().sessions.contains_key(&key)
    }

    // ------------------------------------------------------------------
    // Slash commands
    // ------------------------------------------------------------------

    pub async fn handle_slash_command(&self, event: SlashCommandEvent) {
        info!(
            guild_id = %event.guild_id,
            channel_id = %event.channel_id,
            command = %event.command_name,
            user_id = %event.user_id,
            "slash command received by manager"
        );
        if event.guild_id != self.cfg.discord_guild_id {
            self.respond_ephemeral(&event, MESSAGE_EPHEMERAL_WRONG_GUILD).await;
            return;
        }

        match event.command_name.as_str() {
            COMMAND_MOJIOKOSHI => self.handle_start_command(event).await,
            COMMAND_MOJIOKOSHI_STOP => self.handle_stop_command(event).await,
            _ => {
                warn!(
                    command = %event.command_name,
                    guild_id = %event.guild_id,
                    channel_id = %event.channel_id,
                    user_id = %event.user_id,
                    "unknown slash command received"
                );
                self.respond_ephemeral(&event, MESSAGE_EPHEMERAL_UNKNOWN_COMMAND).await;
            }
        }
    }

    async fn handle_start_command(&self, event: SlashCommandEvent) {
        let channel_id = match self
            .discord
            .get_user_voice_channel_id(&event.guild_id, &event.user_id)
            .await
        {
            Ok(channel_id) => channel_id,
            Err(err) => {
                error!(
                    error = %err,
                    guild_id = %event.guild_id,
                    user_id = %event.user_id,
                    command = %event.command_name,
                    "failed to resolve user voice channel"
                );
                self.respond_ephemeral(&event, MESSAGE_EPHEMERAL_VOICE_LOOKUP_FAILED).await;
                return;
            }
        };
        if channel_id.is_empty() {
            self.respond_ephemeral(&event, MESSAGE_EPHEMERAL_JOIN_VC_FIRST).await;
            return;
        }
        if self.is_session_running(&event.guild_id, &channel_id) {
            self.respond_ephemeral(&event, MESSAGE_EPHEMERAL_ALREADY_RUNNING).await;
            return;
        }
        if let Err(err) = self
            .start_session(&event.guild_id, &channel_id, &event.user_id, false)
            .await
        {
            error!(
                error = %err,
                guild_id = %event.guild_id,
                channel_id = %channel_id,
                user_id = %event.user_id,
                "failed to start session by slash command"
            );
            self.respond_ephemeral(&event, MESSAGE_EPHEMERAL_START_FAILED).await;
            return;
        }
        self.respond_ephemeral(&event, &self.start_ephemeral_message(&channel_id)).await;
    }

    async fn handle_stop_command(&self, event: SlashCommandEvent) {
        let channel_id = match self
            .discord
            .get_user_voice_channel_id(&event.guild_id, &event.user_id)
            .await
        {
            Ok(channel_id) => channel_id,
            Err(err) => {
                error!(
                    error = %err,
                    guild_id = %event.guild_id,
                    user_id = %event.user_id,
                    command = %event.command_name,
                    "failed to resolve user voice channel"
                );
                self.respond_ephemeral(&event, MESSAGE_EPHEMERAL_VOICE_LOOKUP_FAILED).await;
                return;
            }
        };
        if channel_id.is_empty() {
            self.respond_ephemeral(&event, MESSAGE_EPHEMERAL_JOIN_VC_FIRST).await;
            return;
        }
        let stopped = self
            .stop_session(&event.guild_id, &channel_id, STOP_REASON_MANUAL_SLASH)
            .await;
        if !stopped {
            self.respond_ephemeral(&event, MESSAGE_EPHEMERAL_NOT_RUNNING).await;
            return;
        }
        self.respond_ephemeral(&event, &self.stop_ephemeral_message(&channel_id)).await;
    }

    async fn respond_ephemeral(&self, event: &SlashCommandEvent, content: &str) {
        let Some(responder) = event.respond_ephemeral.as_ref() else {
            return;
        };
        if let Err(err) = responder(content.to_string()).await {
            error!(
                error = %err,
                guild_id = %event.guild_id,
                channel_id = %event.channel_id,
                command = %event.command_name,
                user_id = %event.user_id,
                "failed to respond ephemeral message"
            );
        }
    }

    // ------------------------------------------------------------------
    // Voice-state events
    // ------------------------------------------------------------------

    pub async fn handle_voice_state_update(&self, event: VoiceStateEvent) {
        info!(
            guild_id = %event.guild_id,
            user_id = %event.user_id,
            user_is_bot = event.user_is_bot,
            before_channel_id = %event.before_channel_id,
            after_channel_id = %event.after_channel_id,
            "voice state update received"
        );
        if event.guild_id != self.cfg.discord_guild_id {
            info!(
                event_guild_id = %event.guild_id,
                configured_guild_id = %self.cfg.discord_guild_id,
                "ignoring voice event for different guild"
            );
            return;
        }
        if self.handle_bot_removal_event(&event).await {
            return;
        }
        self.track_voice_participants(&event).await;
        self.start_auto_transcribe_if_configured(&event).await;
    }

    async fn handle_bot_removal_event(&self, event: &VoiceStateEvent) -> bool {
        if !self.is_self_bot_removed_from_voice_channel(event).await {
            return false;
        }
        self.stop_session(&event.guild_id, &event.before_channel_id, STOP_REASON_BOT_REMOVED)
            .await;
        true
    }

    async fn is_self_bot_removed_from_voice_channel(&self, event: &VoiceStateEvent) -> bool {
        if event.before_channel_id.is_empty()
            || event.before_channel_id == event.after_channel_id
        {
            return false;
        }
        let bot_user_id = self.get_bot_user_id().await;
        !bot_user_id.is_empty() && event.user_id == bot_user_id
    }

    async fn track_voice_participants(&self, event: &VoiceStateEvent) {
        if event.before_channel_id.is_empty() && event.after_channel_id.is_empty() {
            self.remove_participant_from_known_sessions(
                &event.guild_id,
                &event.user_id,
                event.user_is_bot,
            )
            .await;
            return;
        }
        if !event.before_channel_id.is_empty() {
            self.remove_participant_and_maybe_stop(
                &event.guild_id,
                &event.before_channel_id,
                &event.user_id,
                event.user_is_bot,
            )
            .await;
        }
        if !event.after_channel_id.is_empty() {
            self.add_participant_if_session_running(
                &event.guild_id,
                &event.after_channel_id,
                &event.user_id,
                event.user_is_bot,
            )
            .await;
        }
    }

    /// Some gateways deliver leave events with no channel on either side;
    /// infer the affected sessions from active-participant membership.
    async fn remove_participant_from_known_sessions(
        &self,
        guild_id: &str,
        user_id: &str,
        user_is_bot: bool,
    ) {
        if guild_id.trim().is_empty() || user_id.trim().is_empty() {
            return;
        }
        let channel_ids = self.find_session_channels_by_active_participant(guild_id, user_id);
        for channel_id in channel_ids {
            self.remove_participant_and_maybe_stop(guild_id, &channel_id, user_id, user_is_bot)
                .await;
        }
    }

    fn find_session_channels_by_active_participant(
        &self,
        guild_id: &str,
        user_id: &str,
    ) -> Vec<String> {
        let state = self.lock_state();
        state
            .sessions
            .iter()
            .filter(|((session_guild, channel), rs)| {
                session_guild == guild_id
                    && !channel.trim().is_empty()
                    && rs
                        .participants
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .active
                        .contains_key(user_id)
            })
            .map(|((_, channel), _)| channel.clone())
            .collect()
    }

    async fn start_auto_transcribe_if_configured(&self, event: &VoiceStateEvent) {
        if !self.cfg.discord_auto_transcribe {
            return;
        }
        let target_channel_id = self.cfg.discord_auto_transcribable_vc_id.clone();
        if target_channel_id.is_empty() {
            return;
        }

        let joined_target = event.after_channel_id == target_channel_id
            && event.before_channel_id != target_channel_id;
        if joined_target {
            if let Err(err) = self
                .start_session(&event.guild_id, &target_channel_id, &event.user_id, event.user_is_bot)
                .await
            {
                error!(error = %err, "failed to start session");
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle: start
    // ------------------------------------------------------------------

    pub async fn start_session(
        &self,
        guild_id: &str,
        channel_id: &str,
        user_id: &str,
        user_is_bot: bool,
    ) -> Result<()> {
        if user_id.trim().is_empty() {
            return Ok(());
        }
        let key = (guild_id.to_string(), channel_id.to_string());
        info!(
            guild_id,
            channel_id,
            user_id,
            user_is_bot,
            "start session requested"
        );

        let countable = self.should_count_lifecycle_participant(user_id, user_is_bot).await;

        {
            let state = self.lock_state();
            if let Some(rs) = state.sessions.get(&key) {
                self.register_session_join(rs, user_id, user_is_bot, countable, Utc::now());
                let maps = rs.participants.lock().unwrap_or_else(|e| e.into_inner());
                info!(
                    guild_id,
                    channel_id,
                    active_participants = maps.active.len(),
                    all_participants = maps.all.len(),
                    "session already active in memory; added participant"
                );
                return Ok(());
            }
        }

        if !countable {
            info!(
                guild_id,
                channel_id,
                user_id,
                user_is_bot,
                "ignoring join event that does not count toward session lifecycle"
            );
            return Ok(());
        }

        self.cleanup_orphan_running_session(guild_id, channel_id).await?;
        let runtime = self.initialize_session_runtime(guild_id, channel_id).await?;
        let session_id = runtime.created.id;
        let started_at = runtime.started_at;
        let ctx = runtime.ctx.clone();
        let mixer = Arc::clone(&runtime.mixer);
        let voice = Arc::clone(&runtime.voice);
        let writer = Arc::clone(&runtime.writer);

        let rs = Arc::new(RunningSession {
            repo_session: runtime.created,
            voice: Some(runtime.voice),
            mixer: Some(runtime.mixer),
            writer: Some(runtime.writer),
            cancel: runtime.ctx,
            participants: StdMutex::new(ParticipantMaps::default()),
        });
        self.register_session_join(&rs, user_id, user_is_bot, countable, started_at);

        match self
            .discord
            .list_voice_channel_participants(guild_id, channel_id)
            .await
        {
            Ok(participants) => {
                for p in participants {
                    let countable = self
                        .should_count_lifecycle_participant(&p.user_id, p.is_bot)
                        .await;
                    self.register_session_join(&rs, &p.user_id, p.is_bot, countable, started_at);
                }
            }
            Err(err) => {
                warn!(
                    error = %err,
                    guild_id,
                    channel_id,
                    "failed to list voice channel participants"
                );
            }
        }

        {
            let mut state = self.lock_state();
            if state.sessions.contains_key(&key) {
                // A racing start won while we were setting up; yield to it.
                drop(state);
                self.terminate_session_runtime(&rs).await;
                return Ok(());
            }
            state.sessions.insert(key, Arc::clone(&rs));
        }
        {
            let maps = rs.participants.lock().unwrap_or_else(|e| e.into_inner());
            info!(
                guild_id,
                channel_id,
                %session_id,
                active_participants = maps.active.len(),
                all_participants = maps.all.len(),
                "session activated"
            );
        }

        let _ = self
            .discord
            .send_channel_message(channel_id, &self.start_channel_message())
            .await;

        let received_opus_packets = Arc::new(AtomicI64::new(0));
        {
            let counter = Arc::clone(&received_opus_packets);
            let mixer = Arc::clone(&mixer);
            let ctx = ctx.clone();
            self.run_session_worker(guild_id, channel_id, session_id, "voice_receive", async move {
                let callback: AudioCallback = Arc::new(move |audio_user_id: &str, opus: &[u8]| {
                    let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if n == 1 || n % 500 == 0 {
                        info!(
                            %session_id,
                            user_id = audio_user_id,
                            packet_bytes = opus.len(),
                            total_packets = n,
                            "received opus packet"
                        );
                    }
                    mixer.write_opus_packet(audio_user_id, opus);
                });
                if let Err(err) = voice.receive_audio(callback).await {
                    warn!(error = %err, %session_id, "failed to register voice receiver");
                    return;
                }
                ctx.cancelled().await;
            });
        }
        {
            let counter = Arc::clone(&received_opus_packets);
            let ctx = ctx.clone();
            self.run_session_worker(guild_id, channel_id, session_id, "audio_stream", async move {
                stream_mixed_audio(ctx, session_id, mixer, writer, counter).await;
            });
        }
        if let Some(manager) = self.upgrade_self() {
            let watch_guild_id = guild_id.to_string();
            let watch_channel_id = channel_id.to_string();
            self.run_session_worker(
                guild_id,
                channel_id,
                session_id,
                "session_timeout_watch",
                async move {
                    manager
                        .watch_session_timeout_for_session(
                            ctx,
                            &watch_guild_id,
                            &watch_channel_id,
                            session_id,
                        )
                        .await;
                },
            );
        }
        Ok(())
    }

    /// Spawns a session worker; a panic inside it degrades to a clean
    /// `stop_session("unknown error")`.
    fn run_session_worker(
        &self,
        guild_id: &str,
        channel_id: &str,
        session_id: Uuid,
        worker_name: &'static str,
        fut: impl Future<Output = ()> + Send + 'static,
    ) {
        let Some(manager) = self.upgrade_self() else {
            return;
        };
        let guild_id = guild_id.to_string();
        let channel_id = channel_id.to_string();
        tokio::spawn(async move {
            let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await else {
                return;
            };
            error!(
                panic = %panic_message(payload.as_ref()),
                worker = worker_name,
                %session_id,
                guild_id = %guild_id,
                channel_id = %channel_id,
                "session worker panicked"
            );
            if !manager
                .stop_session(&guild_id, &channel_id, STOP_REASON_UNKNOWN_ERROR)
                .await
            {
                error!(
                    %session_id,
                    worker = worker_name,
                    "failed to stop session after worker panic"
                );
            }
        });
    }

    async fn cleanup_orphan_running_session(&self, guild_id: &str, channel_id: &str) -> Result<()> {
        let sess = self
            .repo
            .get_running_session_by_channel(guild_id, channel_id)
            .await
            .map_err(|err| {
                error!(error = %err, guild_id, channel_id, "failed to query running session");
                err
            })?;
        let Some(sess) = sess else {
            return Ok(());
        };
        warn!(
            session_id = %sess.id,
            guild_id,
            channel_id,
            "found orphan running session in repository; closing and continuing"
        );
        self.repo
            .update_session_completed(CompleteSessionInput {
                session_id: sess.id,
                ended_at: Utc::now(),
            })
            .await
            .map_err(|err| {
                error!(error = %err, session_id = %sess.id, guild_id, channel_id, "failed to complete orphan session");
                err
            })?;
        info!(session_id = %sess.id, guild_id, channel_id, "orphan running session marked as completed");
        Ok(())
    }

    async fn initialize_session_runtime(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<SessionRuntime> {
        let Some(manager) = self.upgrade_self() else {
            anyhow::bail!("manager is shutting down");
        };
        let voice = self
            .discord
            .join_voice_channel(guild_id, channel_id)
            .await
            .map_err(|err| {
                error!(error = %err, guild_id, channel_id, "failed to join voice channel");
                err
            })?;
        info!(guild_id, channel_id, "joined voice channel");

        let started_at = Utc::now();
        let created = match self
            .repo
            .create_session(CreateSessionInput {
                guild_id: guild_id.to_string(),
                channel_id: channel_id.to_string(),
                started_at,
            })
            .await
        {
            Ok(created) => created,
            Err(err) => {
                let _ = voice.disconnect().await;
                error!(error = %err, guild_id, channel_id, "failed to create session in repository");
                return Err(err);
            }
        };
        info!(session_id = %created.id, guild_id, channel_id, "created session");

        let mixer = (self.mixer_factory)();
        let ctx = CancellationToken::new();
        let receiver: Arc<dyn ResultReceiver> = Arc::new(SessionResultReceiver {
            manager,
            session_id: created.id,
            channel_id: channel_id.to_string(),
            next_index: StdMutex::new(0),
        });
        let writer = match self
            .transcriber
            .start_streaming(
                ctx.clone(),
                created.id,
                &self.cfg.default_transcribe_language,
                receiver,
            )
            .await
        {
            Ok(writer) => writer,
            Err(err) => {
                // The session row stays `running`; the next start's orphan
                // cleanup completes it.
                ctx.cancel();
                mixer.close();
                let _ = voice.disconnect().await;
                error!(error = %err, session_id = %created.id, "failed to start transcriber streaming");
                return Err(err);
            }
        };
        info!(session_id = %created.id, "transcriber streaming started");

        Ok(SessionRuntime {
            created,
            started_at,
            ctx,
            mixer,
            voice,
            writer,
        })
    }

    async fn watch_session_timeout_for_session(
        &self,
        ctx: CancellationToken,
        guild_id: &str,
        channel_id: &str,
        session_id: Uuid,
    ) {
        let max_minutes = self.cfg.max_transcribe_duration_min;
        if max_minutes <= 0 {
            self.stop_session(guild_id, channel_id, STOP_REASON_MAX_DURATION).await;
            return;
        }
        let max_duration = StdDuration::from_secs(max_minutes as u64 * 60);
        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = tokio::time::sleep(max_duration) => {}
        }

        let key = (guild_id.to_string(), channel_id.to_string());
        let still_same_session = {
            let state = self.lock_state();
            state
                .sessions
                .get(&key)
                .map(|rs| rs.repo_session.id == session_id)
                .unwrap_or(false)
        };
        if !still_same_session {
            return;
        }
        self.stop_session(guild_id, channel_id, STOP_REASON_MAX_DURATION).await;
    }

    // ------------------------------------------------------------------
    // Participant tracking
    // ------------------------------------------------------------------

    /// The bot itself never counts; other bots count only when configured;
    /// everyone else always counts.
    async fn should_count_lifecycle_participant(&self, user_id: &str, is_bot: bool) -> bool {
        if user_id.trim().is_empty() {
            return false;
        }
        let bot_user_id = self.get_bot_user_id().await;
        if !bot_user_id.is_empty() && bot_user_id == user_id {
            return false;
        }
        if !is_bot {
            return true;
        }
        self.cfg.discord_count_other_bots_as_participants
    }

    fn register_session_join(
        &self,
        rs: &RunningSession,
        user_id: &str,
        user_is_bot: bool,
        countable: bool,
        seen_at: DateTime<Utc>,
    ) {
        if user_id.trim().is_empty() {
            return;
        }
        let mut maps = rs.participants.lock().unwrap_or_else(|e| e.into_inner());
        maps.observe(user_id, user_is_bot, seen_at);
        if countable {
            maps.active.insert(
                user_id.to_string(),
                ParticipantState {
                    is_bot: user_is_bot,
                    first_seen_at: seen_at,
                    last_seen_at: seen_at,
                },
            );
        }
    }

    async fn add_participant_if_session_running(
        &self,
        guild_id: &str,
        channel_id: &str,
        user_id: &str,
        user_is_bot: bool,
    ) {
        if channel_id.trim().is_empty() || user_id.trim().is_empty() {
            return;
        }
        let countable = self.should_count_lifecycle_participant(user_id, user_is_bot).await;
        let now = Utc::now();
        let key = (guild_id.to_string(), channel_id.to_string());
        let state = self.lock_state();
        let Some(rs) = state.sessions.get(&key) else {
            return;
        };
        self.register_session_join(rs, user_id, user_is_bot, countable, now);
    }

    async fn remove_participant_and_maybe_stop(
        &self,
        guild_id: &str,
        channel_id: &str,
        user_id: &str,
        user_is_bot: bool,
    ) {
        let countable = self.should_count_lifecycle_participant(user_id, user_is_bot).await;
        let now = Utc::now();
        let key = (guild_id.to_string(), channel_id.to_string());
        let remaining = {
            let state = self.lock_state();
            let Some(rs) = state.sessions.get(&key) else {
                return;
            };
            let mut maps = rs.participants.lock().unwrap_or_else(|e| e.into_inner());
            maps.observe(user_id, user_is_bot, now);
            if countable {
                maps.active.remove(user_id);
            }
            maps.active.len()
        };
        if remaining > 0 {
            return;
        }
        self.stop_session(guild_id, channel_id, STOP_REASON_PARTICIPANTS_LEFT).await;
    }

    // ------------------------------------------------------------------
    // Lifecycle: stop
    // ------------------------------------------------------------------

    /// Stops the session at `(guild_id, channel_id)`. Exactly one of any
    /// concurrent callers extracts the entry and wins; losers get `false`.
    pub async fn stop_session(
        &self,
        guild_id: &str,
        channel_id: &str,
        reason: &str,
    ) -> bool {
        let reason = normalize_stop_reason(reason);
        let Some(rs) = self.extract_single_session_for_stop(guild_id, channel_id, reason) else {
            return false;
        };

        let ended_at = Utc::now();
        info!(
            session_id = %rs.repo_session.id,
            channel_id,
            reason,
            "stopping session"
        );
        self.terminate_session_runtime(&rs).await;

        if let Some(manager) = self.upgrade_self() {
            let channel_id = channel_id.to_string();
            let reason = reason.to_string();
            tokio::spawn(async move {
                manager.run_finalize_session(rs, channel_id, reason, ended_at).await;
            });
        }
        true
    }

    fn extract_single_session_for_stop(
        &self,
        guild_id: &str,
        channel_id: &str,
        reason: &str,
    ) -> Option<Arc<RunningSession>> {
        let key = (guild_id.to_string(), channel_id.to_string());
        let mut state = self.lock_state();
        let rs = state.sessions.remove(&key)?;
        state
            .stop_reasons
            .insert(rs.repo_session.id, reason.to_string());
        Some(rs)
    }

    /// Drains every running session, tearing them down and finalizing in
    /// parallel. Bounded by a 15 s wait; late finalizers are logged and
    /// abandoned.
    pub async fn stop_all_sessions(&self, reason: &str) -> usize {
        let reason = normalize_stop_reason(reason);
        let sessions: Vec<(String, Arc<RunningSession>)> = {
            let mut state = self.lock_state();
            let drained: Vec<_> = state.sessions.drain().collect();
            let mut out = Vec::with_capacity(drained.len());
            for ((_, channel_id), rs) in drained {
                state
                    .stop_reasons
                    .insert(rs.repo_session.id, reason.to_string());
                let channel_id = if rs.repo_session.channel_id.is_empty() {
                    channel_id
                } else {
                    rs.repo_session.channel_id.clone()
                };
                out.push((channel_id, rs));
            }
            out
        };
        if sessions.is_empty() {
            return 0;
        }

        let count = sessions.len();
        let Some(manager) = self.upgrade_self() else {
            return count;
        };
        let mut handles = Vec::with_capacity(count);
        for (channel_id, rs) in sessions {
            let manager = Arc::clone(&manager);
            let reason = reason.to_string();
            handles.push(tokio::spawn(async move {
                manager.terminate_session_runtime(&rs).await;
                manager.run_finalize_session(rs, channel_id, reason, Utc::now()).await;
            }));
        }

        if tokio::time::timeout(STOP_ALL_WAIT_LIMIT, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                reason,
                session_count = count,
                timeout_secs = STOP_ALL_WAIT_LIMIT.as_secs(),
                "timed out waiting for session finalization on shutdown"
            );
        }
        count
    }

    /// Tears down the runtime owned by the extracted session. Every step
    /// tolerates absence and failure.
    async fn terminate_session_runtime(&self, rs: &RunningSession) {
        rs.cancel.cancel();
        if let Some(writer) = rs.writer.as_ref() {
            if let Err(err) = writer.close().await {
                warn!(error = %err, session_id = %rs.repo_session.id, "failed to close recognition stream");
            }
        }
        if let Some(mixer) = rs.mixer.as_ref() {
            mixer.close();
        }
        if let Some(voice) = rs.voice.as_ref() {
            if let Err(err) = voice.disconnect().await {
                warn!(error = %err, session_id = %rs.repo_session.id, "failed to disconnect voice");
            }
        }
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    async fn run_finalize_session(
        &self,
        rs: Arc<RunningSession>,
        channel_id: String,
        reason: String,
        ended_at: DateTime<Utc>,
    ) {
        let session_id = rs.repo_session.id;
        let log_channel_id = channel_id.clone();
        let log_reason = reason.clone();
        let finalize = AssertUnwindSafe(self.finalize_session(rs, channel_id, reason, ended_at));
        if let Err(payload) = finalize.catch_unwind().await {
            error!(
                panic = %panic_message(payload.as_ref()),
                %session_id,
                channel_id = %log_channel_id,
                reason = %log_reason,
                "panic while finalizing session"
            );
        }
    }

    async fn finalize_session(
        &self,
        rs: Arc<RunningSession>,
        channel_id: String,
        reason: String,
        ended_at: DateTime<Utc>,
    ) {
        let s = &rs.repo_session;
        let segments = self.list_segments_best_effort(s.id).await;
        let (participant_user_ids, all_participants) = {
            let maps = rs.participants.lock().unwrap_or_else(|e| e.into_inner());
            let mut ids: Vec<String> = maps.all.keys().cloned().collect();
            ids.sort();
            (ids, maps.all.clone())
        };
        let meta = self
            .resolve_transcript_metadata_best_effort(s, &participant_user_ids, &all_participants)
            .await;
        let filename = format!("transcript-{}.txt", s.id);
        let body = build_transcript_text(
            &meta,
            s.started_at,
            ended_at,
            &self.cfg.transcript_timezone,
            self.transcript_tz,
            &segments,
        );
        self.send_discord_final_messages(s.id, &channel_id, &reason, &filename, &body).await;
        self.complete_session_best_effort(s.id, ended_at).await;

        let payload = build_transcript_webhook_payload(
            s.id,
            &meta,
            s.started_at,
            ended_at,
            &self.cfg.transcript_timezone,
            self.transcript_tz,
            &segments,
        );
        info!(
            session_id = %s.id,
            discord_server_id = %payload.discord_server_id,
            discord_server_name = %payload.discord_server_name,
            discord_voice_channel_id = %payload.discord_voice_channel_id,
            discord_voice_channel_name = %payload.discord_voice_channel_name,
            segment_count = payload.segment_count,
            "sending transcript webhook payload"
        );
        self.save_session_output_best_effort(s, &reason, ended_at, &meta, &filename, &body, &payload, &all_participants)
            .await;
        self.send_webhook_best_effort(s.id, &payload).await;
    }

    async fn list_segments_best_effort(&self, session_id: Uuid) -> Vec<TranscriptSegment> {
        match self.repo.list_segments_by_session_id(session_id).await {
            Ok(segments) => segments,
            Err(err) => {
                error!(error = %err, %session_id, "failed to list transcript segments");
                Vec::new()
            }
        }
    }

    async fn resolve_transcript_metadata_best_effort(
        &self,
        s: &Session,
        participant_user_ids: &[String],
        all_participants: &HashMap<String, ParticipantState>,
    ) -> TranscriptMetadata {
        let mut meta = match self
            .discord
            .resolve_transcript_metadata(&s.guild_id, &s.channel_id, participant_user_ids)
            .await
        {
            Ok(meta) => meta,
            Err(err) => {
                warn!(
                    error = %err,
                    session_id = %s.id,
                    "failed to resolve transcript metadata; using fallback values"
                );
                TranscriptMetadata {
                    discord_server_id: s.guild_id.clone(),
                    discord_server_name: s.guild_id.clone(),
                    discord_voice_channel_id: s.channel_id.clone(),
                    discord_voice_channel_name: s.channel_id.clone(),
                    participants: Vec::new(),
                }
            }
        };

        if meta.discord_server_id.is_empty() {
            meta.discord_server_id = s.guild_id.clone();
        }
        if meta.discord_server_name.is_empty() {
            meta.discord_server_name = s.guild_id.clone();
        }
        if meta.discord_voice_channel_id.is_empty() {
            meta.discord_voice_channel_id = s.channel_id.clone();
        }
        if meta.discord_voice_channel_name.is_empty() {
            meta.discord_voice_channel_name = s.channel_id.clone();
        }
        if meta.participants.is_empty() {
            meta.participants = participant_user_ids
                .iter()
                .map(|user_id| TranscriptParticipant {
                    user_id: user_id.clone(),
                    display_name: user_id.clone(),
                    is_bot: all_participants
                        .get(user_id)
                        .map(|state| state.is_bot)
                        .unwrap_or(false),
                })
                .collect();
        }
        info!(
            session_id = %s.id,
            discord_server_id = %meta.discord_server_id,
            discord_server_name = %meta.discord_server_name,
            discord_voice_channel_id = %meta.discord_voice_channel_id,
            discord_voice_channel_name = %meta.discord_voice_channel_name,
            participants = meta.participants.len(),
            "resolved transcript metadata"
        );
        meta
    }

    async fn send_discord_final_messages(
        &self,
        session_id: Uuid,
        channel_id: &str,
        reason: &str,
        filename: &str,
        body: &str,
    ) {
        if let Err(err) = self
            .discord
            .send_channel_message(channel_id, &self.stop_channel_message(reason))
            .await
        {
            error!(error = %err, %session_id, channel_id, reason, "failed to send stop message");
        }
        if let Err(err) = self
            .discord
            .send_channel_message_with_file(FileMessage {
                channel_id: channel_id.to_string(),
                content: self.transcript_attachment_message(),
                filename: filename.to_string(),
                file_body: body.as_bytes().to_vec(),
            })
            .await
        {
            error!(error = %err, %session_id, channel_id, "failed to send transcript attachment");
        }
    }

    async fn complete_session_best_effort(&self, session_id: Uuid, ended_at: DateTime<Utc>) {
        if let Err(err) = self
            .repo
            .update_session_completed(CompleteSessionInput { session_id, ended_at })
            .await
        {
            error!(error = %err, %session_id, "failed to complete session");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn save_session_output_best_effort(
        &self,
        s: &Session,
        reason: &str,
        ended_at: DateTime<Utc>,
        meta: &TranscriptMetadata,
        filename: &str,
        body: &str,
        payload: &crate::webhook::TranscriptWebhookPayload,
        all_participants: &HashMap<String, ParticipantState>,
    ) {
        let participants = build_participant_snapshots(meta, all_participants);
        let payload_json = match serde_json::to_value(payload) {
            Ok(value) => Some(value),
            Err(err) => {
                error!(
                    error = %err,
                    session_id = %s.id,
                    "failed to marshal webhook payload for database persistence"
                );
                None
            }
        };
        let input = SaveSessionOutputInput {
            session_id: s.id,
            ended_at,
            stop_reason: reason.to_string(),
            guild_name: meta.discord_server_name.clone(),
            channel_name: meta.discord_voice_channel_name.clone(),
            timezone: self.cfg.transcript_timezone.clone(),
            duration_seconds: payload.duration_seconds,
            segment_count: payload.segment_count,
            participants,
            transcript_filename: filename.to_string(),
            transcript_text: body.to_string(),
            webhook_payload_json: payload_json,
        };
        if let Err(err) = self.repo.save_session_output(input).await {
            error!(error = %err, session_id = %s.id, "failed to save session output");
        }
    }

    async fn send_webhook_best_effort(
        &self,
        session_id: Uuid,
        payload: &crate::webhook::TranscriptWebhookPayload,
    ) {
        if let Err(err) = self.webhook.send_transcript(payload).await {
            error!(error = %err, %session_id, "failed to send webhook transcript");
        }
    }

    // ------------------------------------------------------------------
    // Recognition results
    // ------------------------------------------------------------------

    async fn handle_transcription_result(
        &self,
        session_id: Uuid,
        channel_id: &str,
        segment_index: i32,
        text: &str,
        is_final: bool,
    ) {
        if !is_final || text.trim().is_empty() {
            return;
        }
        if let Err(err) = self
            .repo
            .insert_segment(InsertSegmentInput {
                session_id,
                content: text.to_string(),
                segment_index,
                spoken_at: Utc::now(),
            })
            .await
        {
            error!(error = %err, %session_id, "failed to insert segment");
            return;
        }
        if let Err(err) = self.discord.send_channel_message(channel_id, text).await {
            error!(error = %err, %session_id, "failed to post transcript message");
        }
    }

    pub(crate) fn take_stop_reason(&self, session_id: Uuid) -> String {
        let mut state = self.lock_state();
        match state.stop_reasons.remove(&session_id) {
            Some(reason) if !reason.is_empty() => reason,
            _ => STOP_REASON_ABSENT.to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Message rendering
    // ------------------------------------------------------------------

    fn start_channel_message(&self) -> String {
        let lines = vec![
            MESSAGE_START_CHANNEL_TITLE.to_string(),
            MESSAGE_START_CHANNEL_HINT.to_string(),
        ];
        self.with_powered_by_for_brand(lines).join("\n")
    }

    fn stop_channel_message(&self, reason: &str) -> String {
        let restart = if stop_reason_needs_restart_again(reason) {
            MESSAGE_STOP_RESTART_AGAIN
        } else {
            MESSAGE_STOP_RESTART
        };
        [
            MESSAGE_STOP_CHANNEL_TITLE.to_string(),
            format!("-# {}", stop_reason_detail(reason)),
            format!("-# {restart}"),
        ]
        .join("\n")
    }

    fn transcript_attachment_message(&self) -> String {
        let lines = vec![MESSAGE_ATTACHMENT_TITLE.to_string()];
        self.with_powered_by_for_brand(lines).join("\n")
    }

    fn start_ephemeral_message(&self, channel_id: &str) -> String {
        [
            start_ephemeral_title(channel_id),
            MESSAGE_START_EPHEMERAL_SECOND_LINE.to_string(),
            MESSAGE_START_EPHEMERAL_HINT.to_string(),
        ]
        .join("\n")
    }

    fn stop_ephemeral_message(&self, channel_id: &str) -> String {
        [
            stop_ephemeral_title(channel_id),
            MESSAGE_STOP_EPHEMERAL_HINT.to_string(),
        ]
        .join("\n")
    }

    fn with_powered_by_for_brand(&self, mut lines: Vec<String>) -> Vec<String> {
        if self.cfg.discord_show_powered_by {
            lines.push(MESSAGE_POWERED_BY_LINE.to_string());
        }
        lines
    }
}

struct SessionRuntime {
    created: Session,
    started_at: DateTime<Utc>,
    ctx: CancellationToken,
    mixer: Arc<dyn Mixer>,
    voice: Arc<dyn VoiceConnection>,
    writer: Arc<dyn StreamWriter>,
}

fn normalize_stop_reason(reason: &str) -> &str {
    if reason.trim().is_empty() {
        STOP_REASON_UNKNOWN_ERROR
    } else {
        reason
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 20 ms mix-and-forward loop with a 5 s stats heartbeat.
async fn stream_mixed_audio(
    ctx: CancellationToken,
    session_id: Uuid,
    mixer: Arc<dyn Mixer>,
    writer: Arc<dyn StreamWriter>,
    received_opus_packets: Arc<AtomicI64>,
) {
    let mut ticker = tokio::time::interval(AUDIO_MIX_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats_ticker = tokio::time::interval(AUDIO_STATS_INTERVAL);
    stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut buf = [0u8; FRAME_BYTES];
    let mut mixed_frames: i64 = 0;
    let mut zero_frames: i64 = 0;
    let mut written_frames: i64 = 0;
    info!(%session_id, "audio mixer loop started");
    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                info!(
                    %session_id,
                    received_opus_packets = received_opus_packets.load(Ordering::Relaxed),
                    mixed_frames,
                    zero_frames,
                    written_frames,
                    "audio mixer loop stopped by context cancel"
                );
                return;
            }
            _ = stats_ticker.tick() => {
                info!(
                    %session_id,
                    received_opus_packets = received_opus_packets.load(Ordering::Relaxed),
                    mixed_frames,
                    zero_frames,
                    written_frames,
                    "audio pipeline stats"
                );
            }
            _ = ticker.tick() => {
                let n = mixer.read_mixed_pcm(&mut buf);
                mixed_frames += 1;
                if n == 0 {
                    zero_frames += 1;
                    continue;
                }
                if let Err(err) = writer.write(&buf[..n]).await {
                    error!(error = %err, %session_id, pcm_bytes = n, "failed to write pcm to recognition stream");
                    return;
                }
                written_frames += 1;
            }
        }
    }
}

/// Assigns session-scoped monotonic indices to final results and forwards
/// them for persistence; interims are ignored.
struct SessionResultReceiver {
    manager: Arc<Manager>,
    session_id: Uuid,
    channel_id: String,
    next_index: StdMutex<i32>,
}

#[async_trait]
impl ResultReceiver for SessionResultReceiver {
    async fn on_result(&self, _segment_index: usize, text: &str, is_final: bool) {
        if !is_final {
            return;
        }
        let index = {
            let mut next = self.next_index.lock().unwrap_or_else(|e| e.into_inner());
            let index = *next;
            *next += 1;
            index
        };
        self.manager
            .handle_transcription_result(self.session_id, &self.channel_id, index, text, true)
            .await;
    }

    async fn on_error(&self, err: anyhow::Error) {
        let reason = self.manager.take_stop_reason(self.session_id);
        let message = err.to_string();
        if message.contains("operation was cancelled") || message.contains("operation was canceled")
        {
            info!(error = %message, session_id = %self.session_id, %reason, "transcriber stream canceled");
            return;
        }
        error!(error = %message, session_id = %self.session_id, %reason, "transcriber stream error");
    }
}

fn build_participant_snapshots(
    meta: &TranscriptMetadata,
    states: &HashMap<String, ParticipantState>,
) -> Vec<SessionParticipantSnapshot> {
    let display_by_user_id: HashMap<&str, &TranscriptParticipant> = meta
        .participants
        .iter()
        .filter(|p| !p.user_id.trim().is_empty())
        .map(|p| (p.user_id.as_str(), p))
        .collect();

    let mut out: Vec<SessionParticipantSnapshot> = states
        .iter()
        .map(|(user_id, state)| {
            let first_seen_at = state.first_seen_at.min(state.last_seen_at);
            let last_seen_at = state.last_seen_at.max(state.first_seen_at);
            let (display_name, is_bot) = match display_by_user_id.get(user_id.as_str()) {
                Some(p) if !p.display_name.trim().is_empty() => {
                    (p.display_name.clone(), state.is_bot || p.is_bot)
                }
                Some(p) => (user_id.clone(), state.is_bot || p.is_bot),
                None => (user_id.clone(), state.is_bot),
            };
            SessionParticipantSnapshot {
                user_id: user_id.clone(),
                display_name,
                is_bot,
                first_seen_at,
                last_seen_at,
            }
        })
        .collect();
    out.sort_by(|a, b| {
        let an = a.display_name.to_lowercase();
        let bn = b.display_name.to_lowercase();
        an.cmp(&bn).then_with(|| a.user_id.cmp(&b.user_id))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::{EphemeralResponder, VoiceParticipant};
    use crate::speech::StreamError;
    use crate::storage::SessionStatus;
    use crate::webhook::TranscriptWebhookPayload;

    #[derive(Default)]
    struct MockRepository {
        insert_calls: StdMutex<Vec<InsertSegmentInput>>,
        saved_outputs: StdMutex<Vec<SaveSessionOutputInput>>,
        completed_calls: StdMutex<Vec<CompleteSessionInput>>,
        create_count: StdMutex<usize>,
        list_segments_fails: bool,
        running_session: StdMutex<Option<Session>>,
    }

    #[async_trait]
    impl Repository for MockRepository {
        async fn create_session(&self, input: CreateSessionInput) -> Result<Session> {
            *self.create_count.lock().unwrap() += 1;
            Ok(Session {
                id: Uuid::new_v4(),
                guild_id: input.guild_id,
                guild_name: String::new(),
                channel_id: input.channel_id,
                channel_name: String::new(),
                started_at: input.started_at,
                ended_at: None,
                status: SessionStatus::Running,
                stop_reason: String::new(),
                timezone: "UTC".to_string(),
                duration_seconds: 0,
                segment_count: 0,
            })
        }

        async fn update_session_completed(&self, input: CompleteSessionInput) -> Result<()> {
            self.completed_calls.lock().unwrap().push(input);
            Ok(())
        }

        async fn get_running_session_by_channel(
            &self,
            _guild_id: &str,
            _channel_id: &str,
        ) -> Result<Option<Session>> {
            Ok(self.running_session.lock().unwrap().take())
        }

        async fn insert_segment(&self, input: InsertSegmentInput) -> Result<()> {
            self.insert_calls.lock().unwrap().push(input);
            Ok(())
        }

        async fn list_segments_by_session_id(
            &self,
            _session_id: Uuid,
        ) -> Result<Vec<TranscriptSegment>> {
            if self.list_segments_fails {
                anyhow::bail!("boom");
            }
            Ok(Vec::new())
        }

        async fn save_session_output(&self, input: SaveSessionOutputInput) -> Result<()> {
            self.saved_outputs.lock().unwrap().push(input);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockDiscordClient {
        send_calls: StdMutex<Vec<(String, String)>>,
        file_calls: StdMutex<Vec<FileMessage>>,
        user_voice_channel_by_id: HashMap<String, String>,
    }

    struct MockVoiceConnection;

    #[async_trait]
    impl VoiceConnection for MockVoiceConnection {
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn receive_audio(&self, _callback: AudioCallback) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Client for MockDiscordClient {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        async fn join_voice_channel(
            &self,
            _guild_id: &str,
            _channel_id: &str,
        ) -> Result<Arc<dyn VoiceConnection>> {
            Ok(Arc::new(MockVoiceConnection))
        }
        async fn send_channel_message(&self, channel_id: &str, content: &str) -> Result<()> {
            self.send_calls
                .lock()
                .unwrap()
                .push((channel_id.to_string(), content.to_string()));
            Ok(())
        }
        async fn send_channel_message_with_file(&self, msg: FileMessage) -> Result<()> {
            self.file_calls.lock().unwrap().push(msg);
            Ok(())
        }
        fn register_voice_state_update_handler(&self, _handler: crate::discord::VoiceStateHandler) {}
        fn register_slash_command_handler(&self, _handler: crate::discord::SlashCommandHandler) {}
        async fn upsert_guild_slash_commands(
            &self,
            _guild_id: &str,
            _defs: &[SlashCommandDefinition],
        ) -> Result<()> {
            Ok(())
        }
        async fn get_user_voice_channel_id(
            &self,
            _guild_id: &str,
            user_id: &str,
        ) -> Result<String> {
            Ok(self
                .user_voice_channel_by_id
                .get(user_id)
                .cloned()
                .unwrap_or_default())
        }
        async fn list_voice_channel_participants(
            &self,
            _guild_id: &str,
            _channel_id: &str,
        ) -> Result<Vec<VoiceParticipant>> {
            Ok(Vec::new())
        }
        async fn get_bot_user_id(&self) -> Result<String> {
            Ok("bot-self".to_string())
        }
        async fn resolve_transcript_metadata(
            &self,
            guild_id: &str,
            channel_id: &str,
            participant_user_ids: &[String],
        ) -> Result<TranscriptMetadata> {
            Ok(TranscriptMetadata {
                discord_server_id: guild_id.to_string(),
                discord_server_name: guild_id.to_string(),
                discord_voice_channel_id: channel_id.to_string(),
                discord_voice_channel_name: channel_id.to_string(),
                participants: participant_user_ids
                    .iter()
                    .map(|user_id| TranscriptParticipant {
                        user_id: user_id.clone(),
                        display_name: user_id.clone(),
                        is_bot: false,
                    })
                    .collect(),
            })
        }
        async fn run(&self) -> Result<()> {
            Ok(())
        }
    }

    struct MockTranscriber;

    struct MockStreamWriter;

    #[async_trait]
    impl StreamWriter for MockStreamWriter {
        async fn write(&self, _pcm: &[u8]) -> std::result::Result<(), StreamError> {
            Ok(())
        }
        async fn close(&self) -> std::result::Result<(), StreamError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Transcriber for MockTranscriber {
        async fn start_streaming(
            &self,
            _ctx: CancellationToken,
            _session_id: Uuid,
            _language: &str,
            _receiver: Arc<dyn ResultReceiver>,
        ) -> Result<Arc<dyn StreamWriter>> {
            Ok(Arc::new(MockStreamWriter))
        }
    }

    #[derive(Default)]
    struct MockWebhookSender {
        payloads: StdMutex<Vec<TranscriptWebhookPayload>>,
    }

    #[async_trait]
    impl Sender for MockWebhookSender {
        async fn send_transcript(&self, payload: &TranscriptWebhookPayload) -> Result<()> {
            self.payloads.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    struct MockMixer;

    impl Mixer for MockMixer {
        fn write_opus_packet(&self, _user_id: &str, _opus: &[u8]) {}
        fn read_mixed_pcm(&self, _buf: &mut [u8]) -> usize {
            0
        }
        fn close(&self) {}
    }

    fn test_config() -> Config {
        Config {
            env: "test".to_string(),
            default_transcribe_language: "ja-JP".to_string(),
            max_transcribe_duration_min: 120,
            database_url: "postgres://localhost/test".to_string(),
            google_cloud_project_id: "project".to_string(),
            google_cloud_credentials_json: "{}".to_string(),
            google_cloud_speech_location: "asia-northeast1".to_string(),
            google_cloud_speech_model: "chirp_3".to_string(),
            discord_token: "token".to_string(),
            discord_guild_id: "guild-1".to_string(),
            discord_auto_transcribe: true,
            discord_auto_transcribable_vc_id: "vc-1".to_string(),
            discord_count_other_bots_as_participants: false,
            discord_show_powered_by: true,
            transcript_timezone: "Asia/Tokyo".to_string(),
            transcript_webhook_url: String::new(),
        }
    }

    fn new_test_manager_with(
        cfg: Config,
        repo: Arc<MockRepository>,
        dc: Arc<MockDiscordClient>,
    ) -> Arc<Manager> {
        Manager::new(
            cfg,
            repo,
            dc,
            Arc::new(MockTranscriber),
            Arc::new(MockWebhookSender::default()),
            Arc::new(|| Arc::new(MockMixer) as Arc<dyn Mixer>),
        )
    }

    fn new_test_manager(repo: Arc<MockRepository>, dc: Arc<MockDiscordClient>) -> Arc<Manager> {
        new_test_manager_with(test_config(), repo, dc)
    }

    fn test_session(id: Uuid, guild_id: &str, channel_id: &str) -> Session {
        Session {
            id,
            guild_id: guild_id.to_string(),
            guild_name: String::new(),
            channel_id: channel_id.to_string(),
            channel_name: String::new(),
            started_at: Utc::now(),
            ended_at: None,
            status: SessionStatus::Running,
            stop_reason: String::new(),
            timezone: "UTC".to_string(),
            duration_seconds: 0,
            segment_count: 0,
        }
    }

    fn insert_running_session(
        manager: &Arc<Manager>,
        session_id: Uuid,
        guild_id: &str,
        channel_id: &str,
        active: &[(&str, bool)],
        all: &[(&str, bool)],
    ) {
        let now = Utc::now();
        let mut maps = ParticipantMaps::default();
        for (user_id, is_bot) in all {
            maps.all.insert(
                user_id.to_string(),
                ParticipantState {
                    is_bot: *is_bot,
                    first_seen_at: now,
                    last_seen_at: now,
                },
            );
        }
        for (user_id, is_bot) in active {
            maps.active.insert(
                user_id.to_string(),
                ParticipantState {
                    is_bot: *is_bot,
                    first_seen_at: now,
                    last_seen_at: now,
                },
            );
        }
        let rs = Arc::new(RunningSession {
            repo_session: test_session(session_id, guild_id, channel_id),
            voice: None,
            mixer: None,
            writer: None,
            cancel: CancellationToken::new(),
            participants: StdMutex::new(maps),
        });
        manager
            .lock_state()
            .sessions
            .insert((guild_id.to_string(), channel_id.to_string()), rs);
    }

    fn capturing_responder() -> (EphemeralResponder, Arc<StdMutex<Vec<String>>>) {
        let captured = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        let responder: EphemeralResponder = Arc::new(move |content: String| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(content);
                Ok(())
            })
        });
        (responder, captured)
    }

    async fn wait_until(cond: impl Fn() -> bool, message: &str) {
        let deadline = std::time::Instant::now() + StdDuration::from_secs(1);
        while std::time::Instant::now() < deadline {
            if cond() {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert!(cond(), "{message}");
    }

    #[tokio::test]
    async fn voice_state_update_ignores_other_guild() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(Arc::clone(&repo), Arc::clone(&dc));

        manager
            .handle_voice_state_update(VoiceStateEvent {
                guild_id: "guild-2".to_string(),
                user_id: "user-1".to_string(),
                user_is_bot: false,
                before_channel_id: String::new(),
                after_channel_id: "vc-1".to_string(),
            })
            .await;

        assert!(repo.insert_calls.lock().unwrap().is_empty());
        assert_eq!(*repo.create_count.lock().unwrap(), 0);
        assert!(dc.send_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transcription_result_inserts_and_sends_only_final_non_empty() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(Arc::clone(&repo), Arc::clone(&dc));
        let session_id = Uuid::new_v4();

        manager
            .handle_transcription_result(session_id, "vc-1", 0, " ", true)
            .await;
        manager
            .handle_transcription_result(session_id, "vc-1", 0, "hello", false)
            .await;
        manager
            .handle_transcription_result(session_id, "vc-1", 1, "hello", true)
            .await;

        let inserts = repo.insert_calls.lock().unwrap();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].session_id, session_id);
        assert_eq!(inserts[0].content, "hello");
        assert_eq!(inserts[0].segment_index, 1);
        let sends = dc.send_calls.lock().unwrap();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0], ("vc-1".to_string(), "hello".to_string()));
    }

    #[tokio::test]
    async fn take_stop_reason_returns_and_deletes() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(repo, dc);
        let session_id = Uuid::new_v4();
        manager
            .lock_state()
            .stop_reasons
            .insert(session_id, "manual stop".to_string());

        assert_eq!(manager.take_stop_reason(session_id), "manual stop");
        assert_eq!(
            manager.take_stop_reason(session_id),
            STOP_REASON_ABSENT,
            "reason must be deleted after first read"
        );
    }

    #[tokio::test]
    async fn result_receiver_assigns_monotonic_indices() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(Arc::clone(&repo), dc);
        let receiver = SessionResultReceiver {
            manager: Arc::clone(&manager),
            session_id: Uuid::new_v4(),
            channel_id: "vc-1".to_string(),
            next_index: StdMutex::new(0),
        };

        receiver.on_result(10, "first", true).await;
        receiver.on_result(99, "second", true).await;

        let inserts = repo.insert_calls.lock().unwrap();
        assert_eq!(inserts.len(), 2);
        assert_eq!(inserts[0].segment_index, 0);
        assert_eq!(inserts[1].segment_index, 1);
    }

    #[tokio::test]
    async fn result_receiver_ignores_interim_results() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(Arc::clone(&repo), dc);
        let receiver = SessionResultReceiver {
            manager: Arc::clone(&manager),
            session_id: Uuid::new_v4(),
            channel_id: "vc-1".to_string(),
            next_index: StdMutex::new(0),
        };

        receiver.on_result(0, "hel", false).await;
        receiver.on_result(0, "hello", true).await;

        let inserts = repo.insert_calls.lock().unwrap();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].content, "hello");
        assert_eq!(inserts[0].segment_index, 0);
    }

    #[tokio::test]
    async fn slash_start_requires_voice_channel() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(repo, dc);
        let (responder, captured) = capturing_responder();

        manager
            .handle_slash_command(SlashCommandEvent {
                guild_id: "guild-1".to_string(),
                channel_id: String::new(),
                command_name: COMMAND_MOJIOKOSHI.to_string(),
                user_id: "user-1".to_string(),
                respond_ephemeral: Some(responder),
            })
            .await;

        let captured = captured.lock().unwrap();
        assert_eq!(captured.as_slice(), [MESSAGE_EPHEMERAL_JOIN_VC_FIRST]);
    }

    #[tokio::test]
    async fn slash_stop_reports_not_running() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient {
            user_voice_channel_by_id: HashMap::from([(
                "user-1".to_string(),
                "vc-1".to_string(),
            )]),
            ..Default::default()
        });
        let manager = new_test_manager(repo, dc);
        let (responder, captured) = capturing_responder();

        manager
            .handle_slash_command(SlashCommandEvent {
                guild_id: "guild-1".to_string(),
                channel_id: String::new(),
                command_name: COMMAND_MOJIOKOSHI_STOP.to_string(),
                user_id: "user-1".to_string(),
                respond_ephemeral: Some(responder),
            })
            .await;

        let captured = captured.lock().unwrap();
        assert_eq!(captured.as_slice(), [MESSAGE_EPHEMERAL_NOT_RUNNING]);
    }

    #[tokio::test]
    async fn slash_start_and_stop_succeed() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient {
            user_voice_channel_by_id: HashMap::from([(
                "user-1".to_string(),
                "vc-1".to_string(),
            )]),
            ..Default::default()
        });
        let manager = new_test_manager(Arc::clone(&repo), Arc::clone(&dc));
        manager.set_bot_user_id("bot-self");

        let (responder, captured) = capturing_responder();
        manager
            .handle_slash_command(SlashCommandEvent {
                guild_id: "guild-1".to_string(),
                channel_id: String::new(),
                command_name: COMMAND_MOJIOKOSHI.to_string(),
                user_id: "user-1".to_string(),
                respond_ephemeral: Some(responder),
            })
            .await;
        assert_eq!(
            captured.lock().unwrap().as_slice(),
            [":microphone2: <#vc-1> **の文字起こしを開始しました。**\n-# ボイスチャンネルのチャットに文字起こしが表示されます。\n-# /mojiokoshi-stop コマンドで中止できます。"]
        );
        assert!(manager.is_session_running("guild-1", "vc-1"));

        let (responder, captured) = capturing_responder();
        manager
            .handle_slash_command(SlashCommandEvent {
                guild_id: "guild-1".to_string(),
                channel_id: String::new(),
                command_name: COMMAND_MOJIOKOSHI_STOP.to_string(),
                user_id: "user-1".to_string(),
                respond_ephemeral: Some(responder),
            })
            .await;
        assert_eq!(
            captured.lock().unwrap().as_slice(),
            [":pause_button:  <#vc-1> **の文字起こしを中止しました。**\n-# /mojiokoshi コマンドで開始できます。"]
        );
        assert!(!manager.is_session_running("guild-1", "vc-1"));
    }

    #[tokio::test]
    async fn countability_excludes_self_bot_always() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(repo, dc);
        manager.set_bot_user_id("bot-self");

        assert!(!manager.should_count_lifecycle_participant("bot-self", true).await);
        assert!(!manager.should_count_lifecycle_participant("", false).await);
        assert!(manager.should_count_lifecycle_participant("user-1", false).await);
    }

    #[tokio::test]
    async fn countability_of_other_bots_follows_config() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(Arc::clone(&repo), Arc::clone(&dc));
        manager.set_bot_user_id("bot-self");
        assert!(!manager.should_count_lifecycle_participant("other-bot", true).await);

        let mut cfg = test_config();
        cfg.discord_count_other_bots_as_participants = true;
        let manager = new_test_manager_with(cfg, repo, dc);
        manager.set_bot_user_id("bot-self");
        assert!(manager.should_count_lifecycle_participant("other-bot", true).await);
    }

    #[tokio::test]
    async fn stop_session_removes_entry_and_is_idempotent() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(repo, dc);
        let session_id = Uuid::new_v4();
        insert_running_session(
            &manager,
            session_id,
            "guild-1",
            "vc-1",
            &[("user-1", false)],
            &[("user-1", false)],
        );

        assert!(manager.stop_session("guild-1", "vc-1", STOP_REASON_MAX_DURATION).await);
        assert!(!manager.is_session_running("guild-1", "vc-1"));
        assert!(
            !manager.stop_session("guild-1", "vc-1", STOP_REASON_MAX_DURATION).await,
            "second stop must lose"
        );
    }

    #[tokio::test]
    async fn participant_leave_stops_session_when_only_self_bot_remains() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let mut cfg = test_config();
        cfg.discord_auto_transcribe = false;
        let manager = new_test_manager_with(cfg, repo, dc);
        manager.set_bot_user_id("bot-self");
        insert_running_session(
            &manager,
            Uuid::new_v4(),
            "guild-1",
            "vc-1",
            &[("user-1", false)],
            &[("user-1", false), ("bot-self", true)],
        );

        manager
            .handle_voice_state_update(VoiceStateEvent {
                guild_id: "guild-1".to_string(),
                user_id: "user-1".to_string(),
                user_is_bot: false,
                before_channel_id: "vc-1".to_string(),
                after_channel_id: String::new(),
            })
            .await;

        assert!(!manager.is_session_running("guild-1", "vc-1"));
    }

    #[tokio::test]
    async fn participant_leave_is_inferred_when_channels_are_unknown() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let mut cfg = test_config();
        cfg.discord_auto_transcribe = false;
        let manager = new_test_manager_with(cfg, repo, dc);
        manager.set_bot_user_id("bot-self");
        insert_running_session(
            &manager,
            Uuid::new_v4(),
            "guild-1",
            "vc-1",
            &[("user-1", false)],
            &[("user-1", false), ("bot-self", true)],
        );

        manager
            .handle_voice_state_update(VoiceStateEvent {
                guild_id: "guild-1".to_string(),
                user_id: "user-1".to_string(),
                user_is_bot: false,
                before_channel_id: String::new(),
                after_channel_id: String::new(),
            })
            .await;

        assert!(!manager.is_session_running("guild-1", "vc-1"));
    }

    #[tokio::test]
    async fn bot_removal_stops_session_and_finalizes() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let mut cfg = test_config();
        cfg.discord_auto_transcribe = false;
        let manager = new_test_manager_with(cfg, repo, Arc::clone(&dc));
        manager.set_bot_user_id("bot-self");
        insert_running_session(
            &manager,
            Uuid::new_v4(),
            "guild-1",
            "vc-1",
            &[("user-1", false)],
            &[("user-1", false), ("bot-self", true)],
        );

        manager
            .handle_voice_state_update(VoiceStateEvent {
                guild_id: "guild-1".to_string(),
                user_id: "bot-self".to_string(),
                user_is_bot: true,
                before_channel_id: "vc-1".to_string(),
                after_channel_id: String::new(),
            })
            .await;

        assert!(!manager.is_session_running("guild-1", "vc-1"));
        wait_until(
            || dc.file_calls.lock().unwrap().len() == 1,
            "finalize should attach transcript after bot removal",
        )
        .await;
        let sends = dc.send_calls.lock().unwrap();
        assert!(!sends.is_empty(), "expected stop message to be sent");
        assert_eq!(sends[0].1, manager.stop_channel_message(STOP_REASON_BOT_REMOVED));
    }

    #[tokio::test]
    async fn stop_all_sessions_drains_every_running_session() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(repo, Arc::clone(&dc));
        insert_running_session(
            &manager,
            Uuid::new_v4(),
            "guild-1",
            "vc-1",
            &[("user-1", false)],
            &[("user-1", false)],
        );
        insert_running_session(
            &manager,
            Uuid::new_v4(),
            "guild-1",
            "vc-2",
            &[("user-2", false)],
            &[("user-2", false)],
        );

        let count = manager.stop_all_sessions(STOP_REASON_SERVER_CLOSED).await;
        assert_eq!(count, 2);
        assert!(!manager.is_session_running("guild-1", "vc-1"));
        assert!(!manager.is_session_running("guild-1", "vc-2"));
        wait_until(
            || dc.file_calls.lock().unwrap().len() == 2,
            "expected transcript attachments for all sessions",
        )
        .await;
    }

    #[tokio::test]
    async fn worker_panic_stops_with_unknown_reason_and_finalizes() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(repo, Arc::clone(&dc));
        let session_id = Uuid::new_v4();
        insert_running_session(
            &manager,
            session_id,
            "guild-1",
            "vc-1",
            &[("user-1", false)],
            &[("user-1", false)],
        );

        manager.run_session_worker("guild-1", "vc-1", session_id, "test_worker", async {
            panic!("boom");
        });

        wait_until(
            || !manager.is_session_running("guild-1", "vc-1"),
            "session should stop after worker panic",
        )
        .await;
        wait_until(
            || dc.file_calls.lock().unwrap().len() == 1,
            "finalize should attach transcript after worker panic",
        )
        .await;
        let sends = dc.send_calls.lock().unwrap();
        assert!(!sends.is_empty(), "expected stop message to be sent");
        assert_eq!(sends[0].1, manager.stop_channel_message(STOP_REASON_UNKNOWN_ERROR));
    }

    #[tokio::test]
    async fn finalize_continues_when_segment_lookup_fails() {
        let repo = Arc::new(MockRepository {
            list_segments_fails: true,
            ..Default::default()
        });
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(repo, Arc::clone(&dc));
        insert_running_session(
            &manager,
            Uuid::new_v4(),
            "guild-1",
            "vc-1",
            &[("user-1", false)],
            &[("user-1", false)],
        );

        assert!(manager.stop_session("guild-1", "vc-1", STOP_REASON_UNKNOWN_ERROR).await);
        wait_until(
            || dc.file_calls.lock().unwrap().len() == 1,
            "expected attachment even when segment lookup fails",
        )
        .await;
    }

    #[tokio::test]
    async fn powered_by_shown_only_on_start_and_attachment() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(repo, dc);

        assert!(manager.start_channel_message().contains(MESSAGE_POWERED_BY_LINE));
        assert!(manager
            .transcript_attachment_message()
            .contains(MESSAGE_POWERED_BY_LINE));
        assert!(!manager
            .stop_channel_message(STOP_REASON_MANUAL_SLASH)
            .contains(MESSAGE_POWERED_BY_LINE));
        assert!(!manager
            .start_ephemeral_message("vc-1")
            .contains(MESSAGE_POWERED_BY_LINE));
        assert!(!manager
            .stop_ephemeral_message("vc-1")
            .contains(MESSAGE_POWERED_BY_LINE));
    }

    #[tokio::test]
    async fn auto_transcribe_starts_session_on_target_join() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(Arc::clone(&repo), dc);
        manager.set_bot_user_id("bot-self");

        manager
            .handle_voice_state_update(VoiceStateEvent {
                guild_id: "guild-1".to_string(),
                user_id: "user-1".to_string(),
                user_is_bot: false,
                before_channel_id: String::new(),
                after_channel_id: "vc-1".to_string(),
            })
            .await;

        assert!(manager.is_session_running("guild-1", "vc-1"));
        assert_eq!(*repo.create_count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn join_never_starts_session_on_non_target_channel() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(Arc::clone(&repo), dc);
        manager.set_bot_user_id("bot-self");

        manager
            .handle_voice_state_update(VoiceStateEvent {
                guild_id: "guild-1".to_string(),
                user_id: "user-1".to_string(),
                user_is_bot: false,
                before_channel_id: String::new(),
                after_channel_id: "vc-2".to_string(),
            })
            .await;

        assert!(!manager.is_session_running("guild-1", "vc-2"));
        assert_eq!(*repo.create_count.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn start_completes_orphan_running_session_first() {
        let orphan_id = Uuid::new_v4();
        let repo = Arc::new(MockRepository::default());
        *repo.running_session.lock().unwrap() =
            Some(test_session(orphan_id, "guild-1", "vc-1"));
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(Arc::clone(&repo), dc);
        manager.set_bot_user_id("bot-self");

        manager
            .start_session("guild-1", "vc-1", "user-1", false)
            .await
            .expect("start should succeed");

        let completed = repo.completed_calls.lock().unwrap();
        assert_eq!(completed.len(), 1, "orphan must be completed before the new session");
        assert_eq!(completed[0].session_id, orphan_id);
        assert_eq!(*repo.create_count.lock().unwrap(), 1);
        assert!(manager.is_session_running("guild-1", "vc-1"));
    }

    #[tokio::test]
    async fn start_is_noop_for_non_countable_observer() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let manager = new_test_manager(Arc::clone(&repo), dc);
        manager.set_bot_user_id("bot-self");

        manager
            .start_session("guild-1", "vc-1", "other-bot", true)
            .await
            .expect("non-countable start is a no-op");

        assert!(!manager.is_session_running("guild-1", "vc-1"));
        assert_eq!(*repo.create_count.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn finalize_saves_output_and_sends_webhook() {
        let repo = Arc::new(MockRepository::default());
        let dc = Arc::new(MockDiscordClient::default());
        let webhook = Arc::new(MockWebhookSender::default());
        let manager = Manager::new(
            test_config(),
            Arc::clone(&repo) as Arc<dyn Repository>,
            Arc::clone(&dc) as Arc<dyn Client>,
            Arc::new(MockTranscriber),
            Arc::clone(&webhook) as Arc<dyn Sender>,
            Arc::new(|| Arc::new(MockMixer) as Arc<dyn Mixer>),
        );
        insert_running_session(
            &manager,
            Uuid::new_v4(),
            "guild-1",
            "vc-1",
            &[("user-1", false)],
            &[("user-1", false)],
        );

        assert!(manager.stop_session("guild-1", "vc-1", STOP_REASON_MANUAL_SLASH).await);
        wait_until(
            || webhook.payloads.lock().unwrap().len() == 1,
            "expected webhook delivery after finalize",
        )
        .await;
        let payloads = webhook.payloads.lock().unwrap();
        assert_eq!(payloads[0].participants, vec!["user-1"]);
        assert_eq!(payloads[0].schema_version, "2026-02-28");

        let saved = repo.saved_outputs.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].stop_reason, STOP_REASON_MANUAL_SLASH);
        assert_eq!(saved[0].participants.len(), 1);
        assert_eq!(saved[0].participants[0].user_id, "user-1");
        assert!(saved[0]
            .transcript_filename
            .starts_with("transcript-"));
        assert!(saved[0].webhook_payload_json.is_some());
    }
}
