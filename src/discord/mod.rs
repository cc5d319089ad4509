pub mod gateway;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;

pub use gateway::GatewayClient;

/// A message with a single text-file attachment.
#[derive(Debug, Clone)]
pub struct FileMessage {
    pub channel_id: String,
    pub content: String,
    pub filename: String,
    pub file_body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SlashCommandDefinition {
    pub name: String,
    pub description: String,
}

/// Replies to the interaction with an ephemeral message. May be absent in
/// tests; delivery failures are the caller's to log.
pub type EphemeralResponder = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct SlashCommandEvent {
    pub guild_id: String,
    pub channel_id: String,
    pub command_name: String,
    pub user_id: String,
    pub respond_ephemeral: Option<EphemeralResponder>,
}

/// A user moved between voice channels. Empty channel ids mean "no channel";
/// some gateway events carry neither side.
#[derive(Debug, Clone)]
pub struct VoiceStateEvent {
    pub guild_id: String,
    pub user_id: String,
    pub user_is_bot: bool,
    pub before_channel_id: String,
    pub after_channel_id: String,
}

#[derive(Debug, Clone)]
pub struct VoiceParticipant {
    pub user_id: String,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TranscriptParticipant {
    pub user_id: String,
    pub display_name: String,
    pub is_bot: bool,
}

/// Display metadata resolved at finalization time.
#[derive(Debug, Clone, Default)]
pub struct TranscriptMetadata {
    pub discord_server_id: String,
    pub discord_server_name: String,
    pub discord_voice_channel_id: String,
    pub discord_voice_channel_name: String,
    pub participants: Vec<TranscriptParticipant>,
}

pub type VoiceStateHandler = Arc<dyn Fn(VoiceStateEvent) -> BoxFuture<'static, ()> + Send + Sync>;
pub type SlashCommandHandler =
    Arc<dyn Fn(SlashCommandEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called for every received opus packet with the speaker's user id (or the
/// numeric SSRC when the speaker is not yet known).
pub type AudioCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// One voice-channel connection, owned by exactly one session.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    async fn disconnect(&self) -> Result<()>;

    /// Installs `callback` on the connection's audio receive path. Returns
    /// once registered; packets flow until the connection is dropped.
    async fn receive_audio(&self, callback: AudioCallback) -> Result<()>;
}

/// The chat-platform surface the session manager consumes.
#[async_trait]
pub trait Client: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    async fn join_voice_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Arc<dyn VoiceConnection>>;

    async fn send_channel_message(&self, channel_id: &str, content: &str) -> Result<()>;
    async fn send_channel_message_with_file(&self, msg: FileMessage) -> Result<()>;

    fn register_voice_state_update_handler(&self, handler: VoiceStateHandler);
    fn register_slash_command_handler(&self, handler: SlashCommandHandler);

    /// Reconciles the guild's slash commands: creates missing ones, edits
    /// only when the description drifted.
    async fn upsert_guild_slash_commands(
        &self,
        guild_id: &str,
        defs: &[SlashCommandDefinition],
    ) -> Result<()>;

    /// Empty string when the user is not in any voice channel.
    async fn get_user_voice_channel_id(&self, guild_id: &str, user_id: &str) -> Result<String>;

    async fn list_voice_channel_participants(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Vec<VoiceParticipant>>;

    async fn get_bot_user_id(&self) -> Result<String>;

    async fn resolve_transcript_metadata(
        &self,
        guild_id: &str,
        channel_id: &str,
        participant_user_ids: &[String],
    ) -> Result<TranscriptMetadata>;

    /// Runs the gateway loop until shutdown.
    async fn run(&self) -> Result<()>;
}
