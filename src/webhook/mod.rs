pub mod http;

use anyhow::Result;
use async_trait::async_trait;

pub use http::HttpSender;

/// Version stamp carried by every outbound payload so receivers can detect
/// format changes.
pub const TRANSCRIPT_WEBHOOK_SCHEMA_VERSION: &str = "2026-02-28";

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TranscriptWebhookParticipant {
    pub user_id: String,
    pub display_name: String,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TranscriptWebhookSegment {
    pub index: i32,
    pub start_at: String,
    pub end_at: String,
    pub transcript: String,
}

/// The structured transcript document POSTed to the configured webhook URL
/// when a session finalizes.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TranscriptWebhookPayload {
    pub schema_version: String,
    pub session_id: String,
    pub discord_server_id: String,
    pub discord_server_name: String,
    pub discord_voice_channel_id: String,
    pub discord_voice_channel_name: String,
    pub start_at: String,
    pub end_at: String,
    pub timezone: String,
    pub duration_seconds: i64,
    pub participants: Vec<String>,
    pub participant_details: Vec<TranscriptWebhookParticipant>,
    pub segment_count: i32,
    pub transcript_segments: Vec<TranscriptWebhookSegment>,
    pub transcript: String,
}

#[async_trait]
pub trait Sender: Send + Sync {
    /// Delivers the transcript payload. Implementations must be a no-op when
    /// no destination is configured.
    async fn send_transcript(&self, payload: &TranscriptWebhookPayload) -> Result<()>;
}
