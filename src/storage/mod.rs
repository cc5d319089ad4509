pub mod migration;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use migration::run_migration;
pub use postgres::PostgresRepository;

/// Lifecycle state of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "session_status", rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
}

/// A transcription session row. At most one `Running` row may exist per
/// `(guild_id, channel_id)`; the schema enforces this with a partial unique
/// index.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub guild_id: String,
    pub guild_name: String,
    pub channel_id: String,
    pub channel_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub stop_reason: String,
    pub timezone: String,
    pub duration_seconds: i64,
    pub segment_count: i32,
}

/// One recognized final utterance within a session.
#[derive(Debug, Clone)]
pub struct TranscriptSegment {
    pub id: Uuid,
    pub session_id: Uuid,
    pub content: String,
    pub segment_index: i32,
    pub spoken_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of one participant, written at finalization.
#[derive(Debug, Clone)]
pub struct SessionParticipantSnapshot {
    pub user_id: String,
    pub display_name: String,
    pub is_bot: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateSessionInput {
    pub guild_id: String,
    pub channel_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CompleteSessionInput {
    pub session_id: Uuid,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InsertSegmentInput {
    pub session_id: Uuid,
    pub content: String,
    pub segment_index: i32,
    pub spoken_at: DateTime<Utc>,
}

/// Everything the finalizer persists in one transaction.
#[derive(Debug, Clone)]
pub struct SaveSessionOutputInput {
    pub session_id: Uuid,
    pub ended_at: DateTime<Utc>,
    pub stop_reason: String,
    pub guild_name: String,
    pub channel_name: String,
    pub timezone: String,
    pub duration_seconds: i64,
    pub segment_count: i32,
    pub participants: Vec<SessionParticipantSnapshot>,
    pub transcript_filename: String,
    pub transcript_text: String,
    pub webhook_payload_json: Option<serde_json::Value>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_session(&self, input: CreateSessionInput) -> Result<Session>;

    async fn update_session_completed(&self, input: CompleteSessionInput) -> Result<()>;

    /// Returns the `Running` session at `(guild_id, channel_id)`, if any.
    async fn get_running_session_by_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Option<Session>>;

    async fn insert_segment(&self, input: InsertSegmentInput) -> Result<()>;

    /// Segments ordered by `(spoken_at, segment_index)`.
    async fn list_segments_by_session_id(&self, session_id: Uuid) -> Result<Vec<TranscriptSegment>>;

    /// Persists the session output bundle atomically: session row update,
    /// participant upserts, artifact upsert.
    async fn save_session_output(&self, input: SaveSessionOutputInput) -> Result<()>;
}
