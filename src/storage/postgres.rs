use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{
    CompleteSessionInput, CreateSessionInput, InsertSegmentInput, Repository,
    SaveSessionOutputInput, Session, TranscriptSegment,
};

/// `Repository` backed by a shared Postgres connection pool.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn session_from_row(row: &PgRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        guild_id: row.try_get("guild_id")?,
        guild_name: row.try_get("guild_name")?,
        channel_id: row.try_get("channel_id")?,
        channel_name: row.try_get("channel_name")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        status: row.try_get("status")?,
        stop_reason: row.try_get("stop_reason")?,
        timezone: row.try_get("timezone")?,
        duration_seconds: row.try_get("duration_seconds")?,
        segment_count: row.try_get("segment_count")?,
    })
}

const SESSION_COLUMNS: &str = "id, guild_id, guild_name, channel_id, channel_name, started_at, \
     ended_at, status, stop_reason, timezone, duration_seconds, segment_count";

#[async_trait]
impl Repository for PostgresRepository {
    async fn create_session(&self, input: CreateSessionInput) -> Result<Session> {
        let sql = format!(
            "INSERT INTO sessions (guild_id, channel_id, started_at, status)
             VALUES ($1, $2, $3, 'running')
             RETURNING {SESSION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&input.guild_id)
            .bind(&input.channel_id)
            .bind(input.started_at)
            .fetch_one(&self.pool)
            .await
            .context("failed to insert session")?;
        session_from_row(&row)
    }

    async fn update_session_completed(&self, input: CompleteSessionInput) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = 'completed', ended_at = $2, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(input.session_id)
        .bind(input.ended_at)
        .execute(&self.pool)
        .await
        .context("failed to complete session")?;
        Ok(())
    }

    async fn get_running_session_by_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Option<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS}
             FROM sessions WHERE guild_id = $1 AND channel_id = $2 AND status = 'running'
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(guild_id)
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to query running session")?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn insert_segment(&self, input: InsertSegmentInput) -> Result<()> {
        sqlx::query(
            "INSERT INTO transcript_segments (session_id, content, segment_index, spoken_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(input.session_id)
        .bind(&input.content)
        .bind(input.segment_index)
        .bind(input.spoken_at)
        .execute(&self.pool)
        .await
        .context("failed to insert transcript segment")?;
        Ok(())
    }

    async fn list_segments_by_session_id(&self, session_id: Uuid) -> Result<Vec<TranscriptSegment>> {
        let rows = sqlx::query(
            "SELECT id, session_id, content, segment_index, spoken_at, created_at
             FROM transcript_segments WHERE session_id = $1
             ORDER BY spoken_at ASC, segment_index ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list transcript segments")?;

        rows.iter()
            .map(|row| {
                Ok(TranscriptSegment {
                    id: row.try_get("id")?,
                    session_id: row.try_get("session_id")?,
                    content: row.try_get("content")?,
                    segment_index: row.try_get("segment_index")?,
                    spoken_at: row.try_get("spoken_at")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn save_session_output(&self, input: SaveSessionOutputInput) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to open transaction")?;

        sqlx::query(
            "UPDATE sessions SET
                 status = 'completed',
                 ended_at = $2,
                 stop_reason = $3,
                 guild_name = $4,
                 channel_name = $5,
                 timezone = $6,
                 duration_seconds = $7,
                 segment_count = $8,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(input.session_id)
        .bind(input.ended_at)
        .bind(&input.stop_reason)
        .bind(&input.guild_name)
        .bind(&input.channel_name)
        .bind(&input.timezone)
        .bind(input.duration_seconds)
        .bind(input.segment_count)
        .execute(&mut *tx)
        .await
        .context("failed to update session output fields")?;

        for p in &input.participants {
            sqlx::query(
                "INSERT INTO session_participants
                     (session_id, user_id, display_name, is_bot, first_seen_at, last_seen_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (session_id, user_id) DO UPDATE SET
                     display_name = EXCLUDED.display_name,
                     is_bot = EXCLUDED.is_bot,
                     first_seen_at = LEAST(session_participants.first_seen_at, EXCLUDED.first_seen_at),
                     last_seen_at = GREATEST(session_participants.last_seen_at, EXCLUDED.last_seen_at),
                     updated_at = NOW()",
            )
            .bind(input.session_id)
            .bind(&p.user_id)
            .bind(&p.display_name)
            .bind(p.is_bot)
            .bind(p.first_seen_at)
            .bind(p.last_seen_at)
            .execute(&mut *tx)
            .await
            .context("failed to upsert session participant")?;
        }

        sqlx::query(
            "INSERT INTO session_artifacts
                 (session_id, transcript_filename, transcript_text, webhook_payload)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (session_id) DO UPDATE SET
                 transcript_filename = EXCLUDED.transcript_filename,
                 transcript_text = EXCLUDED.transcript_text,
                 webhook_payload = EXCLUDED.webhook_payload,
                 updated_at = NOW()",
        )
        .bind(input.session_id)
        .bind(&input.transcript_filename)
        .bind(&input.transcript_text)
        .bind(&input.webhook_payload_json)
        .execute(&mut *tx)
        .await
        .context("failed to upsert session artifact")?;

        tx.commit().await.context("failed to commit session output")?;
        Ok(())
    }
}
