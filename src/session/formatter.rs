//! Rendering of the human transcript file and the structured webhook payload.

use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use uuid::Uuid;

use crate::discord::{TranscriptMetadata, TranscriptParticipant};
use crate::storage::TranscriptSegment;
use crate::webhook::{
    TranscriptWebhookParticipant, TranscriptWebhookPayload, TranscriptWebhookSegment,
    TRANSCRIPT_WEBHOOK_SCHEMA_VERSION,
};

const TRANSCRIPT_TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Builds the UTF-8 transcript document attached to the closing message.
pub fn build_transcript_text(
    meta: &TranscriptMetadata,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    timezone: &str,
    tz: Tz,
    segments: &[TranscriptSegment],
) -> String {
    let participants = canonical_participants(&meta.participants);
    let names: Vec<&str> = participants.iter().map(|p| p.display_name.as_str()).collect();

    let start_text = started_at.with_timezone(&tz).format(TRANSCRIPT_TIME_LAYOUT);
    let end_text = ended_at.with_timezone(&tz).format(TRANSCRIPT_TIME_LAYOUT);

    let mut lines = vec![
        format!("サーバー名：{}", meta.discord_server_name),
        format!("ボイスチャンネル名：{}", meta.discord_voice_channel_name),
        format!("ボイスチャット期間：{start_text} ~ {end_text}（{timezone}）"),
        format!("参加者：{}", names.join("、")),
        String::new(),
    ];
    for seg in segments {
        let elapsed = (seg.spoken_at - started_at).num_seconds().max(0);
        lines.push(format!("{} {}", format_elapsed_hms(elapsed), seg.content));
    }
    lines.join("\n")
}

/// Builds the structured payload delivered to the transcript webhook.
pub fn build_transcript_webhook_payload(
    session_id: Uuid,
    meta: &TranscriptMetadata,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    timezone: &str,
    tz: Tz,
    segments: &[TranscriptSegment],
) -> TranscriptWebhookPayload {
    let participants = canonical_participants(&meta.participants);
    let participant_names = participants
        .iter()
        .map(|p| p.display_name.clone())
        .collect();
    let participant_details = participants
        .iter()
        .map(|p| TranscriptWebhookParticipant {
            user_id: p.user_id.clone(),
            display_name: p.display_name.clone(),
            is_bot: p.is_bot,
        })
        .collect();
    let transcript = segments
        .iter()
        .map(|seg| seg.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let duration_seconds = (ended_at - started_at).num_seconds().max(0);

    TranscriptWebhookPayload {
        schema_version: TRANSCRIPT_WEBHOOK_SCHEMA_VERSION.to_string(),
        session_id: session_id.to_string(),
        discord_server_id: meta.discord_server_id.clone(),
        discord_server_name: meta.discord_server_name.clone(),
        discord_voice_channel_id: meta.discord_voice_channel_id.clone(),
        discord_voice_channel_name: meta.discord_voice_channel_name.clone(),
        start_at: format_rfc3339(started_at, tz),
        end_at: format_rfc3339(ended_at, tz),
        timezone: timezone.to_string(),
        duration_seconds,
        participants: participant_names,
        participant_details,
        segment_count: segments.len() as i32,
        transcript_segments: build_webhook_segments(segments, ended_at, tz),
        transcript,
    }
}

/// Each segment ends where the next one starts; the last one ends with the
/// session. Ends never precede their own start.
fn build_webhook_segments(
    segments: &[TranscriptSegment],
    session_ended_at: DateTime<Utc>,
    tz: Tz,
) -> Vec<TranscriptWebhookSegment> {
    segments
        .iter()
        .enumerate()
        .map(|(i, seg)| {
            let mut segment_end = match segments.get(i + 1) {
                Some(next) => next.spoken_at,
                None => session_ended_at,
            };
            if segment_end < seg.spoken_at {
                segment_end = seg.spoken_at;
            }
            TranscriptWebhookSegment {
                index: seg.segment_index,
                start_at: format_rfc3339(seg.spoken_at, tz),
                end_at: format_rfc3339(segment_end, tz),
                transcript: seg.content.clone(),
            }
        })
        .collect()
}

/// Deduplicates by user id, fills empty display names with the id, and sorts
/// case-insensitively by display name (user id as tie-breaker).
pub fn canonical_participants(
    participants: &[TranscriptParticipant],
) -> Vec<TranscriptParticipant> {
    let mut by_user_id: std::collections::HashMap<String, TranscriptParticipant> =
        std::collections::HashMap::new();
    for p in participants {
        if p.user_id.trim().is_empty() {
            continue;
        }
        by_user_id
            .entry(p.user_id.clone())
            .and_modify(|existing| merge_participant(existing, p))
            .or_insert_with(|| p.clone());
    }

    let mut list: Vec<TranscriptParticipant> = by_user_id
        .into_values()
        .map(|mut p| {
            if p.display_name.is_empty() {
                p.display_name = p.user_id.clone();
            }
            p
        })
        .collect();
    list.sort_by(|a, b| {
        let an = a.display_name.to_lowercase();
        let bn = b.display_name.to_lowercase();
        an.cmp(&bn).then_with(|| a.user_id.cmp(&b.user_id))
    });
    list
}

fn merge_participant(existing: &mut TranscriptParticipant, incoming: &TranscriptParticipant) {
    if existing.display_name == existing.user_id && !incoming.display_name.is_empty() {
        existing.display_name = incoming.display_name.clone();
    }
    existing.is_bot = existing.is_bot || incoming.is_bot;
}

pub fn format_elapsed_hms(total_seconds: i64) -> String {
    let total = total_seconds.max(0);
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

fn format_rfc3339(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}
