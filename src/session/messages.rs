//! User-facing message templates for channel and ephemeral replies.

use super::manager::{
    STOP_REASON_BOT_REMOVED, STOP_REASON_MANUAL_SLASH, STOP_REASON_MAX_DURATION,
    STOP_REASON_PARTICIPANTS_LEFT, STOP_REASON_SERVER_CLOSED, STOP_REASON_UNKNOWN_ERROR,
};

pub(crate) const SLASH_COMMAND_START_DESCRIPTION: &str =
    "あなたがいるボイスチャンネルで文字起こしを開始します。";
pub(crate) const SLASH_COMMAND_STOP_DESCRIPTION: &str =
    "あなたがいるボイスチャンネルの文字起こしを中止します。";

pub(crate) const MESSAGE_EPHEMERAL_WRONG_GUILD: &str =
    ":warning: **このサーバーでは実行できません。**";
pub(crate) const MESSAGE_EPHEMERAL_UNKNOWN_COMMAND: &str = ":warning: **不明なコマンドです。**";
pub(crate) const MESSAGE_EPHEMERAL_VOICE_LOOKUP_FAILED: &str =
    ":warning: **ボイスチャンネルの参加状態の確認に失敗しました。**";
pub(crate) const MESSAGE_EPHEMERAL_JOIN_VC_FIRST: &str =
    ":warning: **ボイスチャンネルに参加してから実行してください。**";
pub(crate) const MESSAGE_EPHEMERAL_ALREADY_RUNNING: &str =
    ":warning: **このボイスチャンネルでは既に文字起こしが実行中です。**";
pub(crate) const MESSAGE_EPHEMERAL_START_FAILED: &str =
    ":warning: **文字起こしの開始に失敗しました。**";
pub(crate) const MESSAGE_EPHEMERAL_NOT_RUNNING: &str =
    ":warning: **現在このボイスチャンネルでは文字起こしは実行されていません。**";
pub(crate) const MESSAGE_POWERED_BY_LINE: &str = "-# *Powered by Mojiokoshi*";

pub(crate) const MESSAGE_START_CHANNEL_TITLE: &str =
    ":microphone2: **文字起こしを開始しました。**";
pub(crate) const MESSAGE_START_CHANNEL_HINT: &str = "-# /mojiokoshi-stop コマンドで中止できます。";

pub(crate) const MESSAGE_STOP_CHANNEL_TITLE: &str =
    ":pause_button:  **文字起こしを中止しました。**";
pub(crate) const MESSAGE_STOP_RESTART: &str = "/mojiokoshi コマンドで開始できます。";
pub(crate) const MESSAGE_STOP_RESTART_AGAIN: &str = "/mojiokoshi コマンドで再度開始できます。";

pub(crate) const MESSAGE_ATTACHMENT_TITLE: &str = ":page_facing_up:  **文字起こしの内容**";

pub(crate) const MESSAGE_START_EPHEMERAL_SECOND_LINE: &str =
    "-# ボイスチャンネルのチャットに文字起こしが表示されます。";
pub(crate) const MESSAGE_START_EPHEMERAL_HINT: &str =
    "-# /mojiokoshi-stop コマンドで中止できます。";
pub(crate) const MESSAGE_STOP_EPHEMERAL_HINT: &str = "-# /mojiokoshi コマンドで開始できます。";

pub(crate) fn start_ephemeral_title(channel_id: &str) -> String {
    format!(":microphone2: <#{channel_id}> **の文字起こしを開始しました。**")
}

pub(crate) fn stop_ephemeral_title(channel_id: &str) -> String {
    format!(":pause_button:  <#{channel_id}> **の文字起こしを中止しました。**")
}

/// One-line human explanation shown beneath the stop announcement.
pub(crate) fn stop_reason_detail(reason: &str) -> &'static str {
    match reason {
        STOP_REASON_MAX_DURATION => "文字起こしの最大制限時間に到達しました。",
        STOP_REASON_MANUAL_SLASH => "参加者に終了コマンドを実行されました。",
        STOP_REASON_PARTICIPANTS_LEFT => "ボイスチャットに誰もいなくなりました。",
        STOP_REASON_BOT_REMOVED => "文字起こしボットが退出させられました。",
        STOP_REASON_SERVER_CLOSED => "文字起こしサーバーが閉じられました。",
        STOP_REASON_UNKNOWN_ERROR => "不明なエラーが発生しました。",
        _ => "不明なエラーが発生しました。",
    }
}

/// Whether the restart hint should read "again" (the session ended without
/// anyone asking for it).
pub(crate) fn stop_reason_needs_restart_again(reason: &str) -> bool {
    matches!(
        reason,
        STOP_REASON_MAX_DURATION | STOP_REASON_SERVER_CLOSED | STOP_REASON_UNKNOWN_ERROR
    )
}
