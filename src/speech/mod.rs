pub mod cloud;
pub mod proto;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use cloud::{CloudSpeechConfig, CloudSpeechTranscriber};

/// Errors surfaced by a recognition stream writer. Retryable server aborts
/// never reach the caller; the writer reconnects internally.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("recognition stream is closed")]
    ClosedPipe,
    #[error("failed to reconnect recognition stream: {0}")]
    Reconnect(String),
    #[error("recognition stream rejected audio: {0}")]
    Send(String),
}

/// Receives recognition results demultiplexed from the streaming response.
///
/// `segment_index` is the alternative's position within one server response;
/// receivers that persist segments are expected to assign their own
/// session-scoped ordering.
#[async_trait]
pub trait ResultReceiver: Send + Sync {
    async fn on_result(&self, segment_index: usize, text: &str, is_final: bool);
    async fn on_error(&self, err: anyhow::Error);
}

/// Write side of one recognition stream.
#[async_trait]
pub trait StreamWriter: Send + Sync {
    /// Sends one chunk of LINEAR16 PCM. Transparently reconnects on
    /// retryable server aborts (stream max duration, idle timeout, EOF) and
    /// retries the write once.
    async fn write(&self, pcm: &[u8]) -> Result<(), StreamError>;

    /// Half-closes the stream. Idempotent; writes after close fail with
    /// `StreamError::ClosedPipe`.
    async fn close(&self) -> Result<(), StreamError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Opens a streaming recognition session and spawns its receive loop.
    /// Results and terminal errors are delivered through `receiver`.
    async fn start_streaming(
        &self,
        ctx: CancellationToken,
        session_id: Uuid,
        language: &str,
        receiver: Arc<dyn ResultReceiver>,
    ) -> Result<Arc<dyn StreamWriter>>;
}
