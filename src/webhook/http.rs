use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{Sender, TranscriptWebhookPayload};

/// Posts transcript payloads as JSON to a fixed webhook URL. An empty URL
/// disables delivery entirely.
pub struct HttpSender {
    webhook_url: String,
    client: reqwest::Client,
}

impl HttpSender {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send_transcript(&self, payload: &TranscriptWebhookPayload) -> Result<()> {
        if self.webhook_url.is_empty() {
            return Ok(());
        }

        let resp = self
            .client
            .post(&self.webhook_url)
            .json(payload)
            .send()
            .await
            .context("failed to send webhook request")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("webhook returned status {}", status.as_u16());
        }
        Ok(())
    }
}
