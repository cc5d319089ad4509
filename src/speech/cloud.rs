use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, ClientTlsConfig};
use tonic::Code;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::proto::speech_client::SpeechClient;
use super::proto::{
    explicit_decoding_config::AudioEncoding, recognition_config::DecodingConfig,
    streaming_recognize_request::StreamingRequest, ExplicitDecodingConfig, RecognitionConfig,
    RecognitionFeatures, StreamingRecognitionConfig, StreamingRecognitionFeatures,
    StreamingRecognizeRequest,
};
use super::{ResultReceiver, StreamError, StreamWriter, Transcriber};

const AUDIO_SAMPLE_RATE_HERTZ: i32 = 48_000;
const AUDIO_CHANNEL_COUNT: i32 = 2;
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
/// Buffered audio requests between the writer and the in-flight RPC.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct CloudSpeechConfig {
    pub project_id: String,
    pub credentials_json: String,
    pub language: String,
    pub location: String,
    pub model: String,
}

/// Google Cloud Speech-to-Text v2 streaming client.
pub struct CloudSpeechTranscriber {
    project_id: String,
    credentials_json: String,
    default_language: String,
    location: String,
    model: String,
}

impl CloudSpeechTranscriber {
    pub fn new(cfg: CloudSpeechConfig) -> Self {
        Self {
            project_id: cfg.project_id,
            credentials_json: cfg.credentials_json,
            default_language: cfg.language,
            location: cfg.location.trim().to_string(),
            model: cfg.model.trim().to_string(),
        }
    }

    fn endpoint(&self) -> String {
        if self.location == "global" {
            "https://speech.googleapis.com".to_string()
        } else {
            format!("https://{}-speech.googleapis.com", self.location)
        }
    }

    fn recognizer(&self) -> String {
        format!(
            "projects/{}/locations/{}/recognizers/_",
            self.project_id, self.location
        )
    }

    fn config_frame(&self, language: &str) -> StreamingRecognizeRequest {
        StreamingRecognizeRequest {
            recognizer: self.recognizer(),
            streaming_request: Some(StreamingRequest::StreamingConfig(
                StreamingRecognitionConfig {
                    config: Some(RecognitionConfig {
                        features: Some(RecognitionFeatures::default()),
                        model: self.model.clone(),
                        language_codes: vec![language.to_string()],
                        decoding_config: Some(DecodingConfig::ExplicitDecodingConfig(
                            ExplicitDecodingConfig {
                                encoding: AudioEncoding::Linear16 as i32,
                                sample_rate_hertz: AUDIO_SAMPLE_RATE_HERTZ,
                                audio_channel_count: AUDIO_CHANNEL_COUNT,
                            },
                        )),
                    }),
                    streaming_features: Some(StreamingRecognitionFeatures {
                        enable_voice_activity_events: false,
                        interim_results: true,
                    }),
                },
            )),
        }
    }
}

#[async_trait]
impl Transcriber for CloudSpeechTranscriber {
    async fn start_streaming(
        &self,
        ctx: CancellationToken,
        session_id: Uuid,
        language: &str,
        receiver: Arc<dyn ResultReceiver>,
    ) -> Result<Arc<dyn StreamWriter>> {
        let language = if language.is_empty() {
            self.default_language.clone()
        } else {
            language.to_string()
        };
        info!(
            %session_id,
            location = %self.location,
            %language,
            model = %self.model,
            "starting cloud speech streaming"
        );

        let account = gcp_auth::CustomServiceAccount::from_json(&self.credentials_json)
            .context("failed to parse google cloud credentials")?;
        let provider: Arc<dyn gcp_auth::TokenProvider> = Arc::new(account);

        let channel = Channel::from_shared(self.endpoint())
            .context("invalid speech endpoint")?
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .context("failed to configure tls")?
            .connect()
            .await
            .context("failed to connect to speech endpoint")?;

        let opener = StreamOpener {
            client: SpeechClient::new(channel),
            provider,
            config_frame: self.config_frame(&language),
        };
        let shared = Arc::new(StreamShared {
            receiver,
            ctx,
            session_id,
            last_disconnect: StdMutex::new(None),
        });

        let tx = opener.open(&shared).await?;
        info!(%session_id, "cloud speech stream initialized");

        Ok(Arc::new(CloudStreamWriter {
            state: tokio::sync::Mutex::new(WriterState {
                closed: false,
                tx: Some(tx),
            }),
            opener,
            shared,
        }))
    }
}

/// How the previous RPC ended, recorded by the receive loop and consumed by
/// the next failing write to decide whether to reconnect.
#[derive(Debug, Clone)]
enum Disconnect {
    Retryable(String),
    Fatal(String),
}

struct StreamShared {
    receiver: Arc<dyn ResultReceiver>,
    ctx: CancellationToken,
    session_id: Uuid,
    last_disconnect: StdMutex<Option<Disconnect>>,
}

impl StreamShared {
    fn record_disconnect(&self, disconnect: Disconnect) {
        let mut slot = self.last_disconnect.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(disconnect);
    }

    fn take_disconnect(&self) -> Option<Disconnect> {
        let mut slot = self.last_disconnect.lock().unwrap_or_else(|e| e.into_inner());
        slot.take()
    }
}

struct StreamOpener {
    client: SpeechClient<Channel>,
    provider: Arc<dyn gcp_auth::TokenProvider>,
    config_frame: StreamingRecognizeRequest,
}

impl StreamOpener {
    /// Opens a new streaming RPC: sends the configuration frame first, then
    /// spawns the receive loop on the response side.
    async fn open(
        &self,
        shared: &Arc<StreamShared>,
    ) -> Result<mpsc::Sender<StreamingRecognizeRequest>> {
        let token = self
            .provider
            .token(&[CLOUD_PLATFORM_SCOPE])
            .await
            .context("failed to obtain access token")?;

        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        tx.send(self.config_frame.clone())
            .await
            .map_err(|_| anyhow::anyhow!("request channel closed before config frame"))?;

        let mut request = tonic::Request::new(ReceiverStream::new(rx));
        let bearer = MetadataValue::try_from(format!("Bearer {}", token.as_str()))
            .context("invalid access token metadata")?;
        request.metadata_mut().insert("authorization", bearer);

        let mut client = self.client.clone();
        let response = client
            .streaming_recognize(request)
            .await
            .context("failed to open streaming recognize rpc")?;

        let mut stream = response.into_inner();
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for (i, result) in resp.results.iter().enumerate() {
                            let Some(alt) = result.alternatives.first() else {
                                continue;
                            };
                            shared
                                .receiver
                                .on_result(i, &alt.transcript, result.is_final)
                                .await;
                        }
                    }
                    Ok(None) => {
                        info!(session_id = %shared.session_id, "speech receive loop reached end of stream");
                        shared.record_disconnect(Disconnect::Retryable("end of stream".to_string()));
                        return;
                    }
                    Err(status) => {
                        let cancelled = shared.ctx.is_cancelled()
                            || status.code() == Code::Cancelled
                            || status.message().contains("operation was cancelled");
                        if cancelled {
                            info!(session_id = %shared.session_id, reason = %status, "speech receive loop stopped");
                            return;
                        }
                        if is_reconnectable_status(&status) {
                            warn!(session_id = %shared.session_id, error = %status, "speech receive loop ended with reconnectable abort");
                            shared.record_disconnect(Disconnect::Retryable(status.message().to_string()));
                            return;
                        }
                        shared.record_disconnect(Disconnect::Fatal(status.message().to_string()));
                        shared.receiver.on_error(anyhow::Error::new(status)).await;
                        return;
                    }
                }
            }
        });

        Ok(tx)
    }
}

struct WriterState {
    closed: bool,
    tx: Option<mpsc::Sender<StreamingRecognizeRequest>>,
}

/// Write side of the streaming RPC with transparent reconnect.
struct CloudStreamWriter {
    state: tokio::sync::Mutex<WriterState>,
    opener: StreamOpener,
    shared: Arc<StreamShared>,
}

#[async_trait]
impl StreamWriter for CloudStreamWriter {
    async fn write(&self, pcm: &[u8]) -> Result<(), StreamError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::ClosedPipe);
        }
        let Some(tx) = state.tx.as_ref() else {
            return Err(StreamError::ClosedPipe);
        };

        let request = StreamingRecognizeRequest {
            recognizer: String::new(),
            streaming_request: Some(StreamingRequest::Audio(pcm.to_vec())),
        };
        if tx.send(request.clone()).await.is_ok() {
            return Ok(());
        }

        // The in-flight RPC died under us. Its terminal state decides whether
        // this is a transparent reconnect or a caller-visible failure.
        match self.shared.take_disconnect() {
            Some(Disconnect::Fatal(msg)) => Err(StreamError::Send(msg)),
            Some(Disconnect::Retryable(msg)) => {
                warn!(
                    session_id = %self.shared.session_id,
                    reason = %msg,
                    "speech send failed with reconnectable error; reconnecting"
                );
                self.reconnect_and_retry(&mut state, request).await
            }
            None => {
                warn!(
                    session_id = %self.shared.session_id,
                    "speech stream closed without status; reconnecting"
                );
                self.reconnect_and_retry(&mut state, request).await
            }
        }
    }

    async fn close(&self) -> Result<(), StreamError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        // Dropping the sender half-closes the RPC; the server then finishes
        // the response stream on its own.
        state.tx = None;
        Ok(())
    }
}

impl CloudStreamWriter {
    async fn reconnect_and_retry(
        &self,
        state: &mut WriterState,
        request: StreamingRecognizeRequest,
    ) -> Result<(), StreamError> {
        let tx = match self.opener.open(&self.shared).await {
            Ok(tx) => tx,
            Err(err) => {
                error!(session_id = %self.shared.session_id, error = %err, "failed to reconnect speech stream");
                return Err(StreamError::Reconnect(err.to_string()));
            }
        };
        let result = tx
            .send(request)
            .await
            .map_err(|_| StreamError::Send("stream closed during retried write".to_string()));
        state.tx = Some(tx);
        info!(session_id = %self.shared.session_id, "speech stream reconnected");
        result
    }
}

/// EOF-like disconnects and the documented streaming limits are safe to
/// reconnect through; anything else surfaces to the receiver.
fn is_reconnectable_status(status: &tonic::Status) -> bool {
    let msg = status.message().to_lowercase();
    if msg.contains("eof") {
        return true;
    }
    if status.code() != Code::Aborted {
        return false;
    }
    msg.contains("max duration of 5 minutes")
        || msg.contains("stream timed out after receiving no more client requests")
}
