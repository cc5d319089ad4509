//! Hand-committed subset of the generated `google.cloud.speech.v2` bindings.
//!
//! Only the messages and the one streaming RPC this crate uses are included,
//! mirroring the output of `tonic-build`, so the build does not depend on
//! `protoc` or a vendored proto tree. Field tags match the published proto;
//! unknown response fields are skipped by prost.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingRecognizeRequest {
    /// Format: `projects/{project}/locations/{location}/recognizers/{recognizer}`.
    #[prost(string, tag = "3")]
    pub recognizer: ::prost::alloc::string::String,
    #[prost(oneof = "streaming_recognize_request::StreamingRequest", tags = "6, 5")]
    pub streaming_request: ::core::option::Option<streaming_recognize_request::StreamingRequest>,
}

pub mod streaming_recognize_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum StreamingRequest {
        /// Must be sent exactly once, before any audio.
        #[prost(message, tag = "6")]
        StreamingConfig(super::StreamingRecognitionConfig),
        #[prost(bytes, tag = "5")]
        Audio(::prost::alloc::vec::Vec<u8>),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingRecognitionConfig {
    #[prost(message, optional, tag = "1")]
    pub config: ::core::option::Option<RecognitionConfig>,
    #[prost(message, optional, tag = "2")]
    pub streaming_features: ::core::option::Option<StreamingRecognitionFeatures>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingRecognitionFeatures {
    #[prost(bool, tag = "1")]
    pub enable_voice_activity_events: bool,
    #[prost(bool, tag = "2")]
    pub interim_results: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecognitionConfig {
    #[prost(message, optional, tag = "2")]
    pub features: ::core::option::Option<RecognitionFeatures>,
    #[prost(string, tag = "9")]
    pub model: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "10")]
    pub language_codes: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(oneof = "recognition_config::DecodingConfig", tags = "7, 8")]
    pub decoding_config: ::core::option::Option<recognition_config::DecodingConfig>,
}

pub mod recognition_config {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum DecodingConfig {
        #[prost(message, tag = "7")]
        AutoDecodingConfig(super::AutoDetectDecodingConfig),
        #[prost(message, tag = "8")]
        ExplicitDecodingConfig(super::ExplicitDecodingConfig),
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct AutoDetectDecodingConfig {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ExplicitDecodingConfig {
    #[prost(enumeration = "explicit_decoding_config::AudioEncoding", tag = "1")]
    pub encoding: i32,
    #[prost(int32, tag = "2")]
    pub sample_rate_hertz: i32,
    #[prost(int32, tag = "3")]
    pub audio_channel_count: i32,
}

pub mod explicit_decoding_config {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum AudioEncoding {
        Unspecified = 0,
        Linear16 = 1,
        Mulaw = 2,
        Alaw = 3,
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RecognitionFeatures {
    #[prost(bool, tag = "4")]
    pub enable_automatic_punctuation: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingRecognizeResponse {
    #[prost(message, repeated, tag = "6")]
    pub results: ::prost::alloc::vec::Vec<StreamingRecognitionResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingRecognitionResult {
    #[prost(message, repeated, tag = "1")]
    pub alternatives: ::prost::alloc::vec::Vec<SpeechRecognitionAlternative>,
    #[prost(bool, tag = "2")]
    pub is_final: bool,
    #[prost(float, tag = "3")]
    pub stability: f32,
    #[prost(string, tag = "6")]
    pub language_code: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SpeechRecognitionAlternative {
    #[prost(string, tag = "1")]
    pub transcript: ::prost::alloc::string::String,
    #[prost(float, tag = "2")]
    pub confidence: f32,
}

pub mod speech_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::wildcard_imports)]
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct SpeechClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl SpeechClient<tonic::transport::Channel> {
        pub fn new(inner: tonic::transport::Channel) -> Self {
            Self {
                inner: tonic::client::Grpc::new(inner),
            }
        }
    }

    impl<T> SpeechClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub async fn streaming_recognize(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = super::StreamingRecognizeRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::StreamingRecognizeResponse>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/google.cloud.speech.v2.Speech/StreamingRecognize",
            );
            let mut req = request.into_streaming_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "google.cloud.speech.v2.Speech",
                "StreamingRecognize",
            ));
            self.inner.streaming(req, path, codec).await
        }
    }
}
