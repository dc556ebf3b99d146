//! Transcription dispatch.
//!
//! Streams a session's decoded PCM as the body of one POST to the
//! speech-to-text service, parses the structured response and hands any
//! actionable text to the delivery sink. Dispatch failures are isolated per
//! speaker: they are logged and never propagate beyond the session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::delivery::TextSink;

/// Raw audio format of the request body, matching the decoder's fixed
/// output format.
pub const AUDIO_CONTENT_TYPE: &str = "audio/raw;rate=48000;bits=16;channels=2";

/// The speaker identity rides out-of-band, never inside the audio body.
pub const SPEAKER_HEADER: &str = "X-User-Id";

/// Error item pushed onto the PCM channel to abort an in-flight request
/// body when the capture side faults mid-stream.
#[derive(Debug, Error)]
#[error("audio capture aborted: {reason}")]
pub struct AudioStreamError {
    reason: String,
}

impl AudioStreamError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

pub type PcmChunk = Result<Bytes, AudioStreamError>;
pub type PcmReceiver = mpsc::Receiver<PcmChunk>;

/// Structured response of the transcription service. Any other payload
/// shape is a protocol error.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TranscriptionResult {
    pub detected: bool,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum SttError {
    #[error("failed to build transcription client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("transcription request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("transcription service returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("malformed transcription response ({source}): {body}")]
    Malformed {
        source: serde_json::Error,
        body: String,
    },
}

/// Request/response boundary to the remote service.
#[async_trait]
pub trait SttClient: Send + Sync {
    async fn transcribe(
        &self,
        speaker: &str,
        pcm: PcmReceiver,
    ) -> Result<TranscriptionResult, SttError>;
}

/// HTTP client streaming the PCM channel as a chunked request body, so the
/// request is in flight while the utterance is still being captured and
/// memory stays bounded by the channel, not the utterance.
pub struct HttpSttClient {
    client: reqwest::Client,
    url: String,
}

impl HttpSttClient {
    /// `timeout` bounds the whole round trip; a hung remote service must
    /// not hold a session (and its registry entry) open forever.
    pub fn new(url: String, timeout: Duration) -> Result<Self, SttError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SttError::Build)?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl SttClient for HttpSttClient {
    async fn transcribe(
        &self,
        speaker: &str,
        pcm: PcmReceiver,
    ) -> Result<TranscriptionResult, SttError> {
        let body = futures::stream::unfold(pcm, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });

        debug!("streaming transcription request for {}", speaker);
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, AUDIO_CONTENT_TYPE)
            .header(SPEAKER_HEADER, speaker)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(SttError::Request)?;

        let status = response.status();
        let body = response.text().await.map_err(SttError::Request)?;
        if !status.is_success() {
            return Err(SttError::Status { status, body });
        }
        serde_json::from_str(&body).map_err(|source| SttError::Malformed { source, body })
    }
}

/// Outcome of one completed capture session, after gating and delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Actionable text was posted to the sink.
    Delivered,
    /// The service answered but there was nothing worth posting. Not a
    /// failure.
    NoSpeech,
    /// Remote or delivery error; logged, no user-visible effect.
    Failed,
}

pub struct TranscriptionDispatcher {
    stt: Arc<dyn SttClient>,
    sink: Arc<dyn TextSink>,
}

impl TranscriptionDispatcher {
    pub fn new(stt: Arc<dyn SttClient>, sink: Arc<dyn TextSink>) -> Self {
        Self { stt, sink }
    }

    /// One round trip for one capture session: exactly one request, and at
    /// most one delivery call.
    pub async fn dispatch(&self, speaker: &str, pcm: PcmReceiver) -> DispatchOutcome {
        let result = match self.stt.transcribe(speaker, pcm).await {
            Ok(result) => result,
            Err(err) => {
                error!("transcription for {} failed: {}", speaker, err);
                return DispatchOutcome::Failed;
            }
        };

        let text = match actionable_text(&result) {
            Some(text) => text,
            None => {
                debug!("nothing detected for {}", speaker);
                return DispatchOutcome::NoSpeech;
            }
        };

        match self.sink.deliver(speaker, text).await {
            Ok(()) => DispatchOutcome::Delivered,
            Err(err) => {
                error!("failed to deliver transcript for {}: {}", speaker, err);
                DispatchOutcome::Failed
            }
        }
    }
}

/// Text is only worth delivering when the service flagged speech and the
/// trimmed transcript is non-empty.
fn actionable_text(result: &TranscriptionResult) -> Option<&str> {
    if !result.detected {
        return None;
    }
    let text = result.text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{RecordingSink, RecordingStt};

    fn result(detected: bool, text: &str) -> TranscriptionResult {
        TranscriptionResult {
            detected,
            text: text.to_string(),
        }
    }

    fn closed_pcm() -> PcmReceiver {
        let (_, rx) = mpsc::channel(1);
        rx
    }

    #[test]
    fn test_actionable_text_gating() {
        assert_eq!(actionable_text(&result(false, "hello")), None);
        assert_eq!(actionable_text(&result(true, "")), None);
        assert_eq!(actionable_text(&result(true, "   ")), None);
        assert_eq!(actionable_text(&result(true, " hi ")), Some("hi"));
    }

    #[test]
    fn test_response_shape_is_enforced() {
        let ok: TranscriptionResult =
            serde_json::from_str(r#"{"detected":true,"text":"salut"}"#).unwrap();
        assert_eq!(ok, result(true, "salut"));

        // Missing fields are a protocol error, not a default
        assert!(serde_json::from_str::<TranscriptionResult>(r#"{"text":"salut"}"#).is_err());
        assert!(serde_json::from_str::<TranscriptionResult>(r#"{"status":"ok"}"#).is_err());
    }

    #[tokio::test]
    async fn test_undetected_result_is_not_delivered() {
        let stt = Arc::new(RecordingStt::ok(result(false, "hello")));
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = TranscriptionDispatcher::new(stt, sink.clone());

        let outcome = dispatcher.dispatch("9", closed_pcm()).await;
        assert_eq!(outcome, DispatchOutcome::NoSpeech);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_text_is_not_delivered() {
        let stt = Arc::new(RecordingStt::ok(result(true, "  ")));
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = TranscriptionDispatcher::new(stt, sink.clone());

        let outcome = dispatcher.dispatch("9", closed_pcm()).await;
        assert_eq!(outcome, DispatchOutcome::NoSpeech);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_actionable_result_is_delivered_once() {
        let stt = Arc::new(RecordingStt::ok(result(true, "hi")));
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = TranscriptionDispatcher::new(stt, sink.clone());

        let outcome = dispatcher.dispatch("9", closed_pcm()).await;
        assert_eq!(outcome, DispatchOutcome::Delivered);
        assert_eq!(sink.calls(), vec![("9".to_string(), "hi".to_string())]);
    }

    #[tokio::test]
    async fn test_remote_error_is_contained() {
        let stt = Arc::new(RecordingStt::failing());
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = TranscriptionDispatcher::new(stt, sink.clone());

        let outcome = dispatcher.dispatch("9", closed_pcm()).await;
        assert_eq!(outcome, DispatchOutcome::Failed);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sink_error_is_contained() {
        let stt = Arc::new(RecordingStt::ok(result(true, "hi")));
        let sink = Arc::new(RecordingSink::failing());
        let dispatcher = TranscriptionDispatcher::new(stt, sink);

        let outcome = dispatcher.dispatch("9", closed_pcm()).await;
        assert_eq!(outcome, DispatchOutcome::Failed);
    }
}
