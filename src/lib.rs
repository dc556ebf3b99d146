//! Voxscribe - Discord voice-channel transcription bot
//!
//! Sits in a voice channel, captures each participant's utterances (speech
//! start to silence timeout), decodes the Opus frames to raw PCM and streams
//! them to a remote speech-to-text service while the capture is still in
//! progress. Recognized text is posted back to the text channel the bot was
//! invited from.
//!
//! Audio flow:
//! - Voice packets arrive per-SSRC through songbird's receive events
//! - A process-wide registry admits at most one capture session per speaker
//! - Each admitted session decodes frames and feeds a bounded PCM channel
//! - The channel is the streamed body of the outbound transcription request

pub mod config;
pub mod decoder;
pub mod delivery;
pub mod discord;
pub mod dispatcher;
pub mod pipeline;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;

/// Stable identifier for a voice participant, as rendered on the wire
/// (the Discord user id in decimal form).
pub type SpeakerId = String;

pub use config::Config;
pub use decoder::{DecoderError, DecoderFactory, FrameDecoder, OpusDecoderFactory, OpusFrameDecoder};
pub use delivery::TextSink;
pub use dispatcher::{
    DispatchOutcome, HttpSttClient, SttClient, SttError, TranscriptionDispatcher,
    TranscriptionResult,
};
pub use pipeline::UtterancePipeline;
pub use registry::{SpeakerClaim, SpeakerRegistry};
pub use session::{CaptureSession, SessionOutcome};
