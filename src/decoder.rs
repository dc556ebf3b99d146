//! Opus frame decoding.
//!
//! Wraps the codec as a push-style transform: encoded frames go in, one
//! little-endian 16-bit PCM chunk comes out per frame, in arrival order.
//! The adapter is forward-only and not restartable; `close` may be called
//! any number of times, from any thread, including while a decode is in
//! flight on another - after close the adapter simply stops producing.

use std::sync::Mutex;

use audiopus::coder::Decoder as OpusDecoder;
use audiopus::{Channels, SampleRate};
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use thiserror::Error;

/// Fixed voice-channel audio format. These are collaborator-boundary
/// constants, not negotiated per session.
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: usize = 2;
pub const FRAME_SAMPLES: usize = 960;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("failed to initialize opus decoder: {0}")]
    Init(audiopus::Error),
    #[error("opus frame decode failed: {0}")]
    Decode(audiopus::Error),
}

/// Black-box frame transform the capture session runs its audio through.
///
/// `decode` returns `Ok(None)` once the decoder has been closed; order of
/// produced chunks follows the order frames were pushed.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, frame: &[u8]) -> Result<Option<Bytes>, DecoderError>;
    fn close(&self);
}

/// Creates one decoder instance per admitted capture session.
pub trait DecoderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn FrameDecoder>, DecoderError>;
}

/// libopus-backed decoder bound to the fixed 48kHz stereo format.
pub struct OpusFrameDecoder {
    inner: Mutex<Option<OpusDecoder>>,
}

impl OpusFrameDecoder {
    pub fn new() -> Result<Self, DecoderError> {
        let decoder = OpusDecoder::new(SampleRate::Hz48000, Channels::Stereo)
            .map_err(DecoderError::Init)?;
        Ok(Self {
            inner: Mutex::new(Some(decoder)),
        })
    }
}

impl FrameDecoder for OpusFrameDecoder {
    fn decode(&self, frame: &[u8]) -> Result<Option<Bytes>, DecoderError> {
        let mut guard = self.inner.lock().unwrap();
        let decoder = match guard.as_mut() {
            Some(decoder) => decoder,
            None => return Ok(None),
        };

        let mut pcm = vec![0i16; FRAME_SAMPLES * CHANNELS];
        let samples = decoder
            .decode(Some(frame), &mut pcm, false)
            .map_err(DecoderError::Decode)?;

        let mut chunk = vec![0u8; samples * CHANNELS * 2];
        LittleEndian::write_i16_into(&pcm[..samples * CHANNELS], &mut chunk);
        Ok(Some(Bytes::from(chunk)))
    }

    fn close(&self) {
        self.inner.lock().unwrap().take();
    }
}

impl Drop for OpusFrameDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct OpusDecoderFactory;

impl DecoderFactory for OpusDecoderFactory {
    fn create(&self) -> Result<Box<dyn FrameDecoder>, DecoderError> {
        Ok(Box::new(OpusFrameDecoder::new()?))
    }
}
