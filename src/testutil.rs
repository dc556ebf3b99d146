//! Test doubles shared across module test suites.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

use crate::decoder::{DecoderError, DecoderFactory, FrameDecoder, OpusFrameDecoder};
use crate::delivery::TextSink;
use crate::dispatcher::{PcmReceiver, SttClient, SttError, TranscriptionResult};

/// A real decode failure, taken from the actual adapter so tests never
/// guess at codec error variants.
pub(crate) fn sample_decode_error() -> DecoderError {
    OpusFrameDecoder::new()
        .expect("opus decoder")
        .decode(&[])
        .expect_err("empty frame must fail")
}

/// Decoder double that echoes each frame back as its "decoded" chunk.
pub(crate) struct PassthroughDecoder {
    closed: Arc<AtomicBool>,
}

impl PassthroughDecoder {
    pub(crate) fn new() -> Self {
        Self {
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn closed_handle(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl FrameDecoder for PassthroughDecoder {
    fn decode(&self, frame: &[u8]) -> Result<Option<Bytes>, DecoderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(frame)))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Decoder double that passes `ok_frames` frames through, then faults.
pub(crate) struct FailingDecoder {
    ok_frames: usize,
    seen: AtomicUsize,
    closed: Arc<AtomicBool>,
}

impl FailingDecoder {
    pub(crate) fn after(ok_frames: usize) -> Self {
        Self {
            ok_frames,
            seen: AtomicUsize::new(0),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn closed_handle(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl FrameDecoder for FailingDecoder {
    fn decode(&self, frame: &[u8]) -> Result<Option<Bytes>, DecoderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if self.seen.fetch_add(1, Ordering::SeqCst) < self.ok_frames {
            Ok(Some(Bytes::copy_from_slice(frame)))
        } else {
            Err(sample_decode_error())
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct PassthroughFactory;

impl DecoderFactory for PassthroughFactory {
    fn create(&self) -> Result<Box<dyn FrameDecoder>, DecoderError> {
        Ok(Box::new(PassthroughDecoder::new()))
    }
}

/// Factory double counting how many decoder instances were opened.
pub(crate) struct CountingFactory {
    created: Arc<AtomicUsize>,
}

impl CountingFactory {
    pub(crate) fn new() -> Self {
        Self {
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn created_handle(&self) -> Arc<AtomicUsize> {
        self.created.clone()
    }
}

impl DecoderFactory for CountingFactory {
    fn create(&self) -> Result<Box<dyn FrameDecoder>, DecoderError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(PassthroughDecoder::new()))
    }
}

enum SttMode {
    Ok(TranscriptionResult),
    Fail,
    DropInput,
}

/// STT double that drains the PCM channel like the real client drains the
/// request body, recording what it saw.
pub(crate) struct RecordingStt {
    mode: SttMode,
    requests: AtomicUsize,
    chunks: Mutex<Vec<Vec<u8>>>,
    saw_abort: AtomicBool,
    first_chunk: Semaphore,
}

impl RecordingStt {
    fn with_mode(mode: SttMode) -> Self {
        Self {
            mode,
            requests: AtomicUsize::new(0),
            chunks: Mutex::new(Vec::new()),
            saw_abort: AtomicBool::new(false),
            first_chunk: Semaphore::new(0),
        }
    }

    pub(crate) fn ok(result: TranscriptionResult) -> Self {
        Self::with_mode(SttMode::Ok(result))
    }

    pub(crate) fn failing() -> Self {
        Self::with_mode(SttMode::Fail)
    }

    /// Drops the PCM channel without reading it, like a request that dies
    /// before the body is consumed.
    pub(crate) fn dropping_input() -> Self {
        Self::with_mode(SttMode::DropInput)
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn chunks(&self) -> Vec<Vec<u8>> {
        self.chunks.lock().unwrap().clone()
    }

    pub(crate) fn saw_abort(&self) -> bool {
        self.saw_abort.load(Ordering::SeqCst)
    }

    /// Resolves once the first streamed chunk of any request has arrived.
    pub(crate) async fn first_chunk_seen(&self) {
        let permit = self.first_chunk.acquire().await.unwrap();
        permit.forget();
    }

    fn error() -> SttError {
        SttError::Status {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            body: "boom".to_string(),
        }
    }
}

#[async_trait]
impl SttClient for RecordingStt {
    async fn transcribe(
        &self,
        _speaker: &str,
        mut pcm: PcmReceiver,
    ) -> Result<TranscriptionResult, SttError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if matches!(self.mode, SttMode::DropInput) {
            drop(pcm);
            return Err(Self::error());
        }

        let mut first = true;
        while let Some(chunk) = pcm.recv().await {
            match chunk {
                Ok(bytes) => {
                    self.chunks.lock().unwrap().push(bytes.to_vec());
                    if first {
                        self.first_chunk.add_permits(1);
                        first = false;
                    }
                }
                Err(_) => {
                    self.saw_abort.store(true, Ordering::SeqCst);
                    return Err(Self::error());
                }
            }
        }

        match &self.mode {
            SttMode::Ok(result) => Ok(result.clone()),
            SttMode::Fail => Err(Self::error()),
            SttMode::DropInput => unreachable!(),
        }
    }
}

/// Delivery double recording `(speaker, text)` pairs.
pub(crate) struct RecordingSink {
    fail: bool,
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self {
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextSink for RecordingSink {
    async fn deliver(&self, speaker: &str, text: &str) -> Result<(), String> {
        if self.fail {
            return Err("sink unavailable".to_string());
        }
        self.calls
            .lock()
            .unwrap()
            .push((speaker.to_string(), text.to_string()));
        Ok(())
    }
}
