//! Utterance capture session.
//!
//! One session owns the full lifecycle of a single utterance: it pulls
//! encoded frames off the live packet stream, decodes them, and feeds the
//! decoded chunks to the dispatcher while capture is still running. The
//! endpoint condition is a silence timeout - no new frame for the
//! configured duration ends the utterance.
//!
//! States move `Capturing -> Draining -> Closed`, with a direct jump to
//! `Closed` when the decoder faults. Whatever path is taken, closing
//! releases the decoder, the frame subscription and (through the claim held
//! by the owning task) the speaker registry entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::task::AbortOnDropHandle;

use crate::decoder::FrameDecoder;
use crate::dispatcher::{AudioStreamError, DispatchOutcome, PcmChunk, TranscriptionDispatcher};
use crate::SpeakerId;

/// Decoded chunks buffered between capture and the request body. Remote
/// backpressure propagates into the capture loop through this bound.
const PCM_CHUNK_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Capturing,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A request was dispatched and resolved (delivered, no-speech or
    /// remote failure).
    Completed(DispatchOutcome),
    /// The utterance produced no decoded audio; no request was sent.
    NoAudio,
    /// The decoder faulted. Partial audio is discarded; an in-flight
    /// request, if any, was aborted.
    DecoderFailed,
}

type Upstream = (AbortOnDropHandle<DispatchOutcome>, mpsc::Sender<PcmChunk>);

/// One in-flight utterance for one speaker. Exclusively owned by the task
/// driving it; never shared.
pub struct CaptureSession {
    speaker: SpeakerId,
    started_at: Instant,
    state: SessionState,
    frames: mpsc::Receiver<Bytes>,
    decoder: Box<dyn FrameDecoder>,
    silence: Duration,
}

impl CaptureSession {
    pub fn new(
        speaker: SpeakerId,
        frames: mpsc::Receiver<Bytes>,
        decoder: Box<dyn FrameDecoder>,
        silence: Duration,
    ) -> Self {
        Self {
            speaker,
            started_at: Instant::now(),
            state: SessionState::Capturing,
            frames,
            decoder,
            silence,
        }
    }

    /// Drive the session to completion. The first decoded chunk opens the
    /// outbound request; capture and transmission overlap from then on.
    pub async fn run(mut self, dispatcher: Arc<TranscriptionDispatcher>) -> SessionOutcome {
        debug!("capture session for {} opened", self.speaker);
        let mut upstream: Option<Upstream> = None;
        let mut decode_failed = false;

        loop {
            let frame = match timeout(self.silence, self.frames.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("frame source for {} closed by transport", self.speaker);
                    break;
                }
                Err(_) => {
                    debug!(
                        "silence threshold reached for {} after {:?}",
                        self.speaker, self.silence
                    );
                    break;
                }
            };

            match self.decoder.decode(&frame) {
                Ok(Some(chunk)) => {
                    let (_, tx) =
                        upstream.get_or_insert_with(|| self.open_upstream(&dispatcher));
                    if tx.send(Ok(chunk)).await.is_err() {
                        warn!("dispatcher for {} went away mid-capture", self.speaker);
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!("decoder fault for {}: {}", self.speaker, err);
                    if let Some((_, tx)) = upstream.as_ref() {
                        let _ = tx.send(Err(AudioStreamError::new(err.to_string()))).await;
                    }
                    decode_failed = true;
                    break;
                }
            }
        }

        if decode_failed {
            // The error chunk already pushed onto the body stream aborts
            // any in-flight request; wait for it to settle before closing.
            if let Some((handle, tx)) = upstream.take() {
                drop(tx);
                let _ = handle.await;
            }
            return self.close(SessionOutcome::DecoderFailed);
        }

        match upstream.take() {
            None => self.close(SessionOutcome::NoAudio),
            Some((handle, tx)) => {
                self.set_state(SessionState::Draining);
                drop(tx);
                let outcome = handle.await.unwrap_or(DispatchOutcome::Failed);
                self.close(SessionOutcome::Completed(outcome))
            }
        }
    }

    fn open_upstream(&self, dispatcher: &Arc<TranscriptionDispatcher>) -> Upstream {
        let (tx, rx) = mpsc::channel(PCM_CHUNK_BUFFER);
        let dispatcher = dispatcher.clone();
        let speaker = self.speaker.clone();
        let handle = tokio::spawn(async move { dispatcher.dispatch(&speaker, rx).await });
        (AbortOnDropHandle::new(handle), tx)
    }

    fn close(mut self, outcome: SessionOutcome) -> SessionOutcome {
        // Each release stands on its own: decoder, frame subscription,
        // and the registry claim held by the owning task.
        self.decoder.close();
        self.frames.close();
        self.set_state(SessionState::Closed);
        info!(
            "capture session for {} closed after {:?} ({:?})",
            self.speaker,
            self.started_at.elapsed(),
            outcome
        );
        outcome
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(
            "capture session for {}: {:?} -> {:?}",
            self.speaker, self.state, state
        );
        self.state = state;
    }
}
