//! Speech-start handling.
//!
//! Glues the registry, the decoder factory and the dispatcher together:
//! every admitted speech-start spawns one capture session task, and the
//! transport gets back a sender to push that speaker's encoded frames
//! through. Teardown aborts whatever is still running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::decoder::DecoderFactory;
use crate::dispatcher::TranscriptionDispatcher;
use crate::registry::SpeakerRegistry;
use crate::session::CaptureSession;
use crate::SpeakerId;

/// Encoded frames buffered between the transport event handler and a
/// session's capture loop (20ms frames, so roughly five seconds).
const FRAME_CHANNEL_CAPACITY: usize = 256;

pub struct UtterancePipeline {
    registry: Arc<SpeakerRegistry>,
    dispatcher: Arc<TranscriptionDispatcher>,
    decoders: Arc<dyn DecoderFactory>,
    silence: Duration,
    sessions: Mutex<HashMap<SpeakerId, JoinHandle<()>>>,
}

impl UtterancePipeline {
    pub fn new(
        registry: Arc<SpeakerRegistry>,
        dispatcher: Arc<TranscriptionDispatcher>,
        decoders: Arc<dyn DecoderFactory>,
        silence: Duration,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            decoders,
            silence,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a speech-start signal for `speaker`.
    ///
    /// Returns the frame sender for the new capture session, or `None`
    /// when admission is denied - a denied signal is ignored outright, no
    /// decoder or channel is allocated for it. The registry stays the
    /// single source of truth: a speaker whose previous session is still
    /// draining is denied exactly like a live duplicate.
    pub fn on_speech_start(&self, speaker: &str) -> Option<mpsc::Sender<Bytes>> {
        let claim = match self.registry.try_admit(speaker) {
            Some(claim) => claim,
            None => {
                debug!("speech-start for {} ignored, capture already active", speaker);
                return None;
            }
        };

        let decoder = match self.decoders.create() {
            Ok(decoder) => decoder,
            Err(err) => {
                // Claim drops here, releasing the registry entry
                error!("could not open a decoder for {}: {}", speaker, err);
                return None;
            }
        };

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let session = CaptureSession::new(speaker.to_string(), rx, decoder, self.silence);
        let dispatcher = self.dispatcher.clone();
        let handle = tokio::spawn(async move {
            // The claim lives for the whole task, so the registry entry is
            // released exactly once however the session ends - including
            // an abort mid-flight.
            let _claim = claim;
            session.run(dispatcher).await;
        });
        self.track(speaker, handle);
        Some(tx)
    }

    /// Force every open session through its close path. Best-effort abrupt
    /// shutdown: in-flight remote requests are abandoned, resource release
    /// happens through the aborted tasks' drops.
    pub fn teardown(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for (speaker, handle) in sessions.drain() {
            if !handle.is_finished() {
                debug!("aborting capture session for {}", speaker);
                handle.abort();
            }
        }
    }

    fn track(&self, speaker: &str, handle: JoinHandle<()>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, h| !h.is_finished());
        sessions.insert(speaker.to_string(), handle);
    }
}
