//! Voice receive handler - bridges songbird events into capture sessions.
//!
//! Songbird runs with `DecodeMode::Decrypt`, so every `VoiceTick` carries
//! the decrypted-but-still-encoded Opus payload per SSRC. The first packet
//! seen for an SSRC with no live capture is that speaker's speech-start
//! signal; whether a session actually opens is the pipeline's call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use songbird::events::context_data::VoiceData;
use songbird::events::{Event, EventContext, EventHandler as VoiceEventHandler};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

use crate::pipeline::UtterancePipeline;
use crate::SpeakerId;

#[derive(Clone)]
pub struct VoiceReceiver {
    pipeline: Arc<UtterancePipeline>,
    state: Arc<RwLock<ReceiverState>>,
}

#[derive(Default)]
struct ReceiverState {
    ssrc_to_user: HashMap<u32, SpeakerId>,
    frame_senders: HashMap<u32, mpsc::Sender<Bytes>>,
}

impl VoiceReceiver {
    pub fn new(pipeline: Arc<UtterancePipeline>) -> Self {
        Self {
            pipeline,
            state: Arc::new(RwLock::new(ReceiverState::default())),
        }
    }

    /// Opus payload of a tick entry, with RTP framing stripped.
    fn opus_payload(data: &VoiceData) -> Option<Bytes> {
        let rtp = data.packet.as_ref()?;
        let end = rtp.packet.len().checked_sub(rtp.payload_end_pad)?;
        if rtp.payload_offset >= end {
            return None;
        }
        Some(rtp.packet.slice(rtp.payload_offset..end))
    }
}

#[async_trait]
impl VoiceEventHandler for VoiceReceiver {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::SpeakingStateUpdate(speaking) => {
                if let Some(user_id) = speaking.user_id {
                    let mut state = self.state.write().await;
                    state
                        .ssrc_to_user
                        .insert(speaking.ssrc, user_id.to_string());
                    debug!("mapped SSRC {} to user {}", speaking.ssrc, user_id);
                }
            }
            EventContext::VoiceTick(tick) => {
                let mut state = self.state.write().await;
                for (ssrc, data) in &tick.speaking {
                    let frame = match Self::opus_payload(data) {
                        Some(frame) => frame,
                        None => continue,
                    };

                    match state
                        .frame_senders
                        .get(ssrc)
                        .map(|tx| tx.try_send(frame.clone()))
                    {
                        Some(Ok(())) => continue,
                        Some(Err(TrySendError::Full(_))) => {
                            warn!("frame buffer full for SSRC {}, dropping packet", ssrc);
                            continue;
                        }
                        Some(Err(TrySendError::Closed(_))) => {
                            // The session ended (silence timeout or error);
                            // this packet counts as a fresh speech-start.
                            state.frame_senders.remove(ssrc);
                        }
                        None => {}
                    }

                    let speaker = state
                        .ssrc_to_user
                        .get(ssrc)
                        .cloned()
                        .unwrap_or_else(|| ssrc.to_string());
                    if let Some(tx) = self.pipeline.on_speech_start(&speaker) {
                        let _ = tx.try_send(frame);
                        state.frame_senders.insert(*ssrc, tx);
                    }
                }
            }
            EventContext::DriverDisconnect(_) => {
                info!("voice transport went away, tearing down open sessions");
                {
                    let mut state = self.state.write().await;
                    state.frame_senders.clear();
                    state.ssrc_to_user.clear();
                }
                self.pipeline.teardown();
            }
            _ => {}
        }
        None
    }
}
