//! Speaker concurrency guard.
//!
//! A live voice transport can emit repeated speech-start signals for one
//! speaker while a prior capture is still draining. Without mutual exclusion
//! per speaker those would spawn overlapping sessions and duplicate
//! responses. The registry is the single source of truth for "is this
//! speaker already being captured" - session object identity is not.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::SpeakerId;

/// Process-wide set of speakers currently under active capture.
///
/// Admission is a single atomic check-and-insert under one lock; a plain
/// "check then insert" would reintroduce the race this type exists to
/// prevent. Distinct speakers proceed fully in parallel.
#[derive(Debug, Default)]
pub struct SpeakerRegistry {
    active: Mutex<HashSet<SpeakerId>>,
}

impl SpeakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically admit `speaker` for capture.
    ///
    /// Returns `None` when a session for the speaker is already active -
    /// the caller must ignore the triggering event entirely. On success the
    /// returned claim releases the entry when dropped, so release happens
    /// exactly once per admission no matter how the session ends.
    pub fn try_admit(self: &Arc<Self>, speaker: &str) -> Option<SpeakerClaim> {
        let mut active = self.active.lock().unwrap();
        if !active.insert(speaker.to_string()) {
            return None;
        }
        Some(SpeakerClaim {
            registry: self.clone(),
            speaker: speaker.to_string(),
        })
    }

    /// Remove `speaker` from the active set. Safe to call for a speaker
    /// that is not present.
    pub fn release(&self, speaker: &str) {
        let mut active = self.active.lock().unwrap();
        if !active.remove(speaker) {
            debug!("release for {} with no active entry", speaker);
        }
    }

    pub fn is_active(&self, speaker: &str) -> bool {
        self.active.lock().unwrap().contains(speaker)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

/// RAII handle for one admitted capture session.
#[derive(Debug)]
pub struct SpeakerClaim {
    registry: Arc<SpeakerRegistry>,
    speaker: SpeakerId,
}

impl SpeakerClaim {
    pub fn speaker(&self) -> &str {
        &self.speaker
    }
}

impl Drop for SpeakerClaim {
    fn drop(&mut self) {
        self.registry.release(&self.speaker);
    }
}
