//! Result delivery boundary.
//!
//! The surrounding application decides where recognized text goes; the
//! dispatcher only knows this trait.

use async_trait::async_trait;

/// Posts recognized text back to the channel a capture originated from.
#[async_trait]
pub trait TextSink: Send + Sync {
    async fn deliver(&self, speaker: &str, text: &str) -> Result<(), String>;
}

/// Render one transcript line, attributing the text to its speaker.
pub fn format_transcript_line(speaker: &str, text: &str) -> String {
    format!("**<@{}>**: {}", speaker, text)
}
