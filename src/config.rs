//! Environment-driven configuration.
//!
//! All settings come from the process environment (a `.env` file is honoured
//! at startup). Missing required values are a startup misconfiguration and
//! abort the process before the Discord client is built.

use std::env;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_SILENCE_MS: u64 = 2000;
const DEFAULT_STT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{name} is not a valid integer: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Discord bot token.
    pub discord_token: String,
    /// Endpoint the streamed PCM is POSTed to.
    pub stt_url: String,
    /// Silence duration that ends an utterance.
    pub silence: Duration,
    /// Bound on the transcription round trip.
    pub stt_timeout: Duration,
    /// When set, slash commands register against this guild (instant
    /// availability) instead of globally.
    pub guild_id: Option<u64>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            discord_token: require("DISCORD_TOKEN", env::var("DISCORD_TOKEN").ok())?,
            stt_url: require("STT_URL", env::var("STT_URL").ok())?,
            silence: Duration::from_millis(parse_or(
                "RECORD_SILENCE_MS",
                env::var("RECORD_SILENCE_MS").ok(),
                DEFAULT_SILENCE_MS,
            )?),
            stt_timeout: Duration::from_secs(parse_or(
                "STT_TIMEOUT_SECS",
                env::var("STT_TIMEOUT_SECS").ok(),
                DEFAULT_STT_TIMEOUT_SECS,
            )?),
            guild_id: parse_opt("GUILD_ID", env::var("GUILD_ID").ok())?,
        })
    }
}

fn require(name: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse_or(name: &'static str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: v }),
        _ => Ok(default),
    }
}

fn parse_opt(name: &'static str, value: Option<String>) -> Result<Option<u64>, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: v }),
        _ => Ok(None),
    }
}
