//! Runtime configuration from the environment and the command line

use crate::ai::{GeminiSettings, RetryPolicy};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";
pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_LANGUAGE: &str = "en";
/// Per-key storage quota, in line with typical browser local storage.
pub const DEFAULT_HISTORY_QUOTA_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_FALLBACK_PROGRAM: &str = "espeak-ng";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Scan a landmark photo and listen to its story.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Photo of the landmark (JPEG, PNG or WebP)
    pub image: PathBuf,

    /// History is kept per user name
    #[arg(short, long, default_value = "guest")]
    pub user: String,

    /// Language for narration and chat, e.g. "en" or "fr"
    #[arg(short, long)]
    pub language: Option<String>,

    /// Do not open an audio device; narration only keeps time
    #[arg(long)]
    pub silent: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gemini: GeminiSettings,
    pub language: String,
    pub history_dir: PathBuf,
    pub history_quota_bytes: u64,
    /// Speech program used when synthesized audio is unavailable.
    pub fallback_voice: Option<String>,
    pub retry: RetryPolicy,
}

impl Config {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let api_key = get("GEMINI_API_KEY").ok_or(ConfigError::Missing("GEMINI_API_KEY"))?;
        let defaults = RetryPolicy::default();

        Ok(Self {
            gemini: GeminiSettings {
                api_key,
                api_base: or("GEMINI_API_BASE", DEFAULT_API_BASE),
                text_model: or("GEMINI_TEXT_MODEL", DEFAULT_TEXT_MODEL),
                tts_model: or("GEMINI_TTS_MODEL", DEFAULT_TTS_MODEL),
                voice: or("GEMINI_TTS_VOICE", DEFAULT_VOICE),
                timeout: REQUEST_TIMEOUT,
            },
            language: or("TOUR_LANGUAGE", DEFAULT_LANGUAGE),
            history_dir: get("TOUR_HISTORY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_history_dir),
            history_quota_bytes: parse_or(&get, "TOUR_HISTORY_QUOTA_BYTES", DEFAULT_HISTORY_QUOTA_BYTES)?,
            fallback_voice: fallback_program(get("TOUR_FALLBACK_VOICE")),
            retry: RetryPolicy {
                base_delay: get("TOUR_RETRY_BASE_MS")
                    .map(|v| parse::<u64>("TOUR_RETRY_BASE_MS", &v).map(Duration::from_millis))
                    .transpose()?
                    .unwrap_or(defaults.base_delay),
                max_retries: parse_or(&get, "TOUR_MAX_RETRIES", defaults.max_retries)?,
            },
        })
    }

    /// Apply command-line overrides.
    pub fn with_cli(mut self, cli: &Cli) -> Self {
        if let Some(language) = &cli.language {
            self.language = language.clone();
        }
        self
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(name).map_or(Ok(default), |v| parse(name, &v))
}

/// `off` (the default) disables the fallback voice, `on` selects
/// espeak-ng, anything else names the program to run.
fn fallback_program(value: Option<String>) -> Option<String> {
    let value = value?;
    match value.to_lowercase().as_str() {
        "off" | "0" | "false" | "no" => None,
        "on" | "1" | "true" | "yes" => Some(DEFAULT_FALLBACK_PROGRAM.to_string()),
        _ => Some(value),
    }
}

/// Get the default history directory (in app data)
pub fn default_history_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("landmark-guide")
        .join("history")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn api_key_is_required() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("GEMINI_API_KEY"));

        let err = Config::from_lookup(lookup(&[("GEMINI_API_KEY", "  ")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("GEMINI_API_KEY"));
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(lookup(&[("GEMINI_API_KEY", "k")])).unwrap();
        assert_eq!(config.gemini.api_base, DEFAULT_API_BASE);
        assert_eq!(config.gemini.voice, DEFAULT_VOICE);
        assert_eq!(config.language, "en");
        assert_eq!(config.history_quota_bytes, DEFAULT_HISTORY_QUOTA_BYTES);
        assert_eq!(config.fallback_voice, None);
        assert_eq!(config.retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn overrides_and_invalid_numbers() {
        let config = Config::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "k"),
            ("TOUR_LANGUAGE", "fr"),
            ("TOUR_RETRY_BASE_MS", "250"),
            ("TOUR_MAX_RETRIES", "5"),
            ("TOUR_FALLBACK_VOICE", "on"),
        ]))
        .unwrap();
        assert_eq!(config.language, "fr");
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.fallback_voice.as_deref(), Some("espeak-ng"));

        let err = Config::from_lookup(lookup(&[("GEMINI_API_KEY", "k"), ("TOUR_MAX_RETRIES", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "TOUR_MAX_RETRIES", .. }));
    }

    #[test]
    fn cli_language_wins() {
        let cli = Cli::parse_from(["landmark-guide", "photo.jpg", "--language", "de"]);
        let config = Config::from_lookup(lookup(&[("GEMINI_API_KEY", "k")]))
            .unwrap()
            .with_cli(&cli);
        assert_eq!(config.language, "de");
        assert_eq!(cli.user, "guest");
    }
}
