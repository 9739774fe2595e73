//! Resolves one narration segment to playable audio.

use crate::ai::{ApiError, SpeechSynthesizer};
use crate::tts::decoder::{AudioAsset, AudioDecoder};
use std::sync::Arc;

/// Fetches and decodes synthesized audio for a single segment.
///
/// Synthesis is attempted exactly once, rate limits included. Every failure
/// is logged and reported as `None`.
#[derive(Clone)]
pub struct ChunkFetcher {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    decoder: AudioDecoder,
}

impl ChunkFetcher {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, decoder: AudioDecoder) -> Self {
        Self {
            synthesizer,
            decoder,
        }
    }

    pub fn decoder(&self) -> &AudioDecoder {
        &self.decoder
    }

    pub async fn fetch(&self, text: &str) -> Option<AudioAsset> {
        let raw = match self.synthesizer.synthesize(text).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                log::warn!("Speech synthesis failed: {}", ApiError::NoVoiceData);
                return None;
            }
            Err(ApiError::RateLimited) => {
                log::warn!("Speech synthesis rate limited, not retrying");
                return None;
            }
            Err(e) => {
                log::warn!("Speech synthesis failed: {}", e);
                return None;
            }
        };

        match self.decoder.decode(&raw) {
            Ok(asset) => Some(asset),
            Err(e) => {
                log::warn!("Failed to decode synthesized audio: {}", e);
                None
            }
        }
    }
}
