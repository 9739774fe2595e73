//! Decoding of synthesized speech into playable PCM buffers
//!
//! The voice service answers with raw 16-bit little-endian PCM (or, from
//! some backends, a WAV container). All decoding goes through one shared
//! [`DecodingContext`] so that a process never holds more than one.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;

/// Sample rate of the voice service's PCM output.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("No audio data in payload")]
    Empty,
    #[error("Malformed PCM payload: {0}")]
    Malformed(String),
    #[error("Unsupported audio encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("Expected {expected_rate} Hz / {expected_channels} ch audio, got {rate} Hz / {channels} ch")]
    FormatMismatch {
        expected_rate: u32,
        expected_channels: u16,
        rate: u32,
        channels: u16,
    },
}

/// A decoded, read-only PCM buffer.
///
/// Samples are interleaved `f32` in `[-1.0, 1.0]`. Cloning shares the
/// underlying buffer.
#[derive(Debug, Clone)]
pub struct AudioAsset {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioAsset {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Silent buffer of the given length, handy for tests.
    pub fn silence(duration: Duration, sample_rate: u32, channels: u16) -> Self {
        let frames = (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize;
        Self::new(vec![0.0; frames * usize::from(channels.max(1))], sample_rate, channels)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn shared_samples(&self) -> Arc<[f32]> {
        Arc::clone(&self.samples)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.sample_rate))
    }
}

/// Sample rate and channel layout a decoder accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
        }
    }
}

/// The process-wide decoding context.
///
/// Obtained with [`DecodingContext::acquire`]; the first caller creates it
/// and it is released when the last handle drops. It may be suspended
/// (nothing audible depends on it) and decoding still works.
#[derive(Debug)]
pub struct DecodingContext {
    suspended: AtomicBool,
    decoded: AtomicUsize,
}

fn shared_slot() -> &'static Mutex<Weak<DecodingContext>> {
    static SLOT: OnceLock<Mutex<Weak<DecodingContext>>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(Weak::new()))
}

impl DecodingContext {
    /// Return the live context, creating it if none exists.
    pub fn acquire() -> Arc<Self> {
        let mut slot = shared_slot().lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ctx) = slot.upgrade() {
            return ctx;
        }

        let ctx = Arc::new(Self {
            suspended: AtomicBool::new(true),
            decoded: AtomicUsize::new(0),
        });
        *slot = Arc::downgrade(&ctx);
        log::debug!("Created shared decoding context");
        ctx
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    /// Number of payloads decoded through this context.
    pub fn decoded_count(&self) -> usize {
        self.decoded.load(Ordering::SeqCst)
    }
}

/// Turns synthesized audio payloads into [`AudioAsset`]s.
#[derive(Debug, Clone)]
pub struct AudioDecoder {
    context: Arc<DecodingContext>,
    format: AudioFormat,
}

impl AudioDecoder {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            context: DecodingContext::acquire(),
            format,
        }
    }

    pub fn context(&self) -> &Arc<DecodingContext> {
        &self.context
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Decode a WAV container or raw 16-bit little-endian PCM.
    pub fn decode(&self, raw: &[u8]) -> Result<AudioAsset, DecodeError> {
        if raw.is_empty() {
            return Err(DecodeError::Empty);
        }
        if self.format.channels == 0 {
            return Err(DecodeError::UnsupportedEncoding("zero channels".to_string()));
        }

        let samples = if raw.starts_with(b"RIFF") {
            self.decode_wav(raw)?
        } else {
            self.decode_pcm16(raw)?
        };

        if samples.is_empty() {
            return Err(DecodeError::Empty);
        }

        self.context.decoded.fetch_add(1, Ordering::SeqCst);
        let asset = AudioAsset::new(samples, self.format.sample_rate, self.format.channels);
        log::debug!(
            "Decoded {} bytes into {:.2}s of audio",
            raw.len(),
            asset.duration().as_secs_f64()
        );
        Ok(asset)
    }

    fn decode_pcm16(&self, raw: &[u8]) -> Result<Vec<f32>, DecodeError> {
        let frame_bytes = 2 * usize::from(self.format.channels);
        if raw.len() % frame_bytes != 0 {
            return Err(DecodeError::Malformed(format!(
                "{} bytes is not a whole number of {}-byte frames",
                raw.len(),
                frame_bytes
            )));
        }

        Ok(raw
            .chunks_exact(2)
            .map(|pair| pcm16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
            .collect())
    }

    fn decode_wav(&self, raw: &[u8]) -> Result<Vec<f32>, DecodeError> {
        let reader = hound::WavReader::new(Cursor::new(raw))
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let spec = reader.spec();

        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(DecodeError::UnsupportedEncoding(format!(
                "{:?} {}-bit",
                spec.sample_format, spec.bits_per_sample
            )));
        }
        if spec.sample_rate != self.format.sample_rate || spec.channels != self.format.channels {
            return Err(DecodeError::FormatMismatch {
                expected_rate: self.format.sample_rate,
                expected_channels: self.format.channels,
                rate: spec.sample_rate,
                channels: spec.channels,
            });
        }

        reader
            .into_samples::<i16>()
            .map(|s| s.map(pcm16_to_f32))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

impl Default for AudioDecoder {
    fn default() -> Self {
        Self::new(AudioFormat::default())
    }
}

fn pcm16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}
