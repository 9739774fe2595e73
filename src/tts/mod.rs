//! Segmented narration: splitting, synthesis, decoding and playback

#[cfg(feature = "speaker")]
pub mod audio;
pub mod decoder;
pub mod engine;
pub mod fallback;
pub mod fetcher;
pub mod playlist;
pub mod session;
pub mod splitter;

#[cfg(feature = "speaker")]
pub use audio::RodioOutput;
pub use decoder::{AudioAsset, AudioDecoder, AudioFormat, DecodeError, DecodingContext};
pub use engine::{AudioOutput, ContextState, PlaybackEngine, PlaybackError, SilentOutput, SourceHandle};
pub use fallback::{FallbackNarrator, ProcessVoice, SystemVoice};
pub use fetcher::ChunkFetcher;
pub use playlist::{NarrationStatus, PlaybackState, PlaylistController, PlaylistState, SegmentStatus};
pub use session::NarrationSession;
pub use splitter::split_into_segments;
