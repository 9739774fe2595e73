//! Segment playlist controller
//!
//! Sequences narration segments into continuous playback:
//!
//! ```text
//!   Idle ──toggle──▶ AwaitingLoad(i) ──ready──▶ Playing(i) ──end──▶ AwaitingLoad(i+1)
//!                        │   ▲                     │  ▲                    │
//!                      error │                 pause  resume          exhausted
//!                        ▼   │                     ▼  │                    ▼
//!                   AwaitingLoad(i+1)           Paused(i, t)            Finished
//! ```
//!
//! Fetch results and end-of-source notifications arrive as
//! [`PlaylistMessage`]s on a channel and are applied by [`PlaylistController::handle`].
//! Every message carries the generation it was issued under; a reset bumps
//! the generation so late results from an earlier landmark are dropped.

use crate::tts::decoder::AudioAsset;
use crate::tts::engine::{AudioOutput, PlaybackEngine, SourceHandle};
use crate::tts::splitter::split_into_segments;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Pending,
    Loading,
    Ready,
    Error,
}

/// One span of narration and its audio once loaded.
#[derive(Debug, Clone)]
pub struct Segment {
    text: String,
    asset: Option<AudioAsset>,
    status: SegmentStatus,
}

impl Segment {
    fn new(text: String) -> Self {
        Self {
            text,
            asset: None,
            status: SegmentStatus::Pending,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn status(&self) -> SegmentStatus {
        self.status
    }

    pub fn asset(&self) -> Option<&AudioAsset> {
        self.asset.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistState {
    Idle,
    AwaitingLoad(usize),
    Playing(usize),
    Paused { index: usize, offset: Duration },
    Finished,
}

/// What the result view shows for narration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrationStatus {
    Loading,
    Playing,
    Paused,
    Unavailable,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackState {
    pub current_index: usize,
    pub is_playing: bool,
    pub paused_offset: Duration,
    pub active_source: Option<SourceHandle>,
}

#[derive(Debug, Clone)]
pub enum PlaylistEvent {
    SegmentReady { index: usize, asset: AudioAsset },
    SegmentError { index: usize },
    PlaybackEnded { source: SourceHandle },
}

#[derive(Debug, Clone)]
pub struct PlaylistMessage {
    pub generation: u64,
    pub event: PlaylistEvent,
}

/// A request to synthesize one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub generation: u64,
    pub index: usize,
    pub text: String,
}

/// Starts segment fetches on behalf of the controller.
///
/// Results are expected back as `SegmentReady`/`SegmentError` messages
/// tagged with the request's generation.
pub trait FetchDispatch {
    fn dispatch(&mut self, request: FetchRequest);

    /// Drop interest in every outstanding request.
    fn cancel_all(&mut self) {}
}

pub struct PlaylistController<O: AudioOutput, D: FetchDispatch> {
    engine: PlaybackEngine<O>,
    dispatcher: D,
    events: UnboundedSender<PlaylistMessage>,
    segments: Vec<Segment>,
    state: PlaylistState,
    playback: PlaybackState,
    generation: u64,
    audio_unavailable: bool,
    played_any: bool,
}

impl<O: AudioOutput, D: FetchDispatch> PlaylistController<O, D> {
    pub fn new(engine: PlaybackEngine<O>, dispatcher: D, events: UnboundedSender<PlaylistMessage>) -> Self {
        Self {
            engine,
            dispatcher,
            events,
            segments: Vec::new(),
            state: PlaylistState::Idle,
            playback: PlaybackState::default(),
            generation: 0,
            audio_unavailable: false,
            played_any: false,
        }
    }

    pub fn state(&self) -> PlaylistState {
        self.state
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn engine(&self) -> &PlaybackEngine<O> {
        &self.engine
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Set when the first segment could not be produced before anything played.
    pub fn is_audio_unavailable(&self) -> bool {
        self.audio_unavailable
    }

    pub fn has_played(&self) -> bool {
        self.played_any
    }

    pub fn status(&self) -> NarrationStatus {
        match self.state {
            PlaylistState::Playing(_) => NarrationStatus::Playing,
            PlaylistState::Paused { .. } => NarrationStatus::Paused,
            PlaylistState::AwaitingLoad(_) => NarrationStatus::Loading,
            PlaylistState::Finished if self.audio_unavailable && !self.played_any => {
                NarrationStatus::Unavailable
            }
            PlaylistState::Finished => NarrationStatus::Finished,
            PlaylistState::Idle if self.audio_unavailable => NarrationStatus::Unavailable,
            PlaylistState::Idle => match self.segments.first().map(Segment::status) {
                Some(SegmentStatus::Ready) => NarrationStatus::Paused,
                Some(_) => NarrationStatus::Loading,
                None => NarrationStatus::Finished,
            },
        }
    }

    /// Replace the narration. Splits it and starts loading the first segment
    /// so it is ready by the time the user presses play.
    pub fn load(&mut self, narration: &str) {
        self.reset();
        self.segments = split_into_segments(narration)
            .into_iter()
            .map(Segment::new)
            .collect();

        if self.segments.is_empty() {
            log::info!("Narration is empty, audio unavailable");
            self.audio_unavailable = true;
            self.state = PlaylistState::Finished;
            return;
        }

        log::debug!("Narration split into {} segments", self.segments.len());
        self.request(0);
    }

    /// Play/pause from a user gesture.
    ///
    /// The output context is resumed before anything else so the resume
    /// happens inside the gesture's synchronous handler.
    pub fn toggle(&mut self) {
        match self.state {
            PlaylistState::Idle => {
                self.unlock();
                if self.segments.is_empty() {
                    self.state = PlaylistState::Finished;
                    return;
                }
                self.state = PlaylistState::AwaitingLoad(0);
                self.settle();
            }
            PlaylistState::Playing(index) => self.pause(index),
            PlaylistState::Paused { index, offset } => {
                self.unlock();
                self.enter_playing(index, offset);
            }
            PlaylistState::AwaitingLoad(_) | PlaylistState::Finished => {}
        }
    }

    /// Apply one message from the event channel.
    pub fn handle(&mut self, message: PlaylistMessage) {
        if message.generation != self.generation {
            log::debug!(
                "Ignoring {:?} from generation {} (current {})",
                message.event,
                message.generation,
                self.generation
            );
            return;
        }

        match message.event {
            PlaylistEvent::SegmentReady { index, asset } => {
                let Some(segment) = self.segments.get_mut(index) else {
                    return;
                };
                if segment.status != SegmentStatus::Loading {
                    log::debug!("Segment {} ready in state {:?}, ignoring", index, segment.status);
                    return;
                }
                segment.asset = Some(asset);
                segment.status = SegmentStatus::Ready;
                if self.state == PlaylistState::AwaitingLoad(index) {
                    self.settle();
                }
            }
            PlaylistEvent::SegmentError { index } => {
                let Some(segment) = self.segments.get_mut(index) else {
                    return;
                };
                if segment.status != SegmentStatus::Loading {
                    return;
                }
                segment.asset = None;
                segment.status = SegmentStatus::Error;
                if index == 0 && !self.played_any {
                    log::warn!("First narration segment failed, audio unavailable");
                    self.audio_unavailable = true;
                } else {
                    log::warn!("Skipping narration segment {}", index);
                }
                if self.state == PlaylistState::AwaitingLoad(index) {
                    self.settle();
                }
            }
            PlaylistEvent::PlaybackEnded { source } => {
                let PlaylistState::Playing(index) = self.state else {
                    return;
                };
                if self.playback.active_source != Some(source) {
                    log::debug!("Ignoring end of stale source {:?}", source);
                    return;
                }
                self.engine.release(source);
                self.playback.active_source = None;
                self.playback.is_playing = false;
                self.playback.paused_offset = Duration::ZERO;
                self.advance_from(index);
            }
        }
    }

    /// Forget the current narration and release the output context.
    /// Late fetch results and end notifications issued before the reset
    /// are ignored afterwards. The next gesture opens a fresh context.
    pub fn reset(&mut self) {
        self.stop_active();
        self.engine.close();
        self.dispatcher.cancel_all();
        self.generation += 1;
        self.segments.clear();
        self.state = PlaylistState::Idle;
        self.playback = PlaybackState::default();
        self.audio_unavailable = false;
        self.played_any = false;
    }

    /// Teardown on exit. Same as [`reset`](Self::reset).
    pub fn close(&mut self) {
        self.reset();
    }

    fn unlock(&mut self) {
        if let Err(e) = self.engine.unlock() {
            log::warn!("Could not resume audio output: {}", e);
        }
    }

    fn request(&mut self, index: usize) {
        let Some(segment) = self.segments.get_mut(index) else {
            return;
        };
        if segment.status != SegmentStatus::Pending {
            return;
        }
        segment.status = SegmentStatus::Loading;
        self.dispatcher.dispatch(FetchRequest {
            generation: self.generation,
            index,
            text: segment.text.clone(),
        });
    }

    /// Resolve `AwaitingLoad` as far as current segment statuses allow.
    fn settle(&mut self) {
        while let PlaylistState::AwaitingLoad(index) = self.state {
            match self.segments[index].status {
                SegmentStatus::Pending => {
                    self.request(index);
                    return;
                }
                SegmentStatus::Loading => return,
                SegmentStatus::Ready => {
                    self.enter_playing(index, Duration::ZERO);
                    return;
                }
                SegmentStatus::Error => {
                    if index + 1 < self.segments.len() {
                        self.state = PlaylistState::AwaitingLoad(index + 1);
                    } else {
                        self.finish();
                    }
                }
            }
        }
    }

    fn enter_playing(&mut self, index: usize, offset: Duration) {
        self.stop_active();

        let Some(asset) = self.segments[index].asset.clone() else {
            self.segments[index].status = SegmentStatus::Error;
            self.state = PlaylistState::AwaitingLoad(index);
            self.settle();
            return;
        };

        let events = self.events.clone();
        let generation = self.generation;
        let on_finished = Box::new(move |source| {
            let _ = events.send(PlaylistMessage {
                generation,
                event: PlaylistEvent::PlaybackEnded { source },
            });
        });

        match self.engine.play(&asset, offset, on_finished) {
            Ok(source) => {
                log::debug!("Playing segment {} from {:.2}s", index, offset.as_secs_f64());
                self.state = PlaylistState::Playing(index);
                self.playback = PlaybackState {
                    current_index: index,
                    is_playing: true,
                    paused_offset: Duration::ZERO,
                    active_source: Some(source),
                };
                self.played_any = true;
                self.request(index + 1);
            }
            Err(e) => {
                // Wait for the next gesture to try again.
                log::warn!("Cannot start segment {}: {}", index, e);
                self.pause_at(index, offset);
            }
        }
    }

    fn pause(&mut self, index: usize) {
        let offset = self.engine.elapsed();
        self.stop_active();
        self.pause_at(index, offset);
        log::debug!("Paused segment {} at {:.2}s", index, offset.as_secs_f64());
    }

    fn pause_at(&mut self, index: usize, offset: Duration) {
        self.state = PlaylistState::Paused { index, offset };
        self.playback.current_index = index;
        self.playback.is_playing = false;
        self.playback.paused_offset = offset;
    }

    fn advance_from(&mut self, index: usize) {
        if index + 1 < self.segments.len() {
            self.state = PlaylistState::AwaitingLoad(index + 1);
            self.settle();
        } else {
            self.finish();
        }
    }

    fn finish(&mut self) {
        log::info!("Narration finished");
        self.state = PlaylistState::Finished;
        self.playback.is_playing = false;
    }

    fn stop_active(&mut self) {
        if let Some(source) = self.playback.active_source.take() {
            self.engine.stop(source);
        }
        self.playback.is_playing = false;
    }
}
