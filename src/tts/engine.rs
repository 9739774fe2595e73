//! Playback engine: one output context per result view, one sound source
//! at a time, and wall-clock position tracking for pause.
//!
//! The platform side sits behind [`AudioOutput`]. The device implementation
//! lives in [`crate::tts::audio`]; [`SilentOutput`] only keeps time.

use crate::tts::decoder::AudioAsset;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Audio output is suspended; resume it from a user gesture first")]
    ContextSuspended,
    #[error("Audio output is closed")]
    ContextClosed,
    #[error("Failed to create audio output stream: {0}")]
    StreamError(String),
    #[error("Playback error: {0}")]
    PlaybackError(String),
}

/// Identifies one started sound source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHandle(u64);

impl SourceHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Invoked once when a source reaches its end without being stopped.
pub type FinishedCallback = Box<dyn FnOnce(SourceHandle) + Send + 'static>;

/// Platform-level completion notifier handed to [`AudioOutput::start`].
pub type SourceDone = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Closed,
    Suspended,
    Running,
}

/// The platform audio output context.
///
/// `open` creates the context in the suspended state; `resume` must happen
/// in direct response to user input. `start` may only be called while
/// running, and `done` must fire at most once, only on natural completion.
pub trait AudioOutput {
    fn state(&self) -> ContextState;
    fn open(&mut self) -> Result<(), PlaybackError>;
    fn resume(&mut self) -> Result<(), PlaybackError>;
    fn start(
        &mut self,
        source: SourceHandle,
        asset: &AudioAsset,
        offset: Duration,
        done: SourceDone,
    ) -> Result<(), PlaybackError>;
    fn stop(&mut self, source: SourceHandle);
    fn close(&mut self);
}

struct ActiveSource {
    handle: SourceHandle,
    on_finished: Arc<Mutex<Option<FinishedCallback>>>,
    started_at: Instant,
    start_offset: Duration,
    duration: Duration,
}

impl ActiveSource {
    fn detach(&self) -> bool {
        self.on_finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}

pub struct PlaybackEngine<O: AudioOutput> {
    output: O,
    next_id: u64,
    active: Option<ActiveSource>,
}

impl<O: AudioOutput> PlaybackEngine<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            next_id: 0,
            active: None,
        }
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    pub fn context_state(&self) -> ContextState {
        self.output.state()
    }

    /// Open the output context if needed and resume it.
    ///
    /// Call this synchronously from the user-gesture handler, before any
    /// await point, so platform autoplay rules allow the resume.
    pub fn unlock(&mut self) -> Result<(), PlaybackError> {
        if self.output.state() == ContextState::Closed {
            self.output.open()?;
        }
        if self.output.state() != ContextState::Running {
            self.output.resume()?;
        }
        Ok(())
    }

    /// Start `asset` at `offset`. The previous source, if any, must already
    /// be stopped by the caller.
    pub fn play(
        &mut self,
        asset: &AudioAsset,
        offset: Duration,
        on_finished: FinishedCallback,
    ) -> Result<SourceHandle, PlaybackError> {
        match self.output.state() {
            ContextState::Running => {}
            ContextState::Suspended => return Err(PlaybackError::ContextSuspended),
            ContextState::Closed => return Err(PlaybackError::ContextClosed),
        }
        if let Some(prev) = &self.active {
            log::warn!("Starting a source while {:?} is still active", prev.handle);
        }

        let duration = asset.duration();
        let offset = offset.min(duration);
        self.next_id += 1;
        let handle = SourceHandle(self.next_id);

        let on_finished = Arc::new(Mutex::new(Some(on_finished)));
        let slot = Arc::clone(&on_finished);
        let done: SourceDone = Box::new(move || {
            let callback = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(callback) = callback {
                callback(handle);
            }
        });

        self.output.start(handle, asset, offset, done)?;
        log::debug!("Started {:?} at {:.2}s of {:.2}s", handle, offset.as_secs_f64(), duration.as_secs_f64());

        self.active = Some(ActiveSource {
            handle,
            on_finished,
            started_at: Instant::now(),
            start_offset: offset,
            duration,
        });
        Ok(handle)
    }

    /// Stop a source. The completion callback is detached first so a stop
    /// is never reported as a natural end. Unknown or already stopped
    /// handles are ignored.
    pub fn stop(&mut self, handle: SourceHandle) {
        match self.active.take() {
            Some(active) if active.handle == handle => {
                active.detach();
                self.output.stop(handle);
                log::debug!("Stopped {:?}", handle);
            }
            other => self.active = other,
        }
    }

    /// Forget a source that ended on its own.
    pub fn release(&mut self, handle: SourceHandle) -> bool {
        match self.active.take() {
            Some(active) if active.handle == handle => true,
            other => {
                self.active = other;
                false
            }
        }
    }

    pub fn active_source(&self) -> Option<SourceHandle> {
        self.active.as_ref().map(|a| a.handle)
    }

    /// Current position inside the active source.
    pub fn elapsed(&self) -> Duration {
        self.active
            .as_ref()
            .map(|a| (a.start_offset + a.started_at.elapsed()).min(a.duration))
            .unwrap_or_default()
    }

    /// Stop any active source and close the output context.
    pub fn close(&mut self) {
        if let Some(handle) = self.active_source() {
            self.stop(handle);
        }
        if self.output.state() != ContextState::Closed {
            self.output.close();
            log::info!("Audio output closed");
        }
    }
}

impl<O: AudioOutput> Drop for PlaybackEngine<O> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Output that plays nothing and only keeps time.
///
/// Used when no audio device is available. `start` needs a tokio runtime.
#[derive(Default)]
pub struct SilentOutput {
    state: Option<ContextState>,
    timers: HashMap<SourceHandle, tokio::task::JoinHandle<()>>,
}

impl SilentOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioOutput for SilentOutput {
    fn state(&self) -> ContextState {
        self.state.unwrap_or(ContextState::Closed)
    }

    fn open(&mut self) -> Result<(), PlaybackError> {
        self.state = Some(ContextState::Suspended);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PlaybackError> {
        match self.state() {
            ContextState::Closed => Err(PlaybackError::ContextClosed),
            _ => {
                self.state = Some(ContextState::Running);
                Ok(())
            }
        }
    }

    fn start(
        &mut self,
        source: SourceHandle,
        asset: &AudioAsset,
        offset: Duration,
        done: SourceDone,
    ) -> Result<(), PlaybackError> {
        let remaining = asset.duration().saturating_sub(offset);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            done();
        });
        self.timers.retain(|_, t| !t.is_finished());
        self.timers.insert(source, timer);
        Ok(())
    }

    fn stop(&mut self, source: SourceHandle) {
        if let Some(timer) = self.timers.remove(&source) {
            timer.abort();
        }
    }

    fn close(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        self.state = Some(ContextState::Closed);
    }
}
