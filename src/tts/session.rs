//! Narration session: drives the playlist controller from its event channel
//! and hands over to the fallback narrator when no audio can be produced.

use crate::tts::engine::{AudioOutput, PlaybackEngine};
use crate::tts::fallback::FallbackNarrator;
use crate::tts::fetcher::ChunkFetcher;
use crate::tts::playlist::{
    FetchDispatch, FetchRequest, NarrationStatus, PlaybackState, PlaylistController, PlaylistEvent,
    PlaylistMessage, PlaylistState,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Runs each fetch request as its own tokio task.
pub struct TaskDispatcher {
    fetcher: ChunkFetcher,
    events: UnboundedSender<PlaylistMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl TaskDispatcher {
    pub fn new(fetcher: ChunkFetcher, events: UnboundedSender<PlaylistMessage>) -> Self {
        Self {
            fetcher,
            events,
            tasks: Vec::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }
}

impl FetchDispatch for TaskDispatcher {
    fn dispatch(&mut self, request: FetchRequest) {
        self.tasks.retain(|t| !t.is_finished());

        let fetcher = self.fetcher.clone();
        let events = self.events.clone();
        log::debug!("Fetching segment {} ({} chars)", request.index, request.text.len());
        self.tasks.push(tokio::spawn(async move {
            let event = match fetcher.fetch(&request.text).await {
                Some(asset) => PlaylistEvent::SegmentReady {
                    index: request.index,
                    asset,
                },
                None => PlaylistEvent::SegmentError {
                    index: request.index,
                },
            };
            let _ = events.send(PlaylistMessage {
                generation: request.generation,
                event,
            });
        }));
    }

    fn cancel_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TaskDispatcher {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Narration for one result view.
///
/// Must be created and driven inside a tokio runtime. Call
/// [`next_event`](Self::next_event) in a loop to apply fetch results and
/// end-of-segment notifications; each call yields the status afterwards.
pub struct NarrationSession<O: AudioOutput> {
    controller: PlaylistController<O, TaskDispatcher>,
    events: UnboundedReceiver<PlaylistMessage>,
    fallback: Option<FallbackNarrator>,
    fallback_status: Option<watch::Receiver<NarrationStatus>>,
    fallback_active: bool,
    narration: String,
    language: String,
}

impl<O: AudioOutput> NarrationSession<O> {
    pub fn new(output: O, fetcher: ChunkFetcher, fallback: Option<FallbackNarrator>) -> Self {
        let (tx, rx) = unbounded_channel();
        let dispatcher = TaskDispatcher::new(fetcher, tx.clone());
        let fallback_status = fallback.as_ref().map(FallbackNarrator::subscribe);
        Self {
            controller: PlaylistController::new(PlaybackEngine::new(output), dispatcher, tx),
            events: rx,
            fallback,
            fallback_status,
            fallback_active: false,
            narration: String::new(),
            language: String::new(),
        }
    }

    pub fn controller(&self) -> &PlaylistController<O, TaskDispatcher> {
        &self.controller
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.controller.playback_state()
    }

    pub fn is_fallback_active(&self) -> bool {
        self.fallback_active
    }

    pub fn status(&self) -> NarrationStatus {
        match &self.fallback {
            Some(fallback) if self.fallback_active => fallback.status(),
            _ => self.controller.status(),
        }
    }

    /// Start narrating a new landmark. The first segment begins loading
    /// right away; playback waits for [`toggle_playback`](Self::toggle_playback).
    pub fn load(&mut self, narration: &str, language: &str) {
        self.stop_fallback();
        self.narration = narration.to_string();
        self.language = language.to_string();
        self.controller.load(narration);
    }

    /// The play/pause gesture.
    pub fn toggle_playback(&mut self) {
        if self.fallback_active {
            if let Some(fallback) = &self.fallback {
                fallback.toggle();
            }
            return;
        }
        self.controller.toggle();
        self.maybe_fallback();
    }

    /// Drop the current narration and release the output context.
    pub fn reset(&mut self) {
        self.stop_fallback();
        self.narration.clear();
        self.controller.reset();
    }

    /// Wait for the next state change and return the resulting status.
    ///
    /// Returns `None` once the active event source has closed.
    pub async fn next_event(&mut self) -> Option<NarrationStatus> {
        if self.fallback_active {
            let status = self.fallback_status.as_mut()?;
            status.changed().await.ok()?;
            let current = *status.borrow_and_update();
            return Some(current);
        }

        let message = self.events.recv().await?;
        self.controller.handle(message);
        self.maybe_fallback();
        Some(self.status())
    }

    /// Tear down: stop sound, abandon fetches and release the output.
    pub fn close(&mut self) {
        self.stop_fallback();
        self.controller.close();
    }

    fn maybe_fallback(&mut self) {
        let Some(fallback) = &self.fallback else {
            return;
        };
        if self.fallback_active
            || self.controller.state() != PlaylistState::Finished
            || !self.controller.is_audio_unavailable()
            || self.controller.has_played()
            || self.narration.trim().is_empty()
        {
            return;
        }

        log::info!("No narration audio available, switching to the system voice");
        self.fallback_active = true;
        fallback.speak(&self.narration, &self.language);
        if let Some(status) = self.fallback_status.as_mut() {
            status.borrow_and_update();
        }
    }

    fn stop_fallback(&mut self) {
        if !self.fallback_active {
            return;
        }
        self.fallback_active = false;
        if let Some(fallback) = &self.fallback {
            fallback.cancel();
        }
        if let Some(status) = self.fallback_status.as_mut() {
            status.borrow_and_update();
        }
    }
}

impl<O: AudioOutput> Drop for NarrationSession<O> {
    fn drop(&mut self) {
        self.stop_fallback();
    }
}
