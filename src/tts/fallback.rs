//! Fallback narration through the platform's built-in speech voice
//!
//! Used when the remote voice service could not produce any audio for the
//! current narration. Reports the same [`NarrationStatus`] shape as the
//! segment playlist so the view does not care which engine is active.

use crate::tts::playlist::NarrationStatus;
use async_trait::async_trait;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Longest wait for the voice list to appear before speaking anyway.
pub const VOICE_LIST_WAIT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("Failed to start system voice: {0}")]
    SpawnError(String),
    #[error("System voice unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemVoiceInfo {
    pub name: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    pub language: String,
    pub voice: Option<String>,
}

pub type UtteranceEnd = Box<dyn FnOnce() + Send + 'static>;

/// Platform speech synthesis.
///
/// The voice list may be populated some time after startup;
/// `voices_ready` resolves once it is non-empty.
#[async_trait]
pub trait SystemVoice: Send + Sync {
    fn voices(&self) -> Vec<SystemVoiceInfo>;
    async fn voices_ready(&self);
    fn speak(&self, utterance: Utterance, on_end: UtteranceEnd) -> Result<(), FallbackError>;
    fn pause(&self);
    fn resume(&self);
    fn cancel(&self);
}

/// Pick the first voice whose language matches the hint's primary subtag.
fn pick_voice(voices: &[SystemVoiceInfo], language: &str) -> Option<String> {
    let wanted = language.split(['-', '_']).next().unwrap_or(language).to_lowercase();
    voices
        .iter()
        .find(|v| v.language.to_lowercase() == language.to_lowercase())
        .or_else(|| {
            voices.iter().find(|v| {
                v.language
                    .split(['-', '_'])
                    .next()
                    .is_some_and(|primary| primary.eq_ignore_ascii_case(&wanted))
            })
        })
        .map(|v| v.name.clone())
}

pub struct FallbackNarrator {
    voice: Arc<dyn SystemVoice>,
    status: Arc<watch::Sender<NarrationStatus>>,
    utterance: Arc<AtomicU64>,
    voice_wait: Duration,
}

impl FallbackNarrator {
    pub fn new(voice: Arc<dyn SystemVoice>) -> Self {
        Self::with_voice_wait(voice, VOICE_LIST_WAIT)
    }

    pub fn with_voice_wait(voice: Arc<dyn SystemVoice>, voice_wait: Duration) -> Self {
        let (status, _) = watch::channel(NarrationStatus::Finished);
        Self {
            voice,
            status: Arc::new(status),
            utterance: Arc::new(AtomicU64::new(0)),
            voice_wait,
        }
    }

    pub fn status(&self) -> NarrationStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NarrationStatus> {
        self.status.subscribe()
    }

    /// Speak `text` from the start, replacing anything already spoken.
    ///
    /// With an empty voice list the request is deferred once until the list
    /// shows up or [`VOICE_LIST_WAIT`] passes, then spoken regardless.
    /// Deferral needs a tokio runtime.
    pub fn speak(&self, text: &str, language_hint: &str) {
        self.voice.cancel();
        let id = self.utterance.fetch_add(1, Ordering::SeqCst) + 1;
        let utterance = Utterance {
            text: text.to_string(),
            language: language_hint.to_string(),
            voice: None,
        };

        if !self.voice.voices().is_empty() {
            start_utterance(&self.voice, &self.status, &self.utterance, id, utterance);
            return;
        }

        log::debug!("No system voices yet, deferring speech");
        self.status.send_replace(NarrationStatus::Loading);
        let voice = Arc::clone(&self.voice);
        let status = Arc::clone(&self.status);
        let current = Arc::clone(&self.utterance);
        let wait = self.voice_wait;
        tokio::spawn(async move {
            if tokio::time::timeout(wait, voice.voices_ready()).await.is_err() {
                log::warn!("System voice list still empty after {:?}", wait);
            }
            if current.load(Ordering::SeqCst) == id {
                start_utterance(&voice, &status, &current, id, utterance);
            }
        });
    }

    pub fn pause(&self) {
        if self.status() == NarrationStatus::Playing {
            self.voice.pause();
            self.status.send_replace(NarrationStatus::Paused);
        }
    }

    pub fn resume(&self) {
        if self.status() == NarrationStatus::Paused {
            self.voice.resume();
            self.status.send_replace(NarrationStatus::Playing);
        }
    }

    pub fn toggle(&self) {
        match self.status() {
            NarrationStatus::Playing => self.pause(),
            NarrationStatus::Paused => self.resume(),
            _ => {}
        }
    }

    /// Stop speaking and drop any deferred request.
    pub fn cancel(&self) {
        self.utterance.fetch_add(1, Ordering::SeqCst);
        self.voice.cancel();
        self.status.send_replace(NarrationStatus::Finished);
    }
}

fn start_utterance(
    voice: &Arc<dyn SystemVoice>,
    status: &Arc<watch::Sender<NarrationStatus>>,
    current: &Arc<AtomicU64>,
    id: u64,
    mut utterance: Utterance,
) {
    utterance.voice = pick_voice(&voice.voices(), &utterance.language);

    let end_status = Arc::clone(status);
    let end_current = Arc::clone(current);
    let on_end: UtteranceEnd = Box::new(move || {
        if end_current.load(Ordering::SeqCst) == id {
            end_status.send_replace(NarrationStatus::Finished);
        }
    });

    // Mark playing first; a voice may finish synchronously inside `speak`.
    status.send_replace(NarrationStatus::Playing);
    if let Err(e) = voice.speak(utterance, on_end) {
        log::warn!("System voice failed: {}", e);
        status.send_replace(NarrationStatus::Unavailable);
    }
}

// ============================================================================
// espeak-ng process voice
// ============================================================================

struct Speaking {
    generation: u64,
    child: Option<Child>,
    utterance: Utterance,
    on_end: Option<UtteranceEnd>,
}

/// [`SystemVoice`] backed by the `espeak-ng` command-line synthesizer.
///
/// The voice list is read on a background thread at construction. A child
/// process cannot be suspended portably, so pausing ends the process and
/// resuming speaks the utterance again from its start.
pub struct ProcessVoice {
    program: String,
    voices: Arc<Mutex<Vec<SystemVoiceInfo>>>,
    voices_rx: watch::Receiver<usize>,
    current: Arc<Mutex<Option<Speaking>>>,
    generation: AtomicU64,
}

impl ProcessVoice {
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        let voices = Arc::new(Mutex::new(Vec::new()));
        let (voices_tx, voices_rx) = watch::channel(0usize);

        let list_program = program.clone();
        let list = Arc::clone(&voices);
        thread::spawn(move || {
            let found = list_voices(&list_program);
            log::debug!("{} reports {} voices", list_program, found.len());
            let count = found.len();
            *list.lock().unwrap_or_else(PoisonError::into_inner) = found;
            let _ = voices_tx.send(count);
        });

        Self {
            program,
            voices,
            voices_rx,
            current: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    fn spawn_child(&self, utterance: &Utterance) -> Result<Child, FallbackError> {
        let voice = utterance.voice.as_deref().unwrap_or(&utterance.language);
        let mut command = Command::new(&self.program);
        if !voice.is_empty() {
            command.arg("-v").arg(voice);
        }
        command
            .arg(&utterance.text)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| FallbackError::SpawnError(e.to_string()))
    }

    fn watch_child(&self, generation: u64) {
        let current = Arc::clone(&self.current);
        thread::spawn(move || loop {
            thread::sleep(Duration::from_millis(50));
            let mut guard = current.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(speaking) = guard.as_mut().filter(|s| s.generation == generation) else {
                return;
            };
            // Paused: the child is gone but the utterance may resume.
            let Some(child) = speaking.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(None) => continue,
                Ok(Some(_)) | Err(_) => {
                    let on_end = speaking.on_end.take();
                    *guard = None;
                    drop(guard);
                    if let Some(on_end) = on_end {
                        on_end();
                    }
                    return;
                }
            }
        });
    }
}

fn list_voices(program: &str) -> Vec<SystemVoiceInfo> {
    let output = match Command::new(program).arg("--voices").stderr(Stdio::null()).output() {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            log::warn!("{} --voices exited with {}", program, output.status);
            return Vec::new();
        }
        Err(e) => {
            log::warn!("Could not run {}: {}", program, e);
            return Vec::new();
        }
    };

    // Columns: Pty Language Age/Gender VoiceName File Other-Languages
    BufReader::new(output.stdout.as_slice())
        .lines()
        .map_while(Result::ok)
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            Some(SystemVoiceInfo {
                language: cols.get(1)?.to_string(),
                name: cols.get(3)?.to_string(),
            })
        })
        .collect()
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[async_trait]
impl SystemVoice for ProcessVoice {
    fn voices(&self) -> Vec<SystemVoiceInfo> {
        self.voices.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn voices_ready(&self) {
        let mut rx = self.voices_rx.clone();
        let _ = rx.wait_for(|count| *count > 0).await;
    }

    fn speak(&self, utterance: Utterance, on_end: UtteranceEnd) -> Result<(), FallbackError> {
        self.cancel();
        let child = self.spawn_child(&utterance)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Speaking {
            generation,
            child: Some(child),
            utterance,
            on_end: Some(on_end),
        });
        self.watch_child(generation);
        Ok(())
    }

    fn pause(&self) {
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut child) = guard.as_mut().and_then(|s| s.child.take()) {
            kill(&mut child);
        }
    }

    fn resume(&self) {
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(speaking) = guard.as_mut() else {
            return;
        };
        if speaking.child.is_some() {
            return;
        }
        match self.spawn_child(&speaking.utterance) {
            Ok(child) => speaking.child = Some(child),
            Err(e) => log::warn!("Could not resume system voice: {}", e),
        }
    }

    fn cancel(&self) {
        let taken = self.current.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut child) = taken.and_then(|s| s.child) {
            kill(&mut child);
        }
    }
}

impl Drop for ProcessVoice {
    fn drop(&mut self) {
        self.cancel();
    }
}
