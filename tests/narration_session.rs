//! Integration tests for segmented narration playback.
//!
//! A scripted synthesizer answers per segment text and a logging output
//! records every start, stop and natural end. Time is paused, so segment
//! durations and pause offsets are exact.
//!
//! # What is tested
//!
//! - Empty narration finishes as unavailable without any fetch
//! - Failed chunks are skipped; only a failed first chunk marks audio unavailable
//! - Pause/resume continues the same chunk from the captured offset
//! - At most one source is ever active
//! - The next chunk is fetched while the current one plays
//! - Reset and close drop late results and release the output

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use landmark_guide_lib::ai::{ApiError, SpeechSynthesizer};
use landmark_guide_lib::tts::engine::{
    AudioOutput, ContextState, PlaybackError, SilentOutput, SourceDone, SourceHandle,
};
use landmark_guide_lib::tts::{
    AudioAsset, AudioDecoder, ChunkFetcher, NarrationSession, NarrationStatus, PlaylistState,
    SegmentStatus,
};

const SAMPLE_RATE: f64 = 24_000.0;

// ── Mock output ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Play { source: SourceHandle, offset: Duration },
    Stop(SourceHandle),
    Ended(SourceHandle),
}

#[derive(Clone, Default)]
struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    fn plays(&self) -> Vec<(SourceHandle, Duration)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Play { source, offset } => Some((source, offset)),
                _ => None,
            })
            .collect()
    }

    /// Every play must come after the previous source stopped or ended.
    fn assert_single_source(&self) {
        let mut active: Option<SourceHandle> = None;
        for call in self.calls() {
            match call {
                Call::Play { source, .. } => {
                    assert_eq!(active, None, "{:?} started while another source was active", source);
                    active = Some(source);
                }
                Call::Stop(source) | Call::Ended(source) => {
                    if active == Some(source) {
                        active = None;
                    }
                }
            }
        }
    }
}

/// Keeps time like the headless output and logs what the engine asks for.
struct LoggingOutput {
    inner: SilentOutput,
    log: CallLog,
}

impl AudioOutput for LoggingOutput {
    fn state(&self) -> ContextState {
        self.inner.state()
    }

    fn open(&mut self) -> Result<(), PlaybackError> {
        self.inner.open()
    }

    fn resume(&mut self) -> Result<(), PlaybackError> {
        self.inner.resume()
    }

    fn start(
        &mut self,
        source: SourceHandle,
        asset: &AudioAsset,
        offset: Duration,
        done: SourceDone,
    ) -> Result<(), PlaybackError> {
        self.log.push(Call::Play { source, offset });
        let log = self.log.clone();
        let done: SourceDone = Box::new(move || {
            log.push(Call::Ended(source));
            done();
        });
        self.inner.start(source, asset, offset, done)
    }

    fn stop(&mut self, source: SourceHandle) {
        self.log.push(Call::Stop(source));
        self.inner.stop(source);
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

// ── Mock synthesizer ───────────────────────────────────────────────

/// Answers with silent PCM of a set length per text; unknown text gets no audio.
#[derive(Default)]
struct ScriptedVoice {
    durations: HashMap<String, Duration>,
    latency: Duration,
    requests: Mutex<Vec<String>>,
}

impl ScriptedVoice {
    fn new(script: &[(&str, Option<u64>)]) -> Self {
        Self {
            durations: script
                .iter()
                .filter_map(|(text, ms)| ms.map(|ms| (text.to_string(), Duration::from_millis(ms))))
                .collect(),
            ..Default::default()
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn requests_for(&self, text: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|t| *t == text).count()
    }

    fn total_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedVoice {
    async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>, ApiError> {
        self.requests.lock().unwrap().push(text.to_string());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.durations.get(text).map(|d| {
            let frames = (d.as_secs_f64() * SAMPLE_RATE).round() as usize;
            vec![0u8; frames * 2]
        }))
    }
}

// ── Helpers ────────────────────────────────────────────────────────

type Session = NarrationSession<LoggingOutput>;

fn session(voice: ScriptedVoice) -> (Session, CallLog, Arc<ScriptedVoice>) {
    let voice = Arc::new(voice);
    let log = CallLog::default();
    let output = LoggingOutput {
        inner: SilentOutput::new(),
        log: log.clone(),
    };
    let fetcher = ChunkFetcher::new(voice.clone(), AudioDecoder::default());
    (NarrationSession::new(output, fetcher, None), log, voice)
}

async fn drive_until(session: &mut Session, done: impl Fn(&Session) -> bool) {
    for _ in 0..64 {
        if done(session) {
            return;
        }
        tokio::time::timeout(Duration::from_secs(60), session.next_event())
            .await
            .expect("no narration event within a minute")
            .expect("event channel closed");
    }
    panic!("narration never reached the expected state");
}

fn state_is(expected: PlaylistState) -> impl Fn(&Session) -> bool {
    move |s: &Session| s.controller().state() == expected
}

fn is_playing(s: &Session) -> bool {
    matches!(s.controller().state(), PlaylistState::Playing(_))
}

const THREE_SENTENCES: &str = "Sentence one. Sentence two. Sentence three.";

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn empty_narration_is_unavailable_without_fetching() {
    let (mut session, log, voice) = session(ScriptedVoice::default());

    session.load(" \n\t ", "en");
    assert_eq!(session.controller().state(), PlaylistState::Finished);
    assert_eq!(session.status(), NarrationStatus::Unavailable);

    session.toggle_playback();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(voice.total_requests(), 0);
    assert!(log.calls().is_empty());
    assert_eq!(session.status(), NarrationStatus::Unavailable);
}

#[tokio::test(start_paused = true)]
async fn missing_last_chunk_is_skipped_silently() {
    let (mut session, log, voice) = session(ScriptedVoice::new(&[
        ("Sentence one.", Some(1_000)),
        ("Sentence two.", Some(1_000)),
        ("Sentence three.", None),
    ]));

    session.load(THREE_SENTENCES, "en");
    assert_eq!(session.controller().segments().len(), 3);
    session.toggle_playback();
    drive_until(&mut session, state_is(PlaylistState::Finished)).await;

    let plays = log.plays();
    assert_eq!(plays.len(), 2);
    assert!(plays.iter().all(|(_, offset)| offset.is_zero()));
    let ended: Vec<_> = log
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Ended(_)))
        .collect();
    assert_eq!(ended, vec![Call::Ended(plays[0].0), Call::Ended(plays[1].0)]);

    assert_eq!(session.controller().segments()[2].status(), SegmentStatus::Error);
    assert!(!session.controller().is_audio_unavailable());
    assert_eq!(session.status(), NarrationStatus::Finished);
    assert_eq!(voice.requests_for("Sentence three."), 1);
    log.assert_single_source();
}

#[tokio::test(start_paused = true)]
async fn failed_first_chunk_starts_at_second_and_is_not_retried() {
    let (mut session, log, voice) = session(ScriptedVoice::new(&[
        ("Sentence one.", None),
        ("Sentence two.", Some(2_000)),
        ("Sentence three.", Some(2_000)),
    ]));

    session.load(THREE_SENTENCES, "en");
    session.toggle_playback();
    drive_until(&mut session, is_playing).await;

    assert_eq!(session.controller().state(), PlaylistState::Playing(1));
    assert_eq!(session.playback_state().current_index, 1);
    assert!(session.controller().is_audio_unavailable());

    drive_until(&mut session, state_is(PlaylistState::Finished)).await;
    assert_eq!(log.plays().len(), 2);
    assert_eq!(voice.requests_for("Sentence one."), 1);
    assert_eq!(session.status(), NarrationStatus::Finished);
    log.assert_single_source();
}

#[tokio::test(start_paused = true)]
async fn failed_single_chunk_never_plays() {
    let (mut session, log, _voice) = session(ScriptedVoice::new(&[("Sentence one.", None)]));

    session.load("Sentence one.", "en");
    drive_until(&mut session, |s| s.controller().is_audio_unavailable()).await;
    assert_eq!(session.status(), NarrationStatus::Unavailable);

    session.toggle_playback();
    assert_eq!(session.controller().state(), PlaylistState::Finished);
    assert_eq!(session.status(), NarrationStatus::Unavailable);
    assert!(log.plays().is_empty());
}

#[tokio::test(start_paused = true)]
async fn pause_then_resume_continues_same_chunk_from_offset() {
    let (mut session, log, _voice) = session(ScriptedVoice::new(&[("Sentence one.", Some(4_000))]));

    session.load("Sentence one.", "en");
    session.toggle_playback();
    drive_until(&mut session, is_playing).await;
    let started = tokio::time::Instant::now();

    tokio::time::advance(Duration::from_millis(1_500)).await;
    session.toggle_playback();
    let PlaylistState::Paused { index, offset } = session.controller().state() else {
        panic!("expected paused, got {:?}", session.controller().state());
    };
    assert_eq!(index, 0);
    assert!((offset.as_secs_f64() - 1.5).abs() < 0.01, "offset {:?}", offset);
    assert_eq!(session.status(), NarrationStatus::Paused);
    assert_eq!(session.playback_state().active_source, None);

    session.toggle_playback();
    assert_eq!(session.controller().state(), PlaylistState::Playing(0));

    let plays = log.plays();
    assert_eq!(plays.len(), 2);
    assert!(plays[0].1.is_zero());
    assert!((plays[1].1.as_secs_f64() - 1.5).abs() < 0.01);
    assert!(log.calls().contains(&Call::Stop(plays[0].0)));

    drive_until(&mut session, state_is(PlaylistState::Finished)).await;
    let total = started.elapsed();
    assert!(total >= Duration::from_millis(3_990) && total <= Duration::from_millis(4_100), "{:?}", total);
    log.assert_single_source();
}

#[tokio::test(start_paused = true)]
async fn next_chunk_is_fetched_while_current_plays() {
    let (mut session, log, voice) = session(
        ScriptedVoice::new(&[
            ("Sentence one.", Some(2_000)),
            ("Sentence two.", Some(2_000)),
            ("Sentence three.", Some(2_000)),
        ])
        .with_latency(Duration::from_millis(300)),
    );

    session.load(THREE_SENTENCES, "en");
    session.toggle_playback();
    drive_until(&mut session, is_playing).await;

    // Requested on entering Playing(0), before any time passes.
    assert_eq!(session.controller().segments()[1].status(), SegmentStatus::Loading);
    tokio::task::yield_now().await;
    assert_eq!(voice.requests_for("Sentence two."), 1);
    assert_eq!(voice.requests_for("Sentence three."), 0);
    assert!(!log.calls().iter().any(|c| matches!(c, Call::Ended(_))));

    drive_until(&mut session, state_is(PlaylistState::Playing(1))).await;
    assert_eq!(session.controller().segments()[2].status(), SegmentStatus::Loading);

    drive_until(&mut session, state_is(PlaylistState::Finished)).await;
    assert_eq!(log.plays().len(), 3);
    assert_eq!(voice.total_requests(), 3);
    log.assert_single_source();
}

#[tokio::test(start_paused = true)]
async fn reset_drops_results_for_the_previous_landmark() {
    let (mut session, log, voice) = session(
        ScriptedVoice::new(&[("Sentence one.", Some(2_000)), ("A different landmark.", None)])
            .with_latency(Duration::from_millis(500)),
    );

    session.load("Sentence one.", "en");
    session.toggle_playback();
    tokio::task::yield_now().await;
    assert_eq!(voice.total_requests(), 1);
    session.reset();
    assert_eq!(session.playback_state(), Default::default());

    session.load("A different landmark.", "en");
    session.toggle_playback();
    drive_until(&mut session, state_is(PlaylistState::Finished)).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(log.plays().is_empty());
    assert_eq!(session.status(), NarrationStatus::Unavailable);
    assert_eq!(voice.total_requests(), 2);
}

#[tokio::test(start_paused = true)]
async fn landmark_change_releases_output_context() {
    let (mut session, log, _voice) = session(ScriptedVoice::new(&[
        ("First landmark sentence.", Some(4_000)),
        ("Second landmark sentence.", Some(1_000)),
    ]));

    session.load("First landmark sentence.", "en");
    session.toggle_playback();
    drive_until(&mut session, is_playing).await;
    let (first, _) = log.plays()[0];
    assert_eq!(session.controller().engine().context_state(), ContextState::Running);

    session.load("Second landmark sentence.", "en");
    assert_eq!(session.controller().engine().context_state(), ContextState::Closed);
    assert_eq!(session.playback_state(), Default::default());
    assert!(log.calls().contains(&Call::Stop(first)));

    session.toggle_playback();
    assert_eq!(session.controller().engine().context_state(), ContextState::Running);
    drive_until(&mut session, state_is(PlaylistState::Finished)).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(log.plays().len(), 2);
    assert!(!log.calls().contains(&Call::Ended(first)));
    assert_eq!(session.status(), NarrationStatus::Finished);

    session.reset();
    assert_eq!(session.controller().engine().context_state(), ContextState::Closed);
    log.assert_single_source();
}

#[tokio::test(start_paused = true)]
async fn close_stops_playback_and_releases_output() {
    let (mut session, log, _voice) = session(ScriptedVoice::new(&[("Sentence one.", Some(4_000))]));

    session.load("Sentence one.", "en");
    session.toggle_playback();
    drive_until(&mut session, is_playing).await;
    let (source, _) = log.plays()[0];

    session.close();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(session.controller().engine().context_state(), ContextState::Closed);
    assert_eq!(log.calls().last(), Some(&Call::Stop(source)));
    assert!(!log.calls().contains(&Call::Ended(source)));
    assert_eq!(session.playback_state(), Default::default());
}
