//! Device audio output using rodio
//!
//! rodio's OutputStream is not Send, so a dedicated audio thread owns it
//! together with one Sink per started source. Commands arrive over a
//! channel and the thread polls its sinks to notice when a source drains.

use crate::tts::decoder::AudioAsset;
use crate::tts::engine::{AudioOutput, ContextState, PlaybackError, SourceDone, SourceHandle};
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink, Source};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the audio thread checks sinks for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

enum OutputCmd {
    Resume,
    Start {
        source: SourceHandle,
        samples: Arc<[f32]>,
        channels: u16,
        sample_rate: u32,
        offset: Duration,
        done: SourceDone,
    },
    Stop(SourceHandle),
    Close,
}

/// Default output device, opened lazily on first unlock.
pub struct RodioOutput {
    tx: Option<Sender<OutputCmd>>,
    thread: Option<JoinHandle<()>>,
    state: ContextState,
}

impl RodioOutput {
    pub fn new() -> Self {
        Self {
            tx: None,
            thread: None,
            state: ContextState::Closed,
        }
    }

    fn send(&self, cmd: OutputCmd) -> Result<(), PlaybackError> {
        let tx = self.tx.as_ref().ok_or(PlaybackError::ContextClosed)?;
        tx.send(cmd)
            .map_err(|_| PlaybackError::PlaybackError("audio thread is gone".to_string()))
    }
}

impl Default for RodioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for RodioOutput {
    fn state(&self) -> ContextState {
        self.state
    }

    fn open(&mut self) -> Result<(), PlaybackError> {
        if self.tx.is_some() {
            return Ok(());
        }

        let (tx, rx) = unbounded::<OutputCmd>();
        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);

        let thread = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || audio_thread_main(rx, ready_tx))
            .map_err(|e| PlaybackError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(PlaybackError::StreamError(message)),
            Err(_) => {
                return Err(PlaybackError::StreamError(
                    "audio thread exited during startup".to_string(),
                ))
            }
        }

        self.tx = Some(tx);
        self.thread = Some(thread);
        self.state = ContextState::Suspended;
        log::info!("Audio output opened on default device");
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PlaybackError> {
        self.send(OutputCmd::Resume)?;
        self.state = ContextState::Running;
        Ok(())
    }

    fn start(
        &mut self,
        source: SourceHandle,
        asset: &AudioAsset,
        offset: Duration,
        done: SourceDone,
    ) -> Result<(), PlaybackError> {
        self.send(OutputCmd::Start {
            source,
            samples: asset.shared_samples(),
            channels: asset.channels(),
            sample_rate: asset.sample_rate(),
            offset,
            done,
        })
    }

    fn stop(&mut self, source: SourceHandle) {
        let _ = self.send(OutputCmd::Stop(source));
    }

    fn close(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(OutputCmd::Close);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.state = ContextState::Closed;
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn audio_thread_main(
    rx: crossbeam_channel::Receiver<OutputCmd>,
    ready_tx: Sender<Result<(), String>>,
) {
    // Create the output stream once for the lifetime of the thread
    let (_stream, stream_handle) = match OutputStream::try_default() {
        Ok(v) => {
            let _ = ready_tx.send(Ok(()));
            v
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };

    let mut running = false;
    let mut sinks: HashMap<SourceHandle, (Sink, SourceDone)> = HashMap::new();

    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(OutputCmd::Resume) => {
                running = true;
                for (sink, _) in sinks.values() {
                    sink.play();
                }
            }
            Ok(OutputCmd::Start {
                source,
                samples,
                channels,
                sample_rate,
                offset,
                done,
            }) => match Sink::try_new(&stream_handle) {
                Ok(sink) => {
                    if !running {
                        sink.pause();
                    }
                    let buffer = SamplesBuffer::new(channels, sample_rate, samples.to_vec());
                    sink.append(buffer.skip_duration(offset));
                    sinks.insert(source, (sink, done));
                }
                Err(e) => {
                    // Report the source as over so playback moves on.
                    log::error!("Failed to create audio sink: {}", e);
                    done();
                }
            },
            Ok(OutputCmd::Stop(source)) => {
                // Dropping `done` without calling it: a stop is not an end.
                if let Some((sink, _done)) = sinks.remove(&source) {
                    sink.stop();
                }
            }
            Ok(OutputCmd::Close) | Err(RecvTimeoutError::Disconnected) => {
                for (_, (sink, _)) in sinks.drain() {
                    sink.stop();
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        let drained: Vec<SourceHandle> = sinks
            .iter()
            .filter(|(_, (sink, _))| sink.empty())
            .map(|(source, _)| *source)
            .collect();
        for source in drained {
            if let Some((_, done)) = sinks.remove(&source) {
                done();
            }
        }
    }
}
