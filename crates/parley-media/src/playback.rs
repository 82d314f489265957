//! Speaker playback pipeline.
//!
//! Buffers are handed to a worker task that writes them to the output device
//! in bounded, frame-aligned slices. The worker never runs more than
//! `max_lead` ahead of wall clock and waits whenever the device reports a full
//! buffer. Before every slice it checks its cancellation token and the turn
//! epoch, so an interruption silences output within one slice.
//!
//! Completion is estimated from byte counts rather than observed on the
//! device: each buffer extends a single countdown by its duration and one
//! [`PlaybackEvent::Finished`] fires when the countdown runs out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::error::Result;
use parley_core::types::{AudioChunk, AudioFormat, Epoch, EpochGate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The estimated end of a contiguous run of audio was reached.
    Finished,
    /// The output device failed; playback was torn down.
    Error(String),
}

/// An open output device.
#[async_trait]
pub trait AudioSink: Send {
    /// Write PCM bytes, waiting while the device buffer is full.
    async fn write(&mut self, pcm: &[u8]) -> Result<()>;
}

/// Opens output devices on demand.
pub trait SinkFactory: Send + Sync {
    fn open(&self, format: AudioFormat) -> Result<Box<dyn AudioSink>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackConfig {
    pub format: AudioFormat,
    /// Audio per device write.
    pub slice: Duration,
    /// How far writes may run ahead of real time.
    pub max_lead: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::PCM16_24K_MONO,
            slice: Duration::from_millis(250),
            max_lead: Duration::from_millis(500),
        }
    }
}

struct Worker {
    tx: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    epoch: Epoch,
    /// Bytes queued but not yet written to the device.
    backlog: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn is_live(&self) -> bool {
        !self.handle.is_finished() && !self.cancel.is_cancelled()
    }

    /// Whether at least one whole frame is still waiting for the device.
    fn is_busy(&self, frame: usize) -> bool {
        self.is_live() && self.backlog.load(Ordering::Acquire) >= frame
    }
}

pub struct PlaybackPipeline {
    factory: Arc<dyn SinkFactory>,
    config: PlaybackConfig,
    gate: EpochGate,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    worker: Option<Worker>,
    timer: FinishTimer,
}

impl PlaybackPipeline {
    pub fn new(
        factory: Arc<dyn SinkFactory>,
        config: PlaybackConfig,
        gate: EpochGate,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let timer = FinishTimer::new(events.clone());
        (
            Self {
                factory,
                config,
                gate,
                events,
                worker: None,
                timer,
            },
            rx,
        )
    }

    /// Queue a buffer for playback.
    ///
    /// Empty buffers are ignored without touching the device. Buffers tagged
    /// with a superseded epoch are dropped. The device is opened on the first
    /// buffer of a run.
    pub fn play(&mut self, chunk: AudioChunk, epoch: Epoch) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        if !self.gate.is_current(epoch) {
            debug!(%epoch, "Dropping audio from a superseded turn");
            return Ok(());
        }

        let needs_worker = match &self.worker {
            Some(w) => !w.is_live() || w.epoch != epoch,
            None => true,
        };
        if needs_worker {
            self.stop_worker();
            let sink = self.factory.open(self.config.format)?;
            info!(format = %self.config.format, "Playback device opened");
            self.worker = Some(self.spawn_worker(sink, epoch));
        }

        let duration = chunk.duration();
        if let Some(worker) = &self.worker {
            let len = chunk.len();
            worker.backlog.fetch_add(len, Ordering::AcqRel);
            if worker.tx.send(chunk.into_bytes()).is_err() {
                worker.backlog.fetch_sub(len, Ordering::AcqRel);
                warn!("Playback worker gone, audio dropped");
                return Ok(());
            }
        }
        self.timer.extend(duration);
        Ok(())
    }

    /// Silence output immediately and discard queued audio.
    ///
    /// Does not wait for the device; the worker releases it when it observes
    /// cancellation.
    pub fn stop(&mut self) {
        let had_worker = self.worker.is_some();
        self.stop_worker();
        self.timer.cancel();
        if had_worker {
            info!("Playback stopped");
        }
    }

    /// Whether audio is still queued for the device or within its estimated duration.
    pub fn is_playing(&self) -> bool {
        let frame = self.config.format.frame_size().max(1);
        self.timer.is_pending() || self.worker.as_ref().is_some_and(|w| w.is_busy(frame))
    }

    /// Teardown. Safe to repeat.
    pub fn cleanup(&mut self) {
        self.stop();
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.cancel.cancel();
        }
    }

    fn spawn_worker(&self, sink: Box<dyn AudioSink>, epoch: Epoch) -> Worker {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let backlog = Arc::new(AtomicUsize::new(0));
        let run = WorkerRun {
            sink,
            rx,
            cancel: cancel.clone(),
            backlog: backlog.clone(),
            gate: self.gate.clone(),
            epoch,
            config: self.config,
            events: self.events.clone(),
        };
        Worker {
            tx,
            cancel,
            epoch,
            backlog,
            handle: tokio::spawn(run.run()),
        }
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WorkerRun {
    sink: Box<dyn AudioSink>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    backlog: Arc<AtomicUsize>,
    gate: EpochGate,
    epoch: Epoch,
    config: PlaybackConfig,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl WorkerRun {
    async fn run(mut self) {
        let format = self.config.format;
        let frame = format.frame_size().max(1);
        let slice_bytes = format.bytes_for(self.config.slice);
        let mut pending: Vec<u8> = Vec::new();
        // Audio written since `clock` was last reset.
        let mut clock = Instant::now();
        let mut written = Duration::ZERO;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = self.rx.recv() => next,
            };
            let Some(bytes) = next else { break };
            pending.extend_from_slice(&bytes);
            while let Ok(more) = self.rx.try_recv() {
                pending.extend_from_slice(&more);
            }

            let aligned = pending.len() - pending.len() % frame;
            let mut offset = 0;
            while offset < aligned {
                if self.cancel.is_cancelled() || !self.gate.is_current(self.epoch) {
                    debug!(epoch = %self.epoch, "Playback worker interrupted");
                    return;
                }

                let elapsed = clock.elapsed();
                if written < elapsed {
                    // Underrun; measure lead from now on.
                    clock = Instant::now();
                    written = Duration::ZERO;
                } else if written > elapsed + self.config.max_lead {
                    let wait = written - elapsed - self.config.max_lead;
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    continue;
                }

                let end = (offset + slice_bytes).min(aligned);
                let slice = &pending[offset..end];
                let result = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    result = self.sink.write(slice) => result,
                };
                if let Err(e) = result {
                    warn!(%e, "Playback device write failed");
                    let _ = self.events.send(PlaybackEvent::Error(e.to_string()));
                    return;
                }
                self.backlog.fetch_sub(slice.len(), Ordering::AcqRel);
                written += format.duration_of(slice.len());
                offset = end;
            }
            pending.drain(..aligned);
        }
    }
}

struct TimerState {
    deadline: Instant,
    fired: bool,
}

/// Estimated end-of-playback notification.
///
/// One countdown per contiguous run: extending a pending countdown pushes its
/// deadline back by the new audio's duration; extending after it fired starts
/// a new run.
pub struct FinishTimer {
    events: mpsc::UnboundedSender<PlaybackEvent>,
    run: Option<(Arc<Mutex<TimerState>>, CancellationToken)>,
}

fn lock(state: &Mutex<TimerState>) -> MutexGuard<'_, TimerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl FinishTimer {
    pub fn new(events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        Self { events, run: None }
    }

    pub fn extend(&mut self, duration: Duration) {
        let now = Instant::now();
        if let Some((state, _)) = &self.run {
            let mut state = lock(state);
            if !state.fired {
                state.deadline = state.deadline.max(now) + duration;
                return;
            }
        }

        let state = Arc::new(Mutex::new(TimerState {
            deadline: now + duration,
            fired: false,
        }));
        let cancel = CancellationToken::new();
        tokio::spawn(run_timer(state.clone(), cancel.clone(), self.events.clone()));
        self.run = Some((state, cancel));
    }

    pub fn cancel(&mut self) {
        if let Some((_, cancel)) = self.run.take() {
            cancel.cancel();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.run
            .as_ref()
            .is_some_and(|(state, cancel)| !cancel.is_cancelled() && !lock(state).fired)
    }
}

impl Drop for FinishTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_timer(
    state: Arc<Mutex<TimerState>>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<PlaybackEvent>,
) {
    loop {
        let deadline = lock(&state).deadline;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }
        let mut current = lock(&state);
        if current.deadline <= Instant::now() {
            current.fired = true;
            drop(current);
            if !cancel.is_cancelled() {
                debug!("Playback finished");
                let _ = events.send(PlaybackEvent::Finished);
            }
            return;
        }
    }
}
