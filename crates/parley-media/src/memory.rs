//! In-process audio devices.
//!
//! [`MemorySource`] and [`MemorySinkFactory`] stand in for the microphone and
//! speaker. Both are cheap to clone and share state with their clones, so a
//! test keeps one handle while the session owns the other.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Semaphore, mpsc};

use parley_core::error::{ParleyError, Result};
use parley_core::types::{AudioChunk, AudioFormat};

use crate::capture::{AudioSource, CaptureEvent, CaptureSpec};
use crate::playback::{AudioSink, SinkFactory};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct SourceState {
    tx: Option<mpsc::UnboundedSender<CaptureEvent>>,
    format: AudioFormat,
    starts: usize,
    stops: usize,
    start_failure: Option<String>,
}

/// A microphone fed by hand.
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `start` fail with `message`.
    pub fn with_start_failure(self, message: impl Into<String>) -> Self {
        lock(&self.state).start_failure = Some(message.into());
        self
    }

    /// Deliver a chunk as if recorded. Returns false when not capturing.
    pub fn feed(&self, data: impl Into<Bytes>) -> bool {
        let state = lock(&self.state);
        match &state.tx {
            Some(tx) => tx
                .send(CaptureEvent::Chunk(AudioChunk::new(data, state.format)))
                .is_ok(),
            None => false,
        }
    }

    /// Report a device failure while capturing.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        let state = lock(&self.state);
        match &state.tx {
            Some(tx) => tx.send(CaptureEvent::Error(message.into())).is_ok(),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).tx.is_some()
    }

    pub fn starts(&self) -> usize {
        lock(&self.state).starts
    }

    pub fn stops(&self) -> usize {
        lock(&self.state).stops
    }
}

impl AudioSource for MemorySource {
    fn start(&mut self, spec: CaptureSpec, tx: mpsc::UnboundedSender<CaptureEvent>) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(message) = &state.start_failure {
            return Err(ParleyError::Device(message.clone()));
        }
        state.starts += 1;
        state.format = spec.format;
        state.tx = Some(tx);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = lock(&self.state);
        if state.tx.take().is_some() {
            state.stops += 1;
        }
    }
}

#[derive(Default)]
struct SinkState {
    written: Vec<u8>,
    write_sizes: Vec<usize>,
    opens: usize,
    live: usize,
    open_failure: Option<String>,
    write_failure: Option<String>,
    stalled: bool,
    gate: Option<Arc<Semaphore>>,
}

/// A speaker that records what it was given.
#[derive(Clone, Default)]
pub struct MemorySinkFactory {
    state: Arc<Mutex<SinkState>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_failure(self, message: impl Into<String>) -> Self {
        lock(&self.state).open_failure = Some(message.into());
        self
    }

    pub fn with_write_failure(self, message: impl Into<String>) -> Self {
        lock(&self.state).write_failure = Some(message.into());
        self
    }

    /// Writes never complete, as with a device that stopped draining.
    pub fn with_stalled_writes(self) -> Self {
        lock(&self.state).stalled = true;
        self
    }

    /// Each write waits for a permit handed out by [`allow_writes`](Self::allow_writes),
    /// as with a device whose buffer is full until it drains.
    pub fn with_gated_writes(self) -> Self {
        lock(&self.state).gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `n` more gated writes complete.
    pub fn allow_writes(&self, n: usize) {
        if let Some(gate) = &lock(&self.state).gate {
            gate.add_permits(n);
        }
    }

    /// All bytes written across every sink, in order.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    /// Size of each individual write.
    pub fn write_sizes(&self) -> Vec<usize> {
        lock(&self.state).write_sizes.clone()
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    /// Sinks opened and not yet released.
    pub fn live_sinks(&self) -> usize {
        lock(&self.state).live
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(&self, _format: AudioFormat) -> Result<Box<dyn AudioSink>> {
        let mut state = lock(&self.state);
        if let Some(message) = &state.open_failure {
            return Err(ParleyError::Device(message.clone()));
        }
        state.opens += 1;
        state.live += 1;
        Ok(Box::new(MemorySink {
            state: self.state.clone(),
        }))
    }
}

struct MemorySink {
    state: Arc<Mutex<SinkState>>,
}

#[async_trait]
impl AudioSink for MemorySink {
    async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let (stalled, failure, gate) = {
            let state = lock(&self.state);
            (state.stalled, state.write_failure.clone(), state.gate.clone())
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| ParleyError::Device(e.to_string()))?
                .forget();
        }
        if let Some(message) = failure {
            return Err(ParleyError::Device(message));
        }
        let mut state = lock(&self.state);
        state.written.extend_from_slice(pcm);
        state.write_sizes.push(pcm.len());
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.live = state.live.saturating_sub(1);
    }
}
