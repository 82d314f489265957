//! Microphone capture pipeline.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_core::error::Result;
use parley_core::types::{AudioChunk, AudioFormat};

/// What a source delivers once started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Chunk(AudioChunk),
    /// The device failed after it was started.
    Error(String),
}

/// Requested capture layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSpec {
    pub format: AudioFormat,
    /// Bytes per delivered chunk.
    pub chunk_bytes: usize,
}

impl Default for CaptureSpec {
    fn default() -> Self {
        Self {
            format: AudioFormat::PCM16_24K_MONO,
            chunk_bytes: 4096,
        }
    }
}

/// A microphone-like device.
///
/// Swappable so sessions can run against a real device or an in-memory source.
pub trait AudioSource: Send {
    /// Acquire the device and start delivering events to `tx`.
    ///
    /// On error nothing may remain acquired.
    fn start(&mut self, spec: CaptureSpec, tx: mpsc::UnboundedSender<CaptureEvent>) -> Result<()>;

    /// Stop delivering and release the device. Must be safe to call when
    /// not started.
    fn stop(&mut self);
}

/// Owns a source and tracks whether it is capturing.
pub struct CapturePipeline {
    source: Box<dyn AudioSource>,
    spec: CaptureSpec,
    tx: mpsc::UnboundedSender<CaptureEvent>,
    active: bool,
}

impl CapturePipeline {
    /// Build a pipeline and the receiver its chunks arrive on.
    pub fn new(
        source: Box<dyn AudioSource>,
        spec: CaptureSpec,
    ) -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                source,
                spec,
                tx,
                active: false,
            },
            rx,
        )
    }

    /// Start capturing. A no-op while already capturing.
    pub fn start(&mut self) -> Result<()> {
        if self.active {
            debug!("Capture already running");
            return Ok(());
        }
        match self.source.start(self.spec, self.tx.clone()) {
            Ok(()) => {
                self.active = true;
                info!(format = %self.spec.format, chunk_bytes = self.spec.chunk_bytes, "Capture started");
                Ok(())
            }
            Err(e) => {
                warn!(%e, "Capture device failed to open");
                self.source.stop();
                Err(e)
            }
        }
    }

    /// Stop capturing and release the device. A no-op when idle.
    pub fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.source.stop();
        self.active = false;
        info!("Capture stopped");
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn spec(&self) -> CaptureSpec {
        self.spec
    }

    /// Teardown. Same as [`CapturePipeline::stop`] and safe to repeat.
    pub fn cleanup(&mut self) {
        self.stop();
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySource;

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let source = MemorySource::new();
        let (mut capture, _rx) = CapturePipeline::new(Box::new(source.clone()), CaptureSpec::default());

        capture.start().unwrap();
        capture.start().unwrap();
        assert!(capture.is_active());
        assert_eq!(source.starts(), 1);

        capture.stop();
        capture.stop();
        assert!(!capture.is_active());
        assert_eq!(source.stops(), 1);
    }

    #[tokio::test]
    async fn test_chunks_forwarded_in_order() {
        let source = MemorySource::new();
        let (mut capture, mut rx) =
            CapturePipeline::new(Box::new(source.clone()), CaptureSpec::default());
        capture.start().unwrap();

        assert!(source.feed(vec![1, 2]));
        assert!(source.feed(vec![3, 4]));
        capture.stop();
        assert!(!source.feed(vec![5, 6]));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first, CaptureEvent::Chunk(AudioChunk::pcm16(vec![1, 2])));
        assert_eq!(second, CaptureEvent::Chunk(AudioChunk::pcm16(vec![3, 4])));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_failure_releases_device() {
        let source = MemorySource::new().with_start_failure("no microphone");
        let (mut capture, _rx) =
            CapturePipeline::new(Box::new(source.clone()), CaptureSpec::default());

        let err = capture.start().unwrap_err();
        assert!(err.to_string().contains("no microphone"));
        assert!(!capture.is_active());
        assert!(!source.is_active());

        // Cleanup after a failed start is harmless
        capture.cleanup();
        capture.cleanup();
    }

    #[tokio::test]
    async fn test_stop_when_never_started() {
        let source = MemorySource::new();
        let (mut capture, _rx) =
            CapturePipeline::new(Box::new(source.clone()), CaptureSpec::default());
        capture.stop();
        assert_eq!(source.stops(), 0);
    }
}
