//! Media pipeline: microphone capture, paced speaker playback, and VAD.
//!
//! Devices sit behind the [`AudioSource`] and [`SinkFactory`] traits. The
//! cpal implementations live in [`device`]; [`memory`] provides in-process
//! stand-ins for running sessions without hardware.

pub mod capture;
pub mod device;
pub mod memory;
pub mod playback;
pub mod vad;

pub use capture::{AudioSource, CaptureEvent, CapturePipeline, CaptureSpec};
pub use playback::{AudioSink, FinishTimer, PlaybackConfig, PlaybackEvent, PlaybackPipeline, SinkFactory};
pub use vad::{SpeechDetector, VadTransition};
