//! Data model shared by the session, media, and transport crates.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a voice session.
///
/// Owned and mutated by the orchestrator only. Everything else observes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Initializing,
    Ready,
    Recording,
    AiSpeaking,
    ProcessingFunction,
    Error,
    Disconnected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Recording => "recording",
            Self::AiSpeaking => "ai_speaking",
            Self::ProcessingFunction => "processing_function",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        }
    }

    /// `Disconnected` is the only state with no way out.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw PCM layout. The realtime wire format is 24 kHz, 16-bit, mono.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::PCM16_24K_MONO
    }
}

impl AudioFormat {
    pub const PCM16_24K_MONO: Self = Self {
        sample_rate: 24_000,
        bit_depth: 16,
        channels: 1,
    };

    pub fn new(sample_rate: u32, bit_depth: u16, channels: u16) -> Self {
        Self {
            sample_rate,
            bit_depth,
            channels,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.bit_depth / 8) as usize
    }

    /// Bytes for one sample across all channels.
    pub fn frame_size(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.sample_rate as usize
    }

    /// Playback time of `len` bytes in this format.
    ///
    /// `len / (bit_depth / 8) / channels / sample_rate` seconds.
    pub fn duration_of(&self, len: usize) -> Duration {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return Duration::ZERO;
        }
        let nanos = len as u128 * 1_000_000_000 / bps as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// Byte length of `duration` rounded down to whole frames, never less than one frame.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frame = self.frame_size().max(1);
        let frames = (duration.as_secs_f64() * self.sample_rate as f64) as usize;
        frames.max(1) * frame
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}-bit/{}ch",
            self.sample_rate, self.bit_depth, self.channels
        )
    }
}

/// An immutable block of PCM bytes tagged with its format.
///
/// Cloning is cheap (the bytes are reference counted) but there is no way to
/// mutate the payload once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    data: Bytes,
    format: AudioFormat,
}

impl AudioChunk {
    pub fn new(data: impl Into<Bytes>, format: AudioFormat) -> Self {
        Self {
            data: data.into(),
            format,
        }
    }

    /// A chunk in the realtime wire format.
    pub fn pcm16(data: impl Into<Bytes>) -> Self {
        Self::new(data, AudioFormat::PCM16_24K_MONO)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.data.len())
    }

    /// Little-endian 16-bit samples. A trailing odd byte is ignored.
    pub fn samples_i16(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Identifier of one AI speaking turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u64);

impl Epoch {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch-{}", self.0)
    }
}

/// Shared, monotonically increasing turn counter.
///
/// The orchestrator advances it on interruption; the transport reader stamps
/// inbound events with it and the playback worker checks it before every
/// device write, so audio from an older turn is recognisably stale everywhere.
#[derive(Debug, Clone, Default)]
pub struct EpochGate {
    inner: Arc<AtomicU64>,
}

impl EpochGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Epoch {
        Epoch(self.inner.load(Ordering::Acquire))
    }

    /// Move to a new epoch and return it.
    pub fn advance(&self) -> Epoch {
        Epoch(self.inner.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.current() == epoch
    }
}

/// A callable function advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the arguments.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Names listed in the schema's `required` array.
    pub fn required(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(|r| r.as_array())
            .map(|names| names.iter().filter_map(|n| n.as_str()).collect())
            .unwrap_or_default()
    }
}
