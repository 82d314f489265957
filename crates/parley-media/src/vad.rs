//! Energy-based Voice Activity Detection (VAD).

use parley_core::types::AudioChunk;

/// Speech boundary reported by [`SpeechDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    SpeechStarted,
    SpeechEnded,
}

/// Voice activity detector using an RMS energy threshold on 16-bit PCM.
///
/// Speech must persist for `min_speech_frames` consecutive frames before it
/// is reported, which keeps clicks and speaker bleed from counting as a
/// barge-in.
pub struct SpeechDetector {
    threshold: f64,
    min_speech_frames: usize,
    min_silent_frames: usize,
    /// Samples per analysis frame (20 ms).
    frame_len: usize,
    speech_active: bool,
    speech_count: usize,
    silent_count: usize,
    /// Samples carried over from the previous chunk.
    residual: Vec<i16>,
}

impl SpeechDetector {
    pub fn new(
        sample_rate: u32,
        threshold: f64,
        min_speech_frames: usize,
        min_silent_frames: usize,
    ) -> Self {
        Self {
            threshold,
            min_speech_frames: min_speech_frames.max(1),
            min_silent_frames: min_silent_frames.max(1),
            frame_len: (sample_rate as usize / 50).max(1),
            speech_active: false,
            speech_count: 0,
            silent_count: 0,
            residual: Vec::new(),
        }
    }

    /// Compute RMS energy of a PCM frame.
    pub fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    /// Process one analysis frame.
    pub fn process_frame(&mut self, pcm: &[i16]) -> Option<VadTransition> {
        let is_speech = Self::rms(pcm) > self.threshold;

        if is_speech {
            self.silent_count = 0;
            if !self.speech_active {
                self.speech_count += 1;
                if self.speech_count >= self.min_speech_frames {
                    self.speech_active = true;
                    self.speech_count = 0;
                    return Some(VadTransition::SpeechStarted);
                }
            }
        } else {
            self.speech_count = 0;
            if self.speech_active {
                self.silent_count += 1;
                if self.silent_count >= self.min_silent_frames {
                    self.speech_active = false;
                    self.silent_count = 0;
                    return Some(VadTransition::SpeechEnded);
                }
            }
        }

        None
    }

    /// Feed a captured chunk, returning the first transition it produced.
    pub fn process_chunk(&mut self, chunk: &AudioChunk) -> Option<VadTransition> {
        self.residual.extend(chunk.samples_i16());
        let mut transition = None;
        let mut offset = 0;
        while self.residual.len() - offset >= self.frame_len {
            let frame = self.residual[offset..offset + self.frame_len].to_vec();
            offset += self.frame_len;
            if let Some(t) = self.process_frame(&frame) {
                transition.get_or_insert(t);
            }
        }
        self.residual.drain(..offset);
        transition
    }

    /// Whether speech is currently active.
    pub fn is_active(&self) -> bool {
        self.speech_active
    }

    /// Reset the detector state.
    pub fn reset(&mut self) {
        self.speech_active = false;
        self.speech_count = 0;
        self.silent_count = 0;
        self.residual.clear();
    }
}
