//! Decoded audio buffers
//!
//! An `AudioBuffer` holds fully decoded interleaved f32 samples. It is
//! immutable once built and shared between the control thread and the
//! audio thread through an `Arc`, so playback sources can seek anywhere
//! without copying.

use std::sync::Arc;
use std::time::Duration;

/// Fully decoded, randomly seekable audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Interleaved samples, `frames * channels` long
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

/// A finished voice recording, shared with whoever listens for it
pub type RecordedBuffer = Arc<AudioBuffer>;

impl AudioBuffer {
    /// Wrap interleaved samples
    ///
    /// A trailing partial frame is dropped. `channels` and `sample_rate`
    /// of zero are bumped to 1 so the buffer is always addressable.
    pub fn new(mut samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1);
        let whole = samples.len() - samples.len() % channels as usize;
        samples.truncate(whole);
        Self {
            samples,
            sample_rate: sample_rate.max(1),
            channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Raw interleaved samples
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Stereo view of one frame; mono is duplicated, extra channels ignored
    pub fn frame(&self, index: usize) -> (f32, f32) {
        let ch = self.channels as usize;
        let base = index * ch;
        match self.samples.get(base..base + ch) {
            Some(frame) if ch == 1 => (frame[0], frame[0]),
            Some(frame) => (frame[0], frame[1]),
            None => (0.0, 0.0),
        }
    }

    /// Stereo sample at a fractional frame position
    ///
    /// Linear interpolation between neighbouring frames. With `wrap` the
    /// frame after the last one is the first one, which keeps loops
    /// seamless.
    pub fn sample_at(&self, position: f64, wrap: bool) -> (f32, f32) {
        let frames = self.frames();
        if frames == 0 || position < 0.0 {
            return (0.0, 0.0);
        }

        let index = position.floor() as usize;
        if index >= frames {
            return (0.0, 0.0);
        }
        let frac = (position - index as f64) as f32;

        let next = if index + 1 < frames {
            Some(index + 1)
        } else if wrap {
            Some(0)
        } else {
            None
        };

        let (l0, r0) = self.frame(index);
        let (l1, r1) = next.map(|n| self.frame(n)).unwrap_or((0.0, 0.0));
        (l0 + (l1 - l0) * frac, r0 + (r1 - r0) * frac)
    }
}
