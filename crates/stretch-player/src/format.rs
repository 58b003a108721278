//! Shared data model: track format, PCM chunks, playback parameters and state.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{PlayerError, Result};

/// Sample rate and channel layout of a decoded stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl TrackFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Reject layouts the output path cannot play (only mono and stereo are supported).
    pub fn validate_output(&self) -> Result<()> {
        if !(1..=2).contains(&self.channels) {
            return Err(PlayerError::invalid_argument(format!(
                "invalid number of channels (1,2): {}",
                self.channels
            )));
        }
        if self.sample_rate == 0 {
            return Err(PlayerError::invalid_argument("sample rate must be positive"));
        }
        Ok(())
    }
}

/// Fixed-capacity buffer of interleaved signed 16-bit samples.
///
/// The decoder reuses one chunk for the whole run; a consumer only sees it for the
/// duration of a single callback.
#[derive(Debug)]
pub struct PcmChunk {
    buf: Box<[i16]>,
    len: usize,
}

impl PcmChunk {
    pub fn with_capacity(samples: usize) -> Self {
        Self {
            buf: vec![0; samples].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of valid samples.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Valid length in bytes (two per sample).
    pub fn byte_len(&self) -> usize {
        self.len * std::mem::size_of::<i16>()
    }

    /// The valid part of the buffer.
    pub fn samples(&self) -> &[i16] {
        &self.buf[..self.len]
    }

    /// Copy as many samples from `src` as fit; returns the number copied.
    pub fn fill_from(&mut self, src: &[i16]) -> usize {
        let n = src.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Speed, pitch and rate factors applied by the stretching stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaybackParameters {
    pub speed: f32,
    pub pitch: f32,
    pub rate: f32,
}

impl Default for PlaybackParameters {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch: 1.0,
            rate: 1.0,
        }
    }
}

impl PlaybackParameters {
    pub fn is_identity(&self) -> bool {
        self.speed == 1.0 && self.pitch == 1.0 && self.rate == 1.0
    }
}

/// Check that a playback factor is finite and strictly positive.
pub fn validate_factor(name: &str, value: f32) -> Result<f32> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(PlayerError::invalid_argument(format!(
            "{name} must be a positive number, got {value}"
        )))
    }
}

/// Lock-free parameter slot written by the control thread and read by the decode thread.
///
/// `generation` is bumped on every change so the reader can skip reapplying unchanged values.
#[derive(Debug)]
pub struct SharedParameters {
    speed: AtomicU32,
    pitch: AtomicU32,
    rate: AtomicU32,
    generation: AtomicU64,
}

impl Default for SharedParameters {
    fn default() -> Self {
        Self::new(PlaybackParameters::default())
    }
}

impl SharedParameters {
    pub fn new(params: PlaybackParameters) -> Self {
        Self {
            speed: AtomicU32::new(params.speed.to_bits()),
            pitch: AtomicU32::new(params.pitch.to_bits()),
            rate: AtomicU32::new(params.rate.to_bits()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn set_speed(&self, speed: f32) -> Result<()> {
        let v = validate_factor("speed", speed)?;
        self.store(&self.speed, v);
        Ok(())
    }

    pub fn set_pitch(&self, pitch: f32) -> Result<()> {
        let v = validate_factor("pitch", pitch)?;
        self.store(&self.pitch, v);
        Ok(())
    }

    pub fn set_rate(&self, rate: f32) -> Result<()> {
        let v = validate_factor("rate", rate)?;
        self.store(&self.rate, v);
        Ok(())
    }

    pub fn snapshot(&self) -> PlaybackParameters {
        PlaybackParameters {
            speed: f32::from_bits(self.speed.load(Ordering::Acquire)),
            pitch: f32::from_bits(self.pitch.load(Ordering::Acquire)),
            rate: f32::from_bits(self.rate.load(Ordering::Acquire)),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn store(&self, slot: &AtomicU32, value: f32) {
        slot.store(value.to_bits(), Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// Lifecycle of a decoder and of the session driving it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Stopped,
}

/// Convert interleaved `i16` PCM to `f32` in `[-1.0, 1.0)`, appending to `out`.
pub fn i16_to_f32_into(src: &[i16], out: &mut Vec<f32>) {
    out.extend(src.iter().map(|&s| f32::from(s) / 32768.0));
}
