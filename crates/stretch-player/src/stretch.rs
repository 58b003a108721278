//! Time-stretch processor.
//!
//! Two stages run on every ingest:
//! 1. Pitch-synchronous overlap-add at `speed / pitch`. A pitch period is found with AMDF
//!    and either skipped (faster) or repeated (slower), cross-fading across the seam.
//! 2. Linear-interpolation resampling at `rate × pitch`.
//!
//! With all factors at 1.0 both stages copy samples through untouched.

use crate::error::{PlayerError, Result};
use crate::format::{PlaybackParameters, validate_factor};

const MIN_PITCH_HZ: u32 = 65;
const MAX_PITCH_HZ: u32 = 400;
/// Pitch search runs on a signal downsampled to roughly this rate.
const AMDF_RATE_HZ: u32 = 4000;
const UNITY_EPSILON: f32 = 1e-5;

fn is_unity(factor: f32) -> bool {
    (factor - 1.0).abs() < UNITY_EPSILON
}

/// Elastic buffer applying speed, pitch and rate to interleaved `i16` PCM.
///
/// Samples come out in the order they went in, and nothing ingested is dropped except by
/// [`TimeStretchProcessor::flush`] (which trims the silence it pads with) or
/// [`TimeStretchProcessor::clear`].
#[derive(Debug)]
pub struct TimeStretchProcessor {
    channels: usize,
    sample_rate: u32,
    params: PlaybackParameters,
    min_period: usize,
    max_period: usize,
    max_required: usize,

    input: Vec<i16>,
    stretched: Vec<i16>,
    output: Vec<i16>,
    remaining_to_copy: usize,
    rate_pos: f64,

    mono: Vec<i32>,
    down: Vec<i32>,
}

impl TimeStretchProcessor {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        if channels == 0 {
            return Err(PlayerError::invalid_argument("channel count must be positive"));
        }
        if sample_rate == 0 {
            return Err(PlayerError::invalid_argument("sample rate must be positive"));
        }
        let mut processor = Self {
            channels: usize::from(channels),
            sample_rate,
            params: PlaybackParameters::default(),
            min_period: 0,
            max_period: 0,
            max_required: 0,
            input: Vec::new(),
            stretched: Vec::new(),
            output: Vec::new(),
            remaining_to_copy: 0,
            rate_pos: 0.0,
            mono: Vec::new(),
            down: Vec::new(),
        };
        processor.update_periods();
        Ok(processor)
    }

    pub fn set_speed(&mut self, speed: f32) -> Result<()> {
        self.params.speed = validate_factor("speed", speed)?;
        Ok(())
    }

    pub fn set_pitch(&mut self, pitch: f32) -> Result<()> {
        self.params.pitch = validate_factor("pitch", pitch)?;
        Ok(())
    }

    pub fn set_rate(&mut self, rate: f32) -> Result<()> {
        self.params.rate = validate_factor("rate", rate)?;
        Ok(())
    }

    /// Apply all three factors at once, rejecting the whole set if any is invalid.
    pub fn set_parameters(&mut self, params: PlaybackParameters) -> Result<()> {
        validate_factor("speed", params.speed)?;
        validate_factor("pitch", params.pitch)?;
        validate_factor("rate", params.rate)?;
        self.params = params;
        Ok(())
    }

    /// Change the nominal input rate. Buffered samples are kept.
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        if sample_rate == 0 {
            return Err(PlayerError::invalid_argument("sample rate must be positive"));
        }
        self.sample_rate = sample_rate;
        self.update_periods();
        Ok(())
    }

    /// Ingest interleaved samples and process as much as possible.
    pub fn put_samples(&mut self, samples: &[i16]) {
        self.input.extend_from_slice(samples);
        self.process();
    }

    /// Processed samples ready to be received.
    pub fn available_samples(&self) -> usize {
        self.output.len()
    }

    /// Move up to `dst.len()` ready samples into `dst`; returns how many were written.
    pub fn receive_samples(&mut self, dst: &mut [i16]) -> usize {
        let n = dst.len().min(self.output.len());
        dst[..n].copy_from_slice(&self.output[..n]);
        self.output.drain(..n);
        n
    }

    /// Push everything still buffered through to the output and reset the stream state.
    ///
    /// Ready output is kept; call [`TimeStretchProcessor::receive_samples`] afterwards.
    pub fn flush(&mut self) {
        let ch = self.channels;
        let speed = f64::from(self.params.speed / self.params.pitch);
        let rate = f64::from(self.params.rate * self.params.pitch);
        let pending_in = (self.input.len() / ch) as f64;
        let pending_stretched = (self.stretched.len() / ch) as f64;
        let expected_frames = self.output.len() / ch
            + ((pending_in / speed + pending_stretched) / rate + 0.5) as usize;

        self.input.resize(self.input.len() + 2 * self.max_required * ch, 0);
        self.process();

        let expected = expected_frames * ch;
        if self.output.len() > expected {
            self.output.truncate(expected);
        }
        self.reset_stream();
    }

    /// Drop all buffered and ready samples.
    pub fn clear(&mut self) {
        self.output.clear();
        self.reset_stream();
    }

    fn reset_stream(&mut self) {
        self.input.clear();
        self.stretched.clear();
        self.remaining_to_copy = 0;
        self.rate_pos = 0.0;
    }

    fn update_periods(&mut self) {
        self.min_period = (self.sample_rate / MAX_PITCH_HZ).max(1) as usize;
        self.max_period = (self.sample_rate / MIN_PITCH_HZ).max(2) as usize;
        self.max_required = 2 * self.max_period;
    }

    fn downsample_skip(&self) -> usize {
        if self.sample_rate > AMDF_RATE_HZ {
            (self.sample_rate / AMDF_RATE_HZ) as usize
        } else {
            1
        }
    }

    fn process(&mut self) {
        self.change_speed();
        self.change_rate();
    }

    fn change_speed(&mut self) {
        let speed = self.params.speed / self.params.pitch;
        if is_unity(speed) {
            self.stretched.extend_from_slice(&self.input);
            self.input.clear();
            self.remaining_to_copy = 0;
            return;
        }

        let ch = self.channels;
        let frames = self.input.len() / ch;
        let mut pos = 0;
        while pos + self.max_required <= frames {
            if self.remaining_to_copy > 0 {
                let n = self.remaining_to_copy.min(self.max_required);
                self.stretched
                    .extend_from_slice(&self.input[pos * ch..(pos + n) * ch]);
                self.remaining_to_copy -= n;
                pos += n;
            } else {
                let period = self.find_pitch_period(pos);
                if speed > 1.0 {
                    pos += period + self.skip_pitch_period(pos, period, speed);
                } else {
                    pos += self.insert_pitch_period(pos, period, speed);
                }
            }
        }
        self.input.drain(..pos * ch);
    }

    /// Drop one period, cross-fading the period before it into the one after.
    fn skip_pitch_period(&mut self, pos: usize, period: usize, speed: f32) -> usize {
        let new_frames = if speed >= 2.0 {
            (period as f32 / (speed - 1.0)) as usize
        } else {
            self.remaining_to_copy = (period as f32 * (2.0 - speed) / (speed - 1.0)) as usize;
            period
        };
        let new_frames = new_frames.max(1);
        self.overlap_add(new_frames, pos, pos + period);
        new_frames
    }

    /// Emit one period, then repeat it with a cross-fade back to its start.
    fn insert_pitch_period(&mut self, pos: usize, period: usize, speed: f32) -> usize {
        let new_frames = if speed < 0.5 {
            (period as f32 * speed / (1.0 - speed)) as usize
        } else {
            self.remaining_to_copy =
                (period as f32 * (2.0 * speed - 1.0) / (1.0 - speed)) as usize;
            period
        };
        let new_frames = new_frames.max(1);
        let ch = self.channels;
        self.stretched
            .extend_from_slice(&self.input[pos * ch..(pos + period) * ch]);
        self.overlap_add(new_frames, pos + period, pos);
        new_frames
    }

    /// Linear ramp from `input[down..]` fading out to `input[up..]` fading in.
    fn overlap_add(&mut self, frames: usize, down: usize, up: usize) {
        let ch = self.channels;
        let n = frames as i32;
        for t in 0..frames {
            let w = t as i32;
            for c in 0..ch {
                let d = i32::from(self.input[(down + t) * ch + c]);
                let u = i32::from(self.input[(up + t) * ch + c]);
                self.stretched.push(((d * (n - w) + u * w) / n) as i16);
            }
        }
    }

    /// Pitch period in frames of the `max_required` frames starting at `pos`.
    fn find_pitch_period(&mut self, pos: usize) -> usize {
        let ch = self.channels;
        let skip = self.downsample_skip();
        let window = &self.input[pos * ch..(pos + self.max_required) * ch];

        self.mono.clear();
        self.mono.extend(
            window
                .chunks_exact(ch)
                .map(|f| f.iter().map(|&s| i32::from(s)).sum::<i32>() / ch as i32),
        );
        if skip == 1 {
            return amdf(&self.mono, self.min_period, self.max_period);
        }

        self.down.clear();
        self.down.extend(
            self.mono
                .chunks_exact(skip)
                .map(|c| c.iter().sum::<i32>() / skip as i32),
        );
        let coarse = amdf(&self.down, (self.min_period / skip).max(1), self.max_period / skip);
        let coarse = coarse * skip;

        let lo = coarse.saturating_sub(4 * skip).max(self.min_period);
        let hi = (coarse + 4 * skip).min(self.max_period);
        amdf(&self.mono, lo, hi)
    }

    fn change_rate(&mut self) {
        let rate = self.params.rate * self.params.pitch;
        if is_unity(rate) {
            self.output.extend_from_slice(&self.stretched);
            self.stretched.clear();
            self.rate_pos = 0.0;
            return;
        }

        let ch = self.channels;
        let frames = self.stretched.len() / ch;
        let step = f64::from(rate);
        let mut t = self.rate_pos;
        while (t as usize) + 1 < frames {
            let i = t as usize;
            let frac = t - i as f64;
            for c in 0..ch {
                let a = f64::from(self.stretched[i * ch + c]);
                let b = f64::from(self.stretched[(i + 1) * ch + c]);
                self.output.push((a + (b - a) * frac).round() as i16);
            }
            t += step;
        }

        // Keep the last frame as the left neighbour for the next batch.
        let consumed = frames.saturating_sub(1).min(t as usize);
        self.stretched.drain(..consumed * ch);
        self.rate_pos = t - consumed as f64;
    }
}

/// Average magnitude difference function: the period in `[min, max]` whose lagged
/// difference per sample is smallest.
fn amdf(samples: &[i32], min: usize, max: usize) -> usize {
    let max = max.min(samples.len() / 2);
    let min = min.clamp(1, max.max(1));
    let mut best = 0usize;
    let mut min_diff = 0u64;
    for period in min..=max {
        let diff: u64 = (0..period)
            .map(|i| u64::from((samples[i] - samples[i + period]).unsigned_abs()))
            .sum();
        if best == 0 || diff * (best as u64) < min_diff * (period as u64) {
            min_diff = diff;
            best = period;
        }
    }
    best.max(1)
}
