//! Streaming sample-rate conversion for the output path.
//!
//! Used by the direct sink when the device runs at a different rate than the track, or
//! after the decoder reports a mid-stream rate change. Wraps Rubato's asynchronous sinc
//! resampler with fixed-size input chunks; callers feed arbitrary slices and the converter
//! buffers the remainder.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::{PlayerError, Result};

/// Interleaved `f32` rate converter with a fixed input chunk size.
pub struct RateConverter {
    resampler: Async<f32>,
    channels: usize,
    chunk_frames: usize,
    pending: Vec<f32>,
    scratch: Vec<f32>,
}

impl RateConverter {
    pub fn new(from_hz: u32, to_hz: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        if from_hz == 0 || to_hz == 0 || channels == 0 {
            return Err(PlayerError::invalid_argument(format!(
                "can't convert {from_hz} Hz -> {to_hz} Hz with {channels} channels"
            )));
        }
        let chunk_frames = chunk_frames.max(1);
        let ratio = f64::from(to_hz) / f64::from(from_hz);

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let resampler = Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| PlayerError::Output(format!("resampler init: {e}")))?;

        let out_frames = (chunk_frames as f64 * ratio * 1.5).ceil() as usize + 64;
        tracing::info!(from_hz, to_hz, channels, chunk_frames, "rate converter ready");
        Ok(Self {
            resampler,
            channels,
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * channels),
            scratch: vec![0.0; out_frames * channels],
        })
    }

    /// Convert `input`, appending every completed output frame to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        self.pending.extend_from_slice(input);
        let chunk = self.chunk_frames * self.channels;
        let mut start = 0;
        while self.pending.len() - start >= chunk {
            convert_block(
                &mut self.resampler,
                &self.pending[start..start + chunk],
                self.channels,
                None,
                &mut self.scratch,
                out,
            )?;
            start += chunk;
        }
        self.pending.drain(..start);
        Ok(())
    }

    /// Convert whatever is still buffered as a final partial chunk.
    pub fn finish(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let frames = self.pending.len() / self.channels;
        if frames == 0 {
            self.pending.clear();
            return Ok(());
        }
        let mut block = std::mem::take(&mut self.pending);
        block.resize(self.chunk_frames * self.channels, 0.0);
        let result = convert_block(
            &mut self.resampler,
            &block,
            self.channels,
            Some(frames),
            &mut self.scratch,
            out,
        );
        block.clear();
        self.pending = block;
        result
    }

    /// Drop buffered input without converting it.
    pub fn discard(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }
}

fn convert_block(
    resampler: &mut Async<f32>,
    input: &[f32],
    channels: usize,
    partial_len: Option<usize>,
    scratch: &mut [f32],
    out: &mut Vec<f32>,
) -> Result<()> {
    let in_frames = input.len() / channels;
    let input_adapter = InterleavedSlice::new(input, channels, in_frames)
        .map_err(|e| PlayerError::Output(format!("resampler input: {e}")))?;
    let out_capacity = scratch.len() / channels;
    let mut output_adapter = InterleavedSlice::new_mut(scratch, channels, out_capacity)
        .map_err(|e| PlayerError::Output(format!("resampler output: {e}")))?;

    let indexing = Indexing {
        input_offset: 0,
        output_offset: 0,
        active_channels_mask: None,
        partial_len,
    };
    let (_nbr_in, nbr_out) = resampler
        .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
        .map_err(|e| PlayerError::Output(format!("resampler process: {e}")))?;

    out.extend_from_slice(&scratch[..nbr_out * channels]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_rates() {
        assert!(matches!(
            RateConverter::new(0, 48_000, 2, 256),
            Err(PlayerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn upsampling_scales_frame_count() {
        let mut conv = RateConverter::new(24_000, 48_000, 1, 256).unwrap();
        let input: Vec<f32> = (0..24_000).map(|i| ((i as f32) * 0.01).sin() * 0.5).collect();
        let mut out = Vec::new();
        for block in input.chunks(1000) {
            conv.process(block, &mut out).unwrap();
        }
        conv.finish(&mut out).unwrap();
        let ratio = out.len() as f64 / input.len() as f64;
        assert!((ratio - 2.0).abs() < 0.05, "ratio {ratio}");
    }

    #[test]
    fn stereo_output_stays_interleaved() {
        let mut conv = RateConverter::new(44_100, 48_000, 2, 512).unwrap();
        let input = vec![0.25f32; 2 * 4410];
        let mut out = Vec::new();
        conv.process(&input, &mut out).unwrap();
        conv.finish(&mut out).unwrap();
        assert_eq!(out.len() % 2, 0);
        assert!(!out.is_empty());
    }

    #[test]
    fn input_below_one_chunk_is_held_until_finish() {
        let mut conv = RateConverter::new(44_100, 48_000, 1, 1024).unwrap();
        let mut out = Vec::new();
        conv.process(&[0.1; 100], &mut out).unwrap();
        assert!(out.is_empty());
        conv.finish(&mut out).unwrap();
        assert!(!out.is_empty());
    }
}
