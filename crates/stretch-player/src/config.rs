/// Playback tuning parameters shared by the decode, stretch and output stages.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Decoder chunk size in samples, used until the sink asks for its own minimum.
    pub decoder_buffer_samples: usize,
    /// Output buffer size as a multiple of the device's minimum viable buffer.
    ///
    /// Values below [`MIN_BUFFER_MAGNITUDE`] are raised to it.
    pub buffer_min_magnitude: usize,
    /// Initial size (samples) of the stretching sink's scratch buffer.
    pub stretch_scratch_samples: usize,
    /// Resampler input chunk size in frames, used when the device rate differs from the track.
    pub resample_chunk_frames: usize,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
}

/// Smallest accepted multiple of the device minimum buffer.
pub const MIN_BUFFER_MAGNITUDE: usize = 4;

impl PlayerConfig {
    /// Buffer multiple after applying the lower bound.
    pub fn effective_buffer_magnitude(&self) -> usize {
        self.buffer_min_magnitude.max(MIN_BUFFER_MAGNITUDE)
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            decoder_buffer_samples: 2048,
            buffer_min_magnitude: MIN_BUFFER_MAGNITUDE,
            stretch_scratch_samples: 1024,
            resample_chunk_frames: 1024,
            refill_max_frames: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_magnitude_is_never_below_minimum() {
        let mut cfg = PlayerConfig::default();
        cfg.buffer_min_magnitude = 1;
        assert_eq!(cfg.effective_buffer_magnitude(), MIN_BUFFER_MAGNITUDE);
        cfg.buffer_min_magnitude = 8;
        assert_eq!(cfg.effective_buffer_magnitude(), 8);
    }
}
