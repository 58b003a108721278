//! Output devices.
//!
//! A sink never talks to CPAL directly; it asks a [`DeviceOpener`] for a [`PcmDevice`]
//! matching the track format. Two openers ship with the crate:
//! - [`CpalDeviceOpener`]: a real output stream fed through a bounded queue
//! - [`MemoryDeviceOpener`]: headless, counts what it is given (tests, `--null-output`)
//!
//! The free functions below are the CPAL device/config selection helpers.

mod cpal_output;
mod memory;

pub use cpal_output::CpalDeviceOpener;
pub use memory::{MemoryDeviceOpener, MemoryDeviceStats};

use anyhow::{Context, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::Result;
use crate::format::TrackFormat;

/// Frames assumed for the device minimum when the host does not report one.
pub const FALLBACK_MIN_BUFFER_FRAMES: usize = 256;

/// An opened output device accepting interleaved `f32` samples in the track's channel
/// layout, at [`PcmDevice::output_rate`].
///
/// Devices are created and used on one thread (CPAL streams are not `Send`).
pub trait PcmDevice {
    /// Rate the device actually runs at; may differ from the requested track rate.
    fn output_rate(&self) -> u32;

    /// Size of the device-side buffer in samples, already scaled by the buffer magnitude.
    fn min_buffer_samples(&self) -> usize;

    /// Start consuming written samples.
    fn play(&mut self) -> Result<()>;

    /// Queue samples for playback, blocking while the device buffer is full.
    fn write(&mut self, samples: &[f32]) -> Result<()>;

    /// Block until everything written has been consumed.
    fn drain(&mut self) -> Result<()>;

    /// Drop queued samples without playing them.
    fn discard(&mut self);

    /// Stop the device and give it back to the host. Further writes fail.
    fn release(&mut self);
}

/// Factory for [`PcmDevice`]s, shared between the player and its sessions.
pub trait DeviceOpener: Send + Sync {
    /// Open a device for `format`, sizing its buffer to `buffer_min_magnitude` times the
    /// platform minimum.
    fn open(&self, format: TrackFormat, buffer_min_magnitude: usize) -> Result<Box<dyn PcmDevice>>;
}

/// Pick a CPAL output device.
///
/// With `needle`, the first device whose name contains it (case-insensitive); otherwise the
/// host default.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> anyhow::Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .map(|desc| matches_device_name(&desc.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the supported config closest to the track format.
///
/// Ranking, in order: a range that contains the track rate, a range with the track's
/// channel count, the higher rate, then the better sample format.
pub fn pick_output_config(
    device: &cpal::Device,
    format: TrackFormat,
) -> anyhow::Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(ConfigRank, cpal::SupportedStreamConfig)> = None;

    for range in device.supported_output_configs()? {
        let rate = pick_rate_for_range(
            range.min_sample_rate(),
            range.max_sample_rate(),
            format.sample_rate,
        );
        let rank = ConfigRank {
            exact_rate: rate == format.sample_rate,
            same_channels: range.channels() == format.channels,
            rate,
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = best.as_ref().is_none_or(|(b, _)| rank.is_better_than(b));
        if replace {
            best = Some((rank, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Fixed buffer size for the stream if the device advertises a range, capped to keep
/// latency bounded. `None` leaves the host default.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 4096;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            let chosen = (*max).min(MAX_FRAMES).max(*min);
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Smallest viable buffer for `config`, in frames.
pub fn min_buffer_frames(config: &cpal::SupportedStreamConfig) -> usize {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, .. } => {
            (*min as usize).max(FALLBACK_MIN_BUFFER_FRAMES)
        }
        cpal::SupportedBufferSize::Unknown => FALLBACK_MIN_BUFFER_FRAMES,
    }
}

/// Names of the host's output devices, in host order.
pub fn list_devices(host: &cpal::Host) -> anyhow::Result<Vec<String>> {
    let devices = host.output_devices().context("No output devices")?;
    let mut names = Vec::new();
    for d in devices {
        names.push(d.description()?.name().to_string());
    }
    Ok(names)
}

#[derive(Clone, Copy, Debug)]
struct ConfigRank {
    exact_rate: bool,
    same_channels: bool,
    rate: u32,
    format_rank: u8,
}

impl ConfigRank {
    fn is_better_than(&self, other: &ConfigRank) -> bool {
        if self.exact_rate != other.exact_rate {
            self.exact_rate
        } else if self.same_channels != other.same_channels {
            self.same_channels
        } else if self.rate != other.rate {
            self.rate > other.rate
        } else {
            self.format_rank < other.format_rank
        }
    }
}

fn pick_rate_for_range(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I16 => 1,
        cpal::SampleFormat::I32 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rank(exact_rate: bool, same_channels: bool, rate: u32, format_rank: u8) -> ConfigRank {
        ConfigRank {
            exact_rate,
            same_channels,
            rate,
            format_rank,
        }
    }

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", " USB "));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", "   "));
    }

    #[test]
    fn rate_is_clamped_into_range() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, 48_000), 48_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, 22_050), 44_100);
        assert_eq!(pick_rate_for_range(44_100, 96_000, 192_000), 96_000);
        assert_eq!(pick_rate_for_range(48_000, 48_000, 44_100), 48_000);
    }

    #[test]
    fn exact_rate_beats_channel_match() {
        assert!(rank(true, false, 44_100, 3).is_better_than(&rank(false, true, 48_000, 0)));
    }

    #[test]
    fn channel_match_beats_higher_rate() {
        assert!(rank(false, true, 44_100, 1).is_better_than(&rank(false, false, 96_000, 0)));
    }

    #[test]
    fn sample_format_breaks_ties() {
        assert!(rank(true, true, 48_000, 0).is_better_than(&rank(true, true, 48_000, 1)));
        assert!(!rank(true, true, 48_000, 1).is_better_than(&rank(true, true, 48_000, 1)));
    }
}
