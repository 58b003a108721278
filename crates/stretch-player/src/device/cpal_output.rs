//! CPAL-backed output device.
//!
//! Writes land in a bounded [`SampleQueue`]; the real-time callback drains it without
//! blocking, maps the track's channel layout onto the device's, and converts to the device
//! sample format. Underruns are filled with silence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use cpal::traits::{DeviceTrait, StreamTrait};

use super::{
    DeviceOpener, PcmDevice, min_buffer_frames, pick_buffer_size, pick_device, pick_output_config,
};
use crate::error::{PlayerError, Result};
use crate::format::TrackFormat;
use crate::queue::SampleQueue;

/// Time left for the hardware buffer after the callback has handed over the last frame.
const SETTLE: Duration = Duration::from_millis(100);
const PLAYOUT_POLL: Duration = Duration::from_millis(5);

/// Opens the named (or default) CPAL output device.
#[derive(Clone, Debug, Default)]
pub struct CpalDeviceOpener {
    device_name: Option<String>,
    refill_max_frames: usize,
}

impl CpalDeviceOpener {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            refill_max_frames: 4096,
        }
    }

    /// Max frames the callback pulls from the queue per refill.
    pub fn with_refill_max_frames(mut self, frames: usize) -> Self {
        self.refill_max_frames = frames.max(1);
        self
    }

    fn open_stream(&self, format: TrackFormat, magnitude: usize) -> anyhow::Result<CpalDevice> {
        let host = cpal::default_host();
        let device = pick_device(&host, self.device_name.as_deref())?;
        let supported = pick_output_config(&device, format)?;

        let channels = usize::from(format.channels);
        let min_buffer_samples = min_buffer_frames(&supported) * magnitude * channels;

        let mut config: cpal::StreamConfig = supported.config();
        if let Some(buffer_size) = pick_buffer_size(&supported) {
            config.buffer_size = buffer_size;
        }

        let queue = Arc::new(SampleQueue::new(channels, min_buffer_samples));
        let paused = Arc::new(AtomicBool::new(true));
        let played_frames = Arc::new(AtomicU64::new(0));
        let stream = build_output_stream(
            &device,
            &config,
            supported.sample_format(),
            CallbackShared {
                queue: queue.clone(),
                paused: paused.clone(),
                played_frames: played_frames.clone(),
                refill_max_frames: self.refill_max_frames.max(1),
            },
        )?;

        tracing::info!(
            device = %device.description().map(|d| d.name().to_string()).unwrap_or_default(),
            rate_hz = config.sample_rate,
            device_channels = config.channels,
            track_channels = format.channels,
            sample_format = ?supported.sample_format(),
            min_buffer_samples,
            "output device opened"
        );

        Ok(CpalDevice {
            stream: Some(stream),
            queue,
            paused,
            played_frames,
            written_frames: 0,
            rate: config.sample_rate,
            min_buffer_samples,
        })
    }
}

impl DeviceOpener for CpalDeviceOpener {
    fn open(&self, format: TrackFormat, buffer_min_magnitude: usize) -> Result<Box<dyn PcmDevice>> {
        let device = self
            .open_stream(format, buffer_min_magnitude)
            .map_err(|e| PlayerError::Output(format!("{e:#}")))?;
        Ok(Box::new(device))
    }
}

struct CpalDevice {
    stream: Option<cpal::Stream>,
    queue: Arc<SampleQueue>,
    paused: Arc<AtomicBool>,
    played_frames: Arc<AtomicU64>,
    /// Frames accepted by `write` and not discarded.
    written_frames: u64,
    rate: u32,
    min_buffer_samples: usize,
}

impl CpalDevice {
    fn stream(&self) -> Result<&cpal::Stream> {
        self.stream
            .as_ref()
            .ok_or_else(|| PlayerError::invalid_state("output device released"))
    }
}

impl PcmDevice for CpalDevice {
    fn output_rate(&self) -> u32 {
        self.rate
    }

    fn min_buffer_samples(&self) -> usize {
        self.min_buffer_samples
    }

    fn play(&mut self) -> Result<()> {
        self.stream()?
            .play()
            .map_err(|e| PlayerError::Output(format!("stream play: {e}")))?;
        self.paused.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) -> Result<()> {
        self.stream()?;
        if self.queue.push_blocking(samples) {
            self.written_frames += (samples.len() / self.queue.channels()) as u64;
            Ok(())
        } else {
            Err(PlayerError::invalid_state("output device released"))
        }
    }

    /// Wait until the callback has consumed every written frame, then let the hardware
    /// buffer play out.
    fn drain(&mut self) -> Result<()> {
        self.stream()?;
        let pending = self
            .written_frames
            .saturating_sub(self.played_frames.load(Ordering::Relaxed));
        let budget = Duration::from_millis(pending * 1000 / u64::from(self.rate.max(1)))
            + Duration::from_secs(1);
        let deadline = Instant::now() + budget;

        let drained = self.queue.wait_drained(budget)
            && wait_for_playout(&self.played_frames, self.written_frames, deadline);
        if !drained {
            tracing::warn!(
                remaining_samples = self.queue.len(),
                written_frames = self.written_frames,
                played_frames = self.played_frames.load(Ordering::Relaxed),
                "output did not drain in time"
            );
        }
        thread::sleep(SETTLE);
        Ok(())
    }

    fn discard(&mut self) {
        let dropped = self.queue.discard();
        self.written_frames = self
            .written_frames
            .saturating_sub((dropped / self.queue.channels()) as u64);
        if dropped > 0 {
            tracing::debug!(dropped_samples = dropped, "discarded queued output");
        }
    }

    fn release(&mut self) {
        self.paused.store(true, Ordering::Relaxed);
        self.queue.close();
        self.queue.discard();
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                tracing::debug!("stream pause on release: {e}");
            }
            drop(stream);
            tracing::info!(
                played_frames = self.played_frames.load(Ordering::Relaxed),
                "output device released"
            );
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.release();
    }
}

/// State shared between the device handle and its callback.
struct CallbackShared {
    queue: Arc<SampleQueue>,
    paused: Arc<AtomicBool>,
    played_frames: Arc<AtomicU64>,
    refill_max_frames: usize,
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    shared: CallbackShared,
) -> anyhow::Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, shared),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, shared),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, shared),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, shared),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: CallbackShared,
) -> anyhow::Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let dst_channels = usize::from(config.channels).max(1);
    let src_channels = shared.queue.channels();
    let mut buf = CallbackBuffer {
        src: Vec::with_capacity(shared.refill_max_frames * src_channels),
        pos: 0,
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
            if shared.paused.load(Ordering::Relaxed) {
                data.fill(silence);
                return;
            }
            let frames = data.len() / dst_channels;
            let mut filled = 0usize;

            for frame in 0..frames {
                if buf.pos >= buf.src.len() {
                    buf.src.clear();
                    buf.pos = 0;
                    if shared
                        .queue
                        .pop_into(&mut buf.src, shared.refill_max_frames)
                        == 0
                    {
                        data[frame * dst_channels..].fill(silence);
                        break;
                    }
                }
                let start = buf.pos;
                for ch in 0..dst_channels {
                    let s = map_channel(&buf.src[start..start + src_channels], dst_channels, ch);
                    data[frame * dst_channels + ch] = <T as cpal::Sample>::from_sample::<f32>(s);
                }
                buf.pos += src_channels;
                filled += 1;
            }

            if filled > 0 {
                shared
                    .played_frames
                    .fetch_add(filled as u64, Ordering::Relaxed);
            }
        },
        |err| tracing::warn!("stream error: {err}"),
        None,
    )?;

    Ok(stream)
}

/// Poll until `played` reaches `target` frames. Returns `false` at `deadline`.
fn wait_for_playout(played: &AtomicU64, target: u64, deadline: Instant) -> bool {
    loop {
        if played.load(Ordering::Relaxed) >= target {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(PLAYOUT_POLL.min(deadline - now));
    }
}

/// Samples pulled from the queue but not yet handed to the device.
struct CallbackBuffer {
    src: Vec<f32>,
    pos: usize,
}

/// Output sample for `dst_ch` from one source frame.
///
/// Mono is duplicated to every output channel, stereo is averaged down to mono, and extra
/// device channels beyond stereo get silence.
fn map_channel(frame: &[f32], dst_channels: usize, dst_ch: usize) -> f32 {
    match (frame.len(), dst_channels) {
        (1, _) => frame[0],
        (2, 1) => 0.5 * (frame[0] + frame[1]),
        (n, _) if dst_ch < n => frame[dst_ch],
        _ => 0.0,
    }
}
