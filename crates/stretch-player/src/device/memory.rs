//! Headless output device.
//!
//! Accepts samples without touching audio hardware and records what happened in a shared
//! [`MemoryDeviceStats`]. With pacing enabled, writes block so that playback takes roughly
//! as long as it would on a real device.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::{DeviceOpener, FALLBACK_MIN_BUFFER_FRAMES, PcmDevice};
use crate::error::{PlayerError, Result};
use crate::format::TrackFormat;

/// Counters shared by every device a [`MemoryDeviceOpener`] creates.
#[derive(Clone, Debug, Default)]
pub struct MemoryDeviceStats {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    opened: AtomicUsize,
    released: AtomicUsize,
    written_samples: AtomicU64,
    discarded_samples: AtomicU64,
    drains: AtomicUsize,
    output_rate: AtomicU32,
    captured: Mutex<Vec<f32>>,
}

impl MemoryDeviceStats {
    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Devices opened and not yet released.
    pub fn live(&self) -> usize {
        self.opened().saturating_sub(self.released())
    }

    /// Samples accepted by `write`, across all devices.
    pub fn written_samples(&self) -> u64 {
        self.inner.written_samples.load(Ordering::SeqCst)
    }

    pub fn discarded_samples(&self) -> u64 {
        self.inner.discarded_samples.load(Ordering::SeqCst)
    }

    pub fn drains(&self) -> usize {
        self.inner.drains.load(Ordering::SeqCst)
    }

    /// Rate of the most recently opened device.
    pub fn output_rate(&self) -> u32 {
        self.inner.output_rate.load(Ordering::SeqCst)
    }

    /// Samples recorded when capture is enabled.
    pub fn captured(&self) -> Vec<f32> {
        self.inner
            .captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Opens [`MemoryDeviceStats`]-backed devices.
#[derive(Clone, Debug, Default)]
pub struct MemoryDeviceOpener {
    stats: MemoryDeviceStats,
    output_rate: Option<u32>,
    realtime: bool,
    capture: bool,
}

impl MemoryDeviceOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the device at a fixed rate instead of the track rate.
    pub fn with_output_rate(mut self, rate: u32) -> Self {
        self.output_rate = Some(rate);
        self
    }

    /// Block writes so samples are consumed at the output rate.
    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    /// Keep a copy of every written sample.
    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn stats(&self) -> MemoryDeviceStats {
        self.stats.clone()
    }
}

impl DeviceOpener for MemoryDeviceOpener {
    fn open(&self, format: TrackFormat, buffer_min_magnitude: usize) -> Result<Box<dyn PcmDevice>> {
        let rate = self.output_rate.unwrap_or(format.sample_rate);
        if rate == 0 {
            return Err(PlayerError::Output("memory device rate is zero".to_string()));
        }
        let channels = usize::from(format.channels.max(1));
        let min_buffer_samples = FALLBACK_MIN_BUFFER_FRAMES * buffer_min_magnitude * channels;

        self.stats.inner.opened.fetch_add(1, Ordering::SeqCst);
        self.stats.inner.output_rate.store(rate, Ordering::SeqCst);
        tracing::debug!(rate_hz = rate, channels, min_buffer_samples, "memory device opened");

        Ok(Box::new(MemoryDevice {
            stats: self.stats.clone(),
            rate,
            channels,
            min_buffer_samples,
            pacer: self.realtime.then(Pacer::default),
            capture: self.capture,
            playing: false,
            released: false,
        }))
    }
}

struct MemoryDevice {
    stats: MemoryDeviceStats,
    rate: u32,
    channels: usize,
    min_buffer_samples: usize,
    pacer: Option<Pacer>,
    capture: bool,
    playing: bool,
    released: bool,
}

/// Wall-clock schedule for a paced device.
#[derive(Default)]
struct Pacer {
    started: Option<Instant>,
    frames: u64,
}

impl MemoryDevice {
    fn ensure_open(&self) -> Result<()> {
        if self.released {
            return Err(PlayerError::invalid_state("memory device released"));
        }
        Ok(())
    }

    fn buffer_duration(&self) -> Duration {
        let frames = (self.min_buffer_samples / self.channels) as f64;
        Duration::from_secs_f64(frames / f64::from(self.rate))
    }

    /// Sleep until the device would have room for `frames` more frames.
    fn pace(&mut self, frames: u64) {
        let rate = f64::from(self.rate);
        let slack = self.buffer_duration();
        let Some(pacer) = self.pacer.as_mut() else {
            return;
        };
        let now = Instant::now();
        let started = *pacer.started.get_or_insert(now);
        let played_until = started + Duration::from_secs_f64(pacer.frames as f64 / rate);
        if played_until < now {
            // Underrun (for example after a pause): restart the schedule from now.
            pacer.started = Some(now - Duration::from_secs_f64(pacer.frames as f64 / rate));
        }
        pacer.frames += frames;
        let due = pacer.started.unwrap_or(now) + Duration::from_secs_f64(pacer.frames as f64 / rate);
        if let Some(wait) = due.checked_duration_since(now + slack) {
            thread::sleep(wait);
        }
    }
}

impl PcmDevice for MemoryDevice {
    fn output_rate(&self) -> u32 {
        self.rate
    }

    fn min_buffer_samples(&self) -> usize {
        self.min_buffer_samples
    }

    fn play(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.playing = true;
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) -> Result<()> {
        self.ensure_open()?;
        if !self.playing {
            return Err(PlayerError::invalid_state("memory device not started"));
        }
        self.pace((samples.len() / self.channels) as u64);
        self.stats
            .inner
            .written_samples
            .fetch_add(samples.len() as u64, Ordering::SeqCst);
        if self.capture {
            self.stats
                .inner
                .captured
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(samples);
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.stats.inner.drains.fetch_add(1, Ordering::SeqCst);
        if let Some(pacer) = &self.pacer
            && let Some(started) = pacer.started
        {
            let end = started + Duration::from_secs_f64(pacer.frames as f64 / f64::from(self.rate));
            if let Some(wait) = end.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }
        Ok(())
    }

    fn discard(&mut self) {
        if self.released {
            return;
        }
        // Only a paced device has anything still "queued": the slack it runs ahead by.
        if let Some(pacer) = &self.pacer
            && let Some(started) = pacer.started
        {
            let played = started.elapsed().as_secs_f64() * f64::from(self.rate);
            let queued = (pacer.frames as f64 - played).max(0.0) as u64;
            self.stats
                .inner
                .discarded_samples
                .fetch_add(queued * self.channels as u64, Ordering::SeqCst);
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.playing = false;
            self.stats.inner.released.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("memory device released");
        }
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_written_samples_and_lifecycle() {
        let opener = MemoryDeviceOpener::new().capture();
        let stats = opener.stats();
        let mut dev = opener.open(TrackFormat::new(44_100, 2), 4).unwrap();
        assert_eq!(dev.output_rate(), 44_100);
        assert_eq!(dev.min_buffer_samples(), FALLBACK_MIN_BUFFER_FRAMES * 4 * 2);
        assert!(dev.write(&[0.0; 4]).is_err());

        dev.play().unwrap();
        dev.write(&[0.5; 8]).unwrap();
        assert_eq!(stats.written_samples(), 8);
        assert_eq!(stats.captured(), vec![0.5; 8]);
        assert_eq!(stats.live(), 1);

        dev.release();
        assert!(matches!(dev.write(&[0.0; 2]), Err(PlayerError::InvalidState(_))));
        drop(dev);
        assert_eq!(stats.released(), 1);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn output_rate_override() {
        let opener = MemoryDeviceOpener::new().with_output_rate(48_000);
        let dev = opener.open(TrackFormat::new(22_050, 1), 4).unwrap();
        assert_eq!(dev.output_rate(), 48_000);
        assert_eq!(opener.stats().output_rate(), 48_000);
    }

    #[test]
    fn realtime_device_paces_writes() {
        let opener = MemoryDeviceOpener::new().realtime();
        let mut dev = opener.open(TrackFormat::new(8_000, 1), 4).unwrap();
        dev.play().unwrap();
        let start = Instant::now();
        // 0.25 s of audio, of which 1024 frames (0.128 s) fit in the device buffer.
        for _ in 0..10 {
            dev.write(&[0.0; 200]).unwrap();
        }
        dev.drain().unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
    }
}
