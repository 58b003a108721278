//! Output sinks.
//!
//! [`OutputSink`] is chosen once at construction:
//! - [`DirectSink`] converts `i16` chunks to `f32` (resampling if the device runs at a
//!   different rate) and writes them to a [`PcmDevice`]
//! - [`StretchingSink`] runs chunks through a [`TimeStretchProcessor`] first
//!
//! Every sink is `Ready → Started → Stopped`; once stopped, every call fails with
//! [`PlayerError::InvalidState`] and the device is never reopened.

use std::sync::Arc;

use crate::config::PlayerConfig;
use crate::decode::DecodeListener;
use crate::device::{DeviceOpener, PcmDevice};
use crate::error::{PlayerError, Result};
use crate::format::{PcmChunk, SharedParameters, TrackFormat, i16_to_f32_into};
use crate::resample::RateConverter;
use crate::stretch::TimeStretchProcessor;

/// Which sink variant to build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkKind {
    Direct,
    Stretching,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SinkState {
    Ready,
    Started,
    Stopped,
}

/// Passthrough sink writing straight to the device.
pub struct DirectSink {
    device: Option<Box<dyn PcmDevice>>,
    format: TrackFormat,
    state: SinkState,
    min_buffer_samples: usize,
    chunk_frames: usize,
    converter: Option<RateConverter>,
    f32_buf: Vec<f32>,
    converted: Vec<f32>,
}

impl DirectSink {
    /// Open the device for `format`.
    ///
    /// Fails with [`PlayerError::InvalidArgument`] before touching the device when the
    /// channel count is not 1 or 2.
    pub fn open(format: TrackFormat, opener: &dyn DeviceOpener, config: &PlayerConfig) -> Result<Self> {
        format.validate_output()?;
        let device = opener.open(format, config.effective_buffer_magnitude())?;
        let min_buffer_samples = device.min_buffer_samples();
        let converter = converter_for(format, device.output_rate(), config.resample_chunk_frames)?;

        tracing::info!(
            rate_hz = format.sample_rate,
            channels = format.channels,
            device_rate_hz = device.output_rate(),
            min_buffer_samples,
            "sink opened"
        );
        Ok(Self {
            device: Some(device),
            format,
            state: SinkState::Ready,
            min_buffer_samples,
            chunk_frames: config.resample_chunk_frames,
            converter,
            f32_buf: Vec::new(),
            converted: Vec::new(),
        })
    }

    pub fn format(&self) -> TrackFormat {
        self.format
    }

    /// Minimum output buffer in samples (a multiple of the device minimum).
    pub fn min_buffer_samples(&self) -> usize {
        self.min_buffer_samples
    }

    pub fn is_stopped(&self) -> bool {
        self.state == SinkState::Stopped
    }

    fn device(&mut self) -> Result<&mut Box<dyn PcmDevice>> {
        match (self.state, self.device.as_mut()) {
            (SinkState::Stopped, _) | (_, None) => {
                Err(PlayerError::invalid_state("output sink is stopped"))
            }
            (_, Some(device)) => Ok(device),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state == SinkState::Started {
            return Ok(());
        }
        self.device()?.play()?;
        self.state = SinkState::Started;
        Ok(())
    }

    fn ensure_started(&mut self) -> Result<()> {
        self.device()?;
        if self.state != SinkState::Started {
            return Err(PlayerError::invalid_state("output sink not started"));
        }
        Ok(())
    }

    /// Write interleaved samples, blocking while the device is full.
    pub fn write(&mut self, samples: &[i16]) -> Result<()> {
        self.ensure_started()?;
        self.f32_buf.clear();
        i16_to_f32_into(samples, &mut self.f32_buf);
        match self.converter.as_mut() {
            Some(converter) => {
                self.converted.clear();
                converter.process(&self.f32_buf, &mut self.converted)?;
                if !self.converted.is_empty() {
                    write_device(&mut self.device, &self.converted)?;
                }
            }
            None => write_device(&mut self.device, &self.f32_buf)?,
        }
        Ok(())
    }

    /// Switch the input rate, converting to the device rate from here on.
    pub fn set_sample_rate(&mut self, rate: u32) -> Result<()> {
        let device_rate = self.device()?.output_rate();
        if rate == 0 {
            return Err(PlayerError::invalid_argument("sample rate must be positive"));
        }
        if rate == self.format.sample_rate {
            return Ok(());
        }
        self.flush_converter()?;
        let next = TrackFormat::new(rate, self.format.channels);
        self.converter = converter_for(next, device_rate, self.chunk_frames)?;
        tracing::info!(
            from_hz = self.format.sample_rate,
            to_hz = rate,
            device_rate_hz = device_rate,
            "sink input rate changed"
        );
        self.format = next;
        Ok(())
    }

    /// Play out everything written so far, then stop.
    pub fn finish(&mut self) -> Result<()> {
        self.device()?;
        if self.state == SinkState::Started {
            self.flush_converter()?;
            self.device()?.drain()?;
        }
        self.stop()
    }

    /// Discard queued audio and release the device.
    pub fn stop(&mut self) -> Result<()> {
        let device = self.device()?;
        device.discard();
        device.release();
        self.device = None;
        self.state = SinkState::Stopped;
        if let Some(converter) = self.converter.as_mut() {
            converter.discard();
        }
        tracing::debug!("sink stopped");
        Ok(())
    }

    fn flush_converter(&mut self) -> Result<()> {
        let Some(converter) = self.converter.as_mut() else {
            return Ok(());
        };
        self.converted.clear();
        converter.finish(&mut self.converted)?;
        if self.state == SinkState::Started && !self.converted.is_empty() {
            write_device(&mut self.device, &self.converted)?;
        }
        Ok(())
    }
}

fn write_device(device: &mut Option<Box<dyn PcmDevice>>, samples: &[f32]) -> Result<()> {
    match device.as_mut() {
        Some(device) => device.write(samples),
        None => Err(PlayerError::invalid_state("output sink is stopped")),
    }
}

fn converter_for(
    format: TrackFormat,
    device_rate: u32,
    chunk_frames: usize,
) -> Result<Option<RateConverter>> {
    if device_rate == format.sample_rate {
        return Ok(None);
    }
    RateConverter::new(
        format.sample_rate,
        device_rate,
        usize::from(format.channels),
        chunk_frames,
    )
    .map(Some)
}

/// Sink that time-stretches before writing to a [`DirectSink`].
pub struct StretchingSink {
    inner: DirectSink,
    processor: TimeStretchProcessor,
    params: Arc<SharedParameters>,
    applied_generation: Option<u64>,
    scratch: Vec<i16>,
}

impl StretchingSink {
    pub fn open(
        format: TrackFormat,
        opener: &dyn DeviceOpener,
        params: Arc<SharedParameters>,
        config: &PlayerConfig,
    ) -> Result<Self> {
        format.validate_output()?;
        let processor = TimeStretchProcessor::new(format.sample_rate, format.channels)?;
        let inner = DirectSink::open(format, opener, config)?;
        Ok(Self {
            inner,
            processor,
            params,
            applied_generation: None,
            scratch: vec![0; config.stretch_scratch_samples.max(1)],
        })
    }

    pub fn min_buffer_samples(&self) -> usize {
        self.inner.min_buffer_samples()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    pub fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    pub fn write(&mut self, samples: &[i16]) -> Result<()> {
        self.inner.ensure_started()?;
        self.sync_parameters()?;
        self.processor.put_samples(samples);
        self.drain_processor()
    }

    pub fn set_sample_rate(&mut self, rate: u32) -> Result<()> {
        self.inner.set_sample_rate(rate)?;
        self.processor.set_sample_rate(rate)
    }

    /// Flush the processor tail to the device, play it out, then stop.
    pub fn finish(&mut self) -> Result<()> {
        self.inner.device()?;
        self.processor.flush();
        self.drain_processor()?;
        self.inner.finish()
    }

    /// Flush and drop whatever the processor still holds, then stop the device.
    pub fn stop(&mut self) -> Result<()> {
        self.inner.device()?;
        self.processor.flush();
        self.processor.clear();
        self.inner.stop()
    }

    fn sync_parameters(&mut self) -> Result<()> {
        let generation = self.params.generation();
        if self.applied_generation == Some(generation) {
            return Ok(());
        }
        let params = self.params.snapshot();
        self.processor.set_parameters(params)?;
        self.applied_generation = Some(generation);
        tracing::debug!(
            speed = params.speed,
            pitch = params.pitch,
            rate = params.rate,
            "stretch parameters applied"
        );
        Ok(())
    }

    fn drain_processor(&mut self) -> Result<()> {
        loop {
            let available = self.processor.available_samples();
            if available == 0 {
                return Ok(());
            }
            if available > self.scratch.len() {
                self.scratch.resize(available * 2, 0);
            }
            let n = self.processor.receive_samples(&mut self.scratch[..available]);
            self.inner.write(&self.scratch[..n])?;
        }
    }
}

/// Output stage selected at construction.
pub enum OutputSink {
    Direct(DirectSink),
    Stretching(StretchingSink),
}

impl OutputSink {
    /// Open the sink variant for `kind`. `params` is only read by the stretching variant.
    pub fn open(
        kind: SinkKind,
        format: TrackFormat,
        opener: &dyn DeviceOpener,
        params: Arc<SharedParameters>,
        config: &PlayerConfig,
    ) -> Result<Self> {
        match kind {
            SinkKind::Direct => Ok(Self::Direct(DirectSink::open(format, opener, config)?)),
            SinkKind::Stretching => Ok(Self::Stretching(StretchingSink::open(
                format, opener, params, config,
            )?)),
        }
    }

    pub fn kind(&self) -> SinkKind {
        match self {
            Self::Direct(_) => SinkKind::Direct,
            Self::Stretching(_) => SinkKind::Stretching,
        }
    }

    pub fn min_buffer_samples(&self) -> usize {
        match self {
            Self::Direct(s) => s.min_buffer_samples(),
            Self::Stretching(s) => s.min_buffer_samples(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        match self {
            Self::Direct(s) => s.is_stopped(),
            Self::Stretching(s) => s.is_stopped(),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        match self {
            Self::Direct(s) => s.start(),
            Self::Stretching(s) => s.start(),
        }
    }

    pub fn write(&mut self, samples: &[i16]) -> Result<()> {
        match self {
            Self::Direct(s) => s.write(samples),
            Self::Stretching(s) => s.write(samples),
        }
    }

    pub fn set_sample_rate(&mut self, rate: u32) -> Result<()> {
        match self {
            Self::Direct(s) => s.set_sample_rate(rate),
            Self::Stretching(s) => s.set_sample_rate(rate),
        }
    }

    pub fn finish(&mut self) -> Result<()> {
        match self {
            Self::Direct(s) => s.finish(),
            Self::Stretching(s) => s.finish(),
        }
    }

    pub fn stop(&mut self) -> Result<()> {
        match self {
            Self::Direct(s) => s.stop(),
            Self::Stretching(s) => s.stop(),
        }
    }
}

impl DecodeListener for OutputSink {
    fn on_chunk(&mut self, chunk: &PcmChunk) -> Result<()> {
        self.write(chunk.samples())
    }

    fn on_format_changed(&mut self, sample_rate: u32) -> Result<()> {
        self.set_sample_rate(sample_rate)
    }
}
