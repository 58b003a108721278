//! Test fixtures: in-memory WAV encoding and a scripted codec capability.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::codec::{
    AudioCodec, CodecInput, CodecOutput, CompressedUnit, DecodedUnit, MediaExtractor,
    TrackDescriptor,
};
use crate::decode::Decoder;
use crate::error::{PlayerError, Result};
use crate::format::TrackFormat;

/// Encode interleaved 16-bit PCM as a canonical RIFF/WAVE file.
pub fn wav_bytes(rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let block_align = channels * 2;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&(rate * u32::from(block_align)).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Deterministic sample sequence produced by [`FakeExtractor`] codecs.
pub fn ramp(len: usize) -> Vec<i16> {
    (0..len).map(ramp_value).collect()
}

fn ramp_value(i: usize) -> i16 {
    (i % 16_384) as i16
}

/// Sine wave, interleaved with the same value on every channel.
pub fn sine(rate: u32, channels: u16, freq_hz: f32, frames: usize) -> Vec<i16> {
    let mut out = Vec::with_capacity(frames * usize::from(channels));
    for n in 0..frames {
        let t = n as f32 / rate as f32;
        let v = (t * freq_hz * std::f32::consts::TAU).sin() * 12_000.0;
        for _ in 0..channels {
            out.push(v as i16);
        }
    }
    out
}

/// Script for one track of a [`FakeExtractor`].
#[derive(Clone, Debug)]
pub struct FakeTrack {
    mime: String,
    format: Option<TrackFormat>,
    units: usize,
    samples_per_unit: usize,
    rate_change: Option<(usize, u32)>,
    channel_change: Option<(usize, u16)>,
    offset_at: Option<(usize, usize)>,
}

impl FakeTrack {
    /// Audio track of `units` decoded units with `samples_per_unit` interleaved samples each.
    pub fn audio(rate: u32, channels: u16, units: usize, samples_per_unit: usize) -> Self {
        Self {
            mime: "audio/raw".to_string(),
            format: Some(TrackFormat::new(rate, channels)),
            units,
            samples_per_unit,
            rate_change: None,
            channel_change: None,
            offset_at: None,
        }
    }

    pub fn non_audio(mime: &str) -> Self {
        Self {
            mime: mime.to_string(),
            format: None,
            units: 0,
            samples_per_unit: 0,
            rate_change: None,
            channel_change: None,
            offset_at: None,
        }
    }

    pub fn without_format(mut self) -> Self {
        self.format = None;
        self
    }

    /// Announce a new sample rate before unit `unit`.
    pub fn with_rate_change_at(mut self, unit: usize, rate: u32) -> Self {
        self.rate_change = Some((unit, rate));
        self
    }

    /// Announce a new channel count before unit `unit`.
    pub fn with_channel_change_at(mut self, unit: usize, channels: u16) -> Self {
        self.channel_change = Some((unit, channels));
        self
    }

    /// Report a non-zero data offset for unit `unit`.
    pub fn with_offset_at(mut self, unit: usize, offset: usize) -> Self {
        self.offset_at = Some((unit, offset));
        self
    }

    fn format_at(&self, unit: usize) -> TrackFormat {
        let mut fmt = self.format.unwrap_or(TrackFormat::new(44_100, 2));
        if let Some((at, rate)) = self.rate_change
            && unit >= at
        {
            fmt.sample_rate = rate;
        }
        if let Some((at, channels)) = self.channel_change
            && unit >= at
        {
            fmt.channels = channels;
        }
        fmt
    }
}

/// Scripted [`MediaExtractor`] producing [`ramp`] samples.
pub struct FakeExtractor {
    descriptors: Vec<TrackDescriptor>,
    tracks: Vec<FakeTrack>,
    selected: Option<usize>,
    next_unit: usize,
    codecs_created: Arc<AtomicUsize>,
}

impl FakeExtractor {
    pub fn new(tracks: Vec<FakeTrack>) -> Self {
        let descriptors = tracks
            .iter()
            .enumerate()
            .map(|(index, t)| TrackDescriptor {
                index,
                mime: t.mime.clone(),
                format: t.format,
            })
            .collect();
        Self {
            descriptors,
            tracks,
            selected: None,
            next_unit: 0,
            codecs_created: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of codecs created through this extractor.
    pub fn codecs_created(&self) -> Arc<AtomicUsize> {
        self.codecs_created.clone()
    }
}

impl MediaExtractor for FakeExtractor {
    fn tracks(&self) -> &[TrackDescriptor] {
        &self.descriptors
    }

    fn select_track(&mut self, index: usize) -> Result<()> {
        if index >= self.tracks.len() {
            return Err(PlayerError::invalid_argument(format!("no track {index}")));
        }
        self.selected = Some(index);
        self.next_unit = 0;
        Ok(())
    }

    fn create_codec(&self, index: usize) -> Result<Box<dyn AudioCodec>> {
        let track = self
            .tracks
            .get(index)
            .ok_or_else(|| PlayerError::invalid_argument(format!("no track {index}")))?;
        self.codecs_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCodec {
            track: track.clone(),
            current: track.format_at(0),
            outputs: VecDeque::new(),
            input_done: false,
        }))
    }

    fn read_unit(&mut self) -> Result<Option<CompressedUnit>> {
        let Some(track) = self.selected.and_then(|i| self.tracks.get(i)) else {
            return Err(PlayerError::invalid_state("no track selected"));
        };
        if self.next_unit >= track.units {
            return Ok(None);
        }
        let index = self.next_unit;
        self.next_unit += 1;

        let fmt = track.format_at(index);
        let frames_per_unit = (track.samples_per_unit / usize::from(fmt.channels.max(1))) as u64;
        let timestamp = index as u64 * frames_per_unit;
        Ok(Some(CompressedUnit {
            data: (index as u64).to_le_bytes().to_vec().into_boxed_slice(),
            timestamp,
            duration: frames_per_unit,
            pts_us: timestamp * 1_000_000 / u64::from(fmt.sample_rate.max(1)),
        }))
    }
}

struct FakeCodec {
    track: FakeTrack,
    current: TrackFormat,
    outputs: VecDeque<CodecOutput>,
    input_done: bool,
}

impl AudioCodec for FakeCodec {
    fn can_accept_input(&self) -> bool {
        !self.input_done && self.outputs.len() < 2
    }

    fn queue_input(&mut self, input: CodecInput) -> Result<()> {
        let unit = match input {
            CodecInput::Unit(unit) => unit,
            CodecInput::EndOfStream => {
                self.input_done = true;
                return Ok(());
            }
        };
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&unit.data[..8]);
        let index = u64::from_le_bytes(raw) as usize;

        let fmt = self.track.format_at(index);
        if fmt != self.current {
            self.current = fmt;
            self.outputs.push_back(CodecOutput::FormatChanged(fmt));
        }

        let spu = self.track.samples_per_unit;
        let samples = (index * spu..(index + 1) * spu).map(ramp_value).collect();
        let offset = match self.track.offset_at {
            Some((at, offset)) if at == index => offset,
            _ => 0,
        };
        self.outputs.push_back(CodecOutput::Decoded(DecodedUnit {
            samples,
            offset,
            pts_us: unit.pts_us,
        }));
        Ok(())
    }

    fn dequeue_output(&mut self) -> Result<CodecOutput> {
        match self.outputs.pop_front() {
            Some(out) => Ok(out),
            None if self.input_done => Ok(CodecOutput::EndOfStream),
            None => Ok(CodecOutput::TryAgainLater),
        }
    }
}

/// Decoder over a single scripted audio track.
pub fn fake_decoder(rate: u32, channels: u16, units: usize, samples_per_unit: usize) -> Decoder {
    let fake = FakeExtractor::new(vec![FakeTrack::audio(
        rate,
        channels,
        units,
        samples_per_unit,
    )]);
    match Decoder::from_extractor(Box::new(fake)) {
        Ok(d) => d,
        Err(e) => panic!("fake decoder: {e}"),
    }
}
