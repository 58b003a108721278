//! Codec capability used by the decoder.
//!
//! The decoder only sees two traits:
//! - [`MediaExtractor`]: lists tracks, selects one, and reads its compressed units in order
//! - [`AudioCodec`]: accepts compressed units and hands back decoded PCM, announcing
//!   format changes before the first unit in the new format
//!
//! [`SymphoniaExtractor`] implements both on top of Symphonia's probe and codec registry.

use std::collections::VecDeque;

use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;

use crate::error::{PlayerError, Result};
use crate::format::TrackFormat;
use crate::source::MediaSource;

/// Max decoded units a codec holds before it refuses more input.
const MAX_PENDING_OUTPUTS: usize = 4;

/// Description of one track in a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackDescriptor {
    /// Position in stream order.
    pub index: usize,
    /// Media type, e.g. `audio/mp3`.
    pub mime: String,
    /// Sample rate and channels when the container declares them.
    pub format: Option<TrackFormat>,
}

impl TrackDescriptor {
    pub fn is_audio(&self) -> bool {
        self.mime.starts_with("audio/")
    }
}

/// One compressed unit read from the selected track.
#[derive(Clone, Debug)]
pub struct CompressedUnit {
    pub data: Box<[u8]>,
    /// Timestamp in the track's time base.
    pub timestamp: u64,
    /// Duration in the track's time base.
    pub duration: u64,
    /// Presentation time in microseconds.
    pub pts_us: u64,
}

/// Input queued to a codec.
#[derive(Debug)]
pub enum CodecInput {
    Unit(CompressedUnit),
    EndOfStream,
}

/// Interleaved PCM produced from one compressed unit.
#[derive(Clone, Debug)]
pub struct DecodedUnit {
    pub samples: Vec<i16>,
    /// Start offset of valid data inside `samples`; the pipeline only accepts zero.
    pub offset: usize,
    /// Presentation time in microseconds.
    pub pts_us: u64,
}

/// Result of polling a codec for output.
#[derive(Debug)]
pub enum CodecOutput {
    Decoded(DecodedUnit),
    /// Subsequent units use this format.
    FormatChanged(TrackFormat),
    /// Nothing ready yet; queue more input.
    TryAgainLater,
    /// All input has been decoded and drained.
    EndOfStream,
}

/// Container side of the codec capability.
pub trait MediaExtractor: Send {
    /// Tracks in stream order.
    fn tracks(&self) -> &[TrackDescriptor];

    /// Restrict [`MediaExtractor::read_unit`] to the track at `index`.
    fn select_track(&mut self, index: usize) -> Result<()>;

    /// Create a decoder for the track at `index`.
    fn create_codec(&self, index: usize) -> Result<Box<dyn AudioCodec>>;

    /// Next compressed unit of the selected track, or `None` at end of input.
    fn read_unit(&mut self) -> Result<Option<CompressedUnit>>;
}

/// Decoder side of the codec capability.
pub trait AudioCodec: Send {
    /// Whether the codec has room for another input unit.
    fn can_accept_input(&self) -> bool;

    fn queue_input(&mut self, input: CodecInput) -> Result<()>;

    fn dequeue_output(&mut self) -> Result<CodecOutput>;
}

/// Map Symphonia failures onto the player's error taxonomy.
pub fn map_symphonia_error(err: SymphoniaError) -> PlayerError {
    match err {
        SymphoniaError::IoError(e) => PlayerError::Io(e),
        SymphoniaError::Unsupported(what) => PlayerError::UnsupportedFormat(what.to_string()),
        SymphoniaError::DecodeError(what) => {
            PlayerError::UnsupportedFormat(format!("malformed stream: {what}"))
        }
        SymphoniaError::SeekError(kind) => PlayerError::Io(std::io::Error::other(format!(
            "seek error: {kind:?}"
        ))),
        SymphoniaError::LimitError(what) => {
            PlayerError::UnsupportedFormat(format!("limit exceeded: {what}"))
        }
        SymphoniaError::ResetRequired => {
            PlayerError::InvariantViolation("decoder reset required".to_string())
        }
    }
}

/// Media type for a track, derived from its codec.
fn mime_from_params(params: &CodecParameters) -> String {
    if params.codec == CODEC_TYPE_NULL {
        return "application/octet-stream".to_string();
    }
    let name = codec_name_from_params(params)
        .map(str::to_string)
        .or_else(|| {
            symphonia::default::get_codecs()
                .get_codec(params.codec)
                .map(|d| d.short_name.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());
    format!("audio/{}", name.to_ascii_lowercase())
}

/// Best-effort codec label.
fn codec_name_from_params(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name)
}

fn format_from_params(params: &CodecParameters) -> Option<TrackFormat> {
    let rate = params.sample_rate?;
    let channels = params.channels?.count();
    Some(TrackFormat::new(rate, u16::try_from(channels).ok()?))
}

fn time_base_to_micros(time_base: TimeBase, ts: u64) -> u64 {
    let time = time_base.calc_time(ts);
    time.seconds
        .saturating_mul(1_000_000)
        .saturating_add((time.frac * 1_000_000.0) as u64)
}

/// Symphonia-backed extractor for any container the default probe recognises.
pub struct SymphoniaExtractor {
    format: Box<dyn FormatReader>,
    tracks: Vec<TrackDescriptor>,
    params: Vec<CodecParameters>,
    track_ids: Vec<u32>,
    selected: Option<usize>,
    frames_read: u64,
}

impl SymphoniaExtractor {
    /// Probe `source` and list its tracks.
    pub fn open(source: &MediaSource) -> Result<Self> {
        let stream = source.open_stream()?;
        let mss = MediaSourceStream::new(stream, Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = source.extension_hint() {
            hint.with_extension(&ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(map_symphonia_error)?;

        let format = probed.format;
        let mut tracks = Vec::new();
        let mut params = Vec::new();
        let mut track_ids = Vec::new();
        for (index, track) in format.tracks().iter().enumerate() {
            tracks.push(TrackDescriptor {
                index,
                mime: mime_from_params(&track.codec_params),
                format: format_from_params(&track.codec_params),
            });
            params.push(track.codec_params.clone());
            track_ids.push(track.id);
        }
        tracing::debug!(
            source = %source.describe(),
            tracks = tracks.len(),
            "probed container"
        );

        Ok(Self {
            format,
            tracks,
            params,
            track_ids,
            selected: None,
            frames_read: 0,
        })
    }

    fn params_at(&self, index: usize) -> Result<&CodecParameters> {
        self.params
            .get(index)
            .ok_or_else(|| PlayerError::invalid_argument(format!("no track at index {index}")))
    }
}

impl MediaExtractor for SymphoniaExtractor {
    fn tracks(&self) -> &[TrackDescriptor] {
        &self.tracks
    }

    fn select_track(&mut self, index: usize) -> Result<()> {
        self.params_at(index)?;
        self.selected = Some(index);
        self.frames_read = 0;
        Ok(())
    }

    fn create_codec(&self, index: usize) -> Result<Box<dyn AudioCodec>> {
        let params = self.params_at(index)?;
        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(map_symphonia_error)?;
        Ok(Box::new(SymphoniaCodec {
            decoder,
            track_id: self.track_ids[index],
            reported: format_from_params(params),
            sample_buf: None,
            pending: VecDeque::new(),
            end_of_input: false,
        }))
    }

    fn read_unit(&mut self) -> Result<Option<CompressedUnit>> {
        let Some(index) = self.selected else {
            return Err(PlayerError::invalid_state("no track selected"));
        };
        let track_id = self.track_ids[index];
        let time_base = self.params[index].time_base;
        let sample_rate = self.params[index].sample_rate;

        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    tracing::warn!("container requested a reset; ending input");
                    return Ok(None);
                }
                Err(e) => return Err(map_symphonia_error(e)),
            };
            if packet.track_id() != track_id {
                continue;
            }

            let pts_us = match (time_base, sample_rate) {
                (Some(tb), _) => time_base_to_micros(tb, packet.ts()),
                (None, Some(rate)) if rate > 0 => self.frames_read.saturating_mul(1_000_000) / u64::from(rate),
                _ => 0,
            };
            self.frames_read = self.frames_read.saturating_add(packet.dur());

            return Ok(Some(CompressedUnit {
                timestamp: packet.ts(),
                duration: packet.dur(),
                pts_us,
                data: packet.data,
            }));
        }
    }
}

/// Symphonia decoder adapted to the push/pull codec contract.
struct SymphoniaCodec {
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    reported: Option<TrackFormat>,
    sample_buf: Option<SampleBuffer<i16>>,
    pending: VecDeque<CodecOutput>,
    end_of_input: bool,
}

impl SymphoniaCodec {
    fn decode_unit(&mut self, unit: CompressedUnit) -> Result<()> {
        let pts_us = unit.pts_us;
        let packet = Packet::new_from_boxed_slice(self.track_id, unit.timestamp, unit.duration, unit.data);

        let decoded = match self.decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!("skipping undecodable packet: {e}");
                return Ok(());
            }
            Err(SymphoniaError::ResetRequired) => {
                tracing::info!("codec reset requested");
                self.decoder.reset();
                return Ok(());
            }
            Err(e) => return Err(map_symphonia_error(e)),
        };

        if decoded.frames() == 0 {
            return Ok(());
        }

        let spec: SignalSpec = *decoded.spec();
        let format = TrackFormat::new(spec.rate, spec.channels.count() as u16);
        if self.reported != Some(format) {
            if self.reported.is_some() {
                self.pending.push_back(CodecOutput::FormatChanged(format));
            }
            self.reported = Some(format);
        }

        let needs_alloc = match &self.sample_buf {
            Some(buf) => buf.capacity() < decoded.capacity() * spec.channels.count(),
            None => true,
        };
        if needs_alloc {
            self.sample_buf = Some(SampleBuffer::<i16>::new(decoded.capacity() as u64, spec));
        }
        let Some(buf) = self.sample_buf.as_mut() else {
            return Ok(());
        };
        buf.copy_interleaved_ref(decoded);

        self.pending.push_back(CodecOutput::Decoded(DecodedUnit {
            samples: buf.samples().to_vec(),
            offset: 0,
            pts_us,
        }));
        Ok(())
    }
}

impl AudioCodec for SymphoniaCodec {
    fn can_accept_input(&self) -> bool {
        !self.end_of_input && self.pending.len() < MAX_PENDING_OUTPUTS
    }

    fn queue_input(&mut self, input: CodecInput) -> Result<()> {
        if self.end_of_input {
            return Err(PlayerError::invalid_state("input queued after end of stream"));
        }
        match input {
            CodecInput::Unit(unit) => self.decode_unit(unit),
            CodecInput::EndOfStream => {
                self.end_of_input = true;
                Ok(())
            }
        }
    }

    fn dequeue_output(&mut self) -> Result<CodecOutput> {
        if let Some(out) = self.pending.pop_front() {
            return Ok(out);
        }
        if self.end_of_input {
            Ok(CodecOutput::EndOfStream)
        } else {
            Ok(CodecOutput::TryAgainLater)
        }
    }
}
