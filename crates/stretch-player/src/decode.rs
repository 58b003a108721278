//! Blocking decode stage.
//!
//! [`Decoder::run`] drives one pass over the selected audio track on the calling thread:
//! - queue compressed units into the codec while it has room
//! - pull decoded units, forwarding format changes downstream
//! - pack samples into one reused [`PcmChunk`] and hand it to the listener when full
//!
//! Control from other threads goes through a cloneable [`DecoderHandle`]. Pause blocks the
//! loop on a condition variable at the top of the next iteration; stop is observed at the
//! same boundary, so a few more chunks may still be delivered after `stop()` returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::codec::{AudioCodec, CodecInput, CodecOutput, MediaExtractor, SymphoniaExtractor};
use crate::config::PlayerConfig;
use crate::error::{PlayerError, Result};
use crate::format::{PcmChunk, PlaybackState, TrackFormat};
use crate::source::MediaSource;

/// Receiver of decoded audio.
///
/// Both calls run synchronously on the decode thread; the chunk is only valid for the
/// duration of [`DecodeListener::on_chunk`].
pub trait DecodeListener {
    fn on_chunk(&mut self, chunk: &PcmChunk) -> Result<()>;

    fn on_format_changed(&mut self, sample_rate: u32) -> Result<()>;
}

/// Why [`Decoder::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// All input was decoded and delivered.
    EndOfStream,
    /// A stop request was observed.
    Stopped,
}

struct DecoderControl {
    state: Mutex<PlaybackState>,
    cv: Condvar,
    elapsed_us: AtomicU64,
}

impl DecoderControl {
    fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter the run. Returns `false` when a stop arrived first.
    ///
    /// A pause requested before the run keeps the loop parked until resumed.
    fn begin(&self) -> bool {
        let mut state = self.lock();
        match *state {
            PlaybackState::Stopped => false,
            PlaybackState::Idle => {
                *state = PlaybackState::Playing;
                true
            }
            PlaybackState::Playing | PlaybackState::Paused => true,
        }
    }

    /// Block while paused. Returns `false` once stopped.
    fn wait_while_paused(&self) -> bool {
        let mut state = self.lock();
        while *state == PlaybackState::Paused {
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        *state != PlaybackState::Stopped
    }

    fn finish(&self) {
        let mut state = self.lock();
        *state = PlaybackState::Stopped;
        drop(state);
        self.cv.notify_all();
    }
}

/// Cloneable control surface for a running (or not yet started) [`Decoder`].
#[derive(Clone)]
pub struct DecoderHandle {
    control: Arc<DecoderControl>,
}

impl DecoderHandle {
    /// Suspend decoding at the next loop iteration, or before the first one if the run
    /// has not begun. No-op once stopped.
    pub fn pause(&self) {
        let mut state = self.control.lock();
        if matches!(*state, PlaybackState::Idle | PlaybackState::Playing) {
            *state = PlaybackState::Paused;
            tracing::debug!("decoder paused");
        }
    }

    /// Wake a paused decode loop. No-op unless paused.
    pub fn resume(&self) {
        let mut state = self.control.lock();
        if *state == PlaybackState::Paused {
            *state = PlaybackState::Playing;
            drop(state);
            self.control.cv.notify_all();
            tracing::debug!("decoder resumed");
        }
    }

    /// Ask the loop to exit at the next iteration boundary. Idempotent.
    pub fn stop(&self) {
        let mut state = self.control.lock();
        if *state != PlaybackState::Stopped {
            *state = PlaybackState::Stopped;
            drop(state);
            self.control.cv.notify_all();
            tracing::debug!("decoder stop requested");
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.control.lock()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == PlaybackState::Paused
    }

    /// Presentation time of the most recently decoded unit.
    pub fn elapsed_millis(&self) -> u64 {
        self.control.elapsed_us.load(Ordering::Relaxed) / 1000
    }
}

/// Decoder bound to one media source and its first audio track.
pub struct Decoder {
    extractor: Box<dyn MediaExtractor>,
    codec: Box<dyn AudioCodec>,
    format: TrackFormat,
    buffer_samples: usize,
    control: Arc<DecoderControl>,
}

impl Decoder {
    /// Open `source` with the Symphonia codec capability.
    pub fn open(source: &MediaSource) -> Result<Self> {
        let extractor = SymphoniaExtractor::open(source)?;
        let decoder = Self::from_extractor(Box::new(extractor))?;
        tracing::info!(
            source = %source.describe(),
            rate_hz = decoder.format.sample_rate,
            channels = decoder.format.channels,
            "decoder opened"
        );
        Ok(decoder)
    }

    /// Open over any codec capability.
    ///
    /// Selects the first track whose media type is audio; fails with
    /// [`PlayerError::UnsupportedFormat`] before creating a codec when there is none.
    pub fn from_extractor(mut extractor: Box<dyn MediaExtractor>) -> Result<Self> {
        let track = extractor
            .tracks()
            .iter()
            .find(|t| t.is_audio())
            .cloned()
            .ok_or_else(|| PlayerError::UnsupportedFormat("no audio track found".to_string()))?;

        let format = track.format.ok_or_else(|| {
            PlayerError::UnsupportedFormat(format!(
                "audio track {} ({}) has no sample rate or channel layout",
                track.index, track.mime
            ))
        })?;

        let codec = extractor.create_codec(track.index)?;
        extractor.select_track(track.index)?;

        Ok(Self {
            extractor,
            codec,
            format,
            buffer_samples: PlayerConfig::default().decoder_buffer_samples,
            control: Arc::new(DecoderControl {
                state: Mutex::new(PlaybackState::Idle),
                cv: Condvar::new(),
                elapsed_us: AtomicU64::new(0),
            }),
        })
    }

    /// Track format reported at open time.
    pub fn format(&self) -> TrackFormat {
        self.format
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_samples
    }

    /// Set the chunk size in samples. Only allowed before the run starts.
    pub fn set_buffer_size(&mut self, samples: usize) -> Result<()> {
        let state = *self.control.lock();
        if state != PlaybackState::Idle {
            return Err(PlayerError::invalid_state(format!(
                "can't change buffer size in state {state:?}"
            )));
        }
        if samples == 0 {
            return Err(PlayerError::invalid_argument("buffer size must be positive"));
        }
        self.buffer_samples = samples;
        Ok(())
    }

    pub fn handle(&self) -> DecoderHandle {
        DecoderHandle {
            control: self.control.clone(),
        }
    }

    /// Decode to completion on the calling thread.
    ///
    /// Codec and extractor are released when this returns, whatever the outcome.
    pub fn run<L: DecodeListener + ?Sized>(mut self, listener: &mut L) -> Result<RunOutcome> {
        if !self.control.begin() {
            tracing::debug!("decoder stopped before start");
            return Ok(RunOutcome::Stopped);
        }

        let result = self.decode_loop(listener);
        self.control.finish();
        match &result {
            Ok(outcome) => tracing::info!(
                outcome = ?outcome,
                elapsed_ms = self.control.elapsed_us.load(Ordering::Relaxed) / 1000,
                "decoder finished"
            ),
            Err(e) => tracing::error!("decoder failed: {e}"),
        }
        result
    }

    fn decode_loop<L: DecodeListener + ?Sized>(&mut self, listener: &mut L) -> Result<RunOutcome> {
        let mut chunk = PcmChunk::with_capacity(self.buffer_samples);
        let mut pending: Vec<i16> = Vec::new();
        let mut pending_pos = 0usize;
        let mut input_done = false;
        let mut output_done = false;

        loop {
            if !self.control.wait_while_paused() {
                return Ok(RunOutcome::Stopped);
            }

            if !input_done && self.codec.can_accept_input() {
                match self.extractor.read_unit()? {
                    Some(unit) => self.codec.queue_input(CodecInput::Unit(unit))?,
                    None => {
                        self.codec.queue_input(CodecInput::EndOfStream)?;
                        input_done = true;
                        tracing::debug!("end of input");
                    }
                }
            }

            if pending_pos >= pending.len() && !output_done {
                match self.codec.dequeue_output()? {
                    CodecOutput::Decoded(unit) => {
                        if unit.offset != 0 {
                            return Err(PlayerError::InvariantViolation(format!(
                                "decoded output offset is {}, expected 0",
                                unit.offset
                            )));
                        }
                        self.control.elapsed_us.fetch_max(unit.pts_us, Ordering::Relaxed);
                        pending = unit.samples;
                        pending_pos = 0;
                    }
                    CodecOutput::FormatChanged(new_format) => {
                        self.apply_format_change(new_format, listener)?;
                    }
                    CodecOutput::TryAgainLater => {}
                    CodecOutput::EndOfStream => output_done = true,
                }
            }

            if pending_pos < pending.len() {
                pending_pos += chunk.fill_from(&pending[pending_pos..]);
            }

            if chunk.is_full() {
                listener.on_chunk(&chunk)?;
                chunk.clear();
            }

            if output_done && pending_pos >= pending.len() {
                if !chunk.is_empty() {
                    listener.on_chunk(&chunk)?;
                    chunk.clear();
                }
                return Ok(RunOutcome::EndOfStream);
            }
        }
    }

    fn apply_format_change<L: DecodeListener + ?Sized>(
        &mut self,
        new_format: TrackFormat,
        listener: &mut L,
    ) -> Result<()> {
        if new_format.channels != self.format.channels {
            return Err(PlayerError::InvariantViolation(format!(
                "channel count changed mid-stream ({} -> {})",
                self.format.channels, new_format.channels
            )));
        }
        if new_format.sample_rate != self.format.sample_rate {
            tracing::info!(
                from_hz = self.format.sample_rate,
                to_hz = new_format.sample_rate,
                "output format changed"
            );
            self.format.sample_rate = new_format.sample_rate;
            listener.on_format_changed(new_format.sample_rate)?;
        }
        Ok(())
    }
}
