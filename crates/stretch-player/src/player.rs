//! Control-layer facade.
//!
//! [`AudioPlayer`] owns at most one live [`PlaybackSession`]. A finished session is
//! dropped the next time `play` is called; it is never restarted.

use std::sync::Arc;

use crate::config::PlayerConfig;
use crate::decode::Decoder;
use crate::device::DeviceOpener;
use crate::error::{PlayerError, Result};
use crate::format::PlaybackState;
use crate::session::PlaybackSession;
use crate::sink::SinkKind;
use crate::source::MediaSource;

/// Player flavour, fixed for the player's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerKind {
    /// Plays at the track's own speed and pitch.
    Simple,
    /// Speed, pitch and rate are adjustable while playing.
    Stretching,
}

impl PlayerKind {
    fn sink_kind(self) -> SinkKind {
        match self {
            Self::Simple => SinkKind::Direct,
            Self::Stretching => SinkKind::Stretching,
        }
    }
}

pub struct AudioPlayer {
    kind: PlayerKind,
    opener: Arc<dyn DeviceOpener>,
    config: PlayerConfig,
    session: Option<PlaybackSession>,
}

impl AudioPlayer {
    pub fn new(kind: PlayerKind, opener: Arc<dyn DeviceOpener>) -> Self {
        Self::with_config(kind, opener, PlayerConfig::default())
    }

    pub fn with_config(kind: PlayerKind, opener: Arc<dyn DeviceOpener>, config: PlayerConfig) -> Self {
        Self {
            kind,
            opener,
            config,
            session: None,
        }
    }

    pub fn kind(&self) -> PlayerKind {
        self.kind
    }

    /// Open `source` and start playing it.
    ///
    /// `on_stopped` runs on the decode thread once playback ends, with the error that ended
    /// it, if any. Fails with [`PlayerError::InvalidState`] while another session is live.
    pub fn play(
        &mut self,
        source: &MediaSource,
        on_stopped: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        self.ensure_idle()?;
        let mut decoder = Decoder::open(source)?;
        decoder.set_buffer_size(self.config.decoder_buffer_samples)?;
        self.play_decoder(decoder, on_stopped)
    }

    /// Start playing an already opened decoder, keeping its buffer size.
    pub fn play_decoder(
        &mut self,
        decoder: Decoder,
        on_stopped: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        self.ensure_idle()?;
        let session = PlaybackSession::new(
            decoder,
            self.kind.sink_kind(),
            self.opener.clone(),
            self.config.clone(),
            on_stopped,
        );
        session.start()?;
        self.session = Some(session);
        Ok(())
    }

    /// Drop the previous session once its decode loop has ended.
    ///
    /// A session that reports `Stopped` may still be draining the sink; wait for it.
    fn ensure_idle(&mut self) -> Result<()> {
        if let Some(session) = &self.session {
            if !session.is_finished() && session.state() != PlaybackState::Stopped {
                return Err(PlayerError::invalid_state("already playing"));
            }
            session.wait();
            self.session = None;
        }
        Ok(())
    }

    fn session(&self) -> Result<&PlaybackSession> {
        self.session
            .as_ref()
            .ok_or_else(|| PlayerError::invalid_state("nothing is playing"))
    }

    pub fn pause(&self) -> Result<()> {
        self.session()?.pause();
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.session()?.resume();
        Ok(())
    }

    /// Stop the current session, if any, and wait for its decode thread to exit.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop();
            session.wait();
        }
    }

    pub fn set_speed(&self, speed: f32) -> Result<()> {
        self.require_stretching("speed")?;
        self.session()?.set_speed(speed)
    }

    pub fn set_pitch(&self, pitch: f32) -> Result<()> {
        self.require_stretching("pitch")?;
        self.session()?.set_pitch(pitch)
    }

    pub fn set_rate(&self, rate: f32) -> Result<()> {
        self.require_stretching("rate")?;
        self.session()?.set_rate(rate)
    }

    fn require_stretching(&self, what: &str) -> Result<()> {
        if self.is_speed_change_supported() {
            Ok(())
        } else {
            Err(PlayerError::UnsupportedOperation(format!(
                "{what} changes need a stretching player"
            )))
        }
    }

    pub fn is_speed_change_supported(&self) -> bool {
        self.kind == PlayerKind::Stretching
    }

    pub fn state(&self) -> PlaybackState {
        self.session
            .as_ref()
            .map_or(PlaybackState::Idle, PlaybackSession::state)
    }

    /// A session is live, paused or not.
    pub fn is_playing(&self) -> bool {
        matches!(self.state(), PlaybackState::Playing | PlaybackState::Paused)
    }

    pub fn is_paused(&self) -> bool {
        self.state() == PlaybackState::Paused
    }

    pub fn elapsed_millis(&self) -> u64 {
        self.session
            .as_ref()
            .map_or(0, PlaybackSession::elapsed_millis)
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}
