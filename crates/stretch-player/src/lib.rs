//! Decode → time-stretch → output playback core.
//!
//! A [`decode::Decoder`] turns a compressed stream into fixed-size PCM chunks, an
//! [`sink::OutputSink`] plays them (optionally through a [`stretch::TimeStretchProcessor`]),
//! and a [`session::PlaybackSession`] couples both on one dedicated decode thread.
//! [`player::AudioPlayer`] is the control-layer facade.

pub mod codec;
pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod format;
pub mod player;
pub mod queue;
pub mod resample;
pub mod session;
pub mod sink;
pub mod source;
pub mod stretch;

#[cfg(test)]
mod testing;

pub use config::PlayerConfig;
pub use error::{PlayerError, Result};
pub use format::{PcmChunk, PlaybackParameters, PlaybackState, TrackFormat};
pub use player::{AudioPlayer, PlayerKind};
pub use source::MediaSource;
