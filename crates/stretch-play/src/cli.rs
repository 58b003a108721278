use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use stretch_player::config::MIN_BUFFER_MAGNITUDE;

#[derive(Parser, Debug)]
#[command(name = "stretch-play", version)]
pub struct Args {
    /// Path to the audio file
    #[arg(required_unless_present = "list_devices")]
    pub path: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Player flavour; only `stretching` accepts speed, pitch and rate changes
    #[arg(long, value_enum, default_value_t = KindArg::Stretching)]
    pub kind: KindArg,

    /// Initial playback speed (duration only)
    #[arg(long, default_value_t = 1.0)]
    pub speed: f32,

    /// Initial pitch factor (pitch only)
    #[arg(long, default_value_t = 1.0)]
    pub pitch: f32,

    /// Initial rate factor (speed and pitch together)
    #[arg(long, default_value_t = 1.0)]
    pub rate: f32,

    /// Play into a paced in-memory device instead of audio hardware
    #[arg(long)]
    pub null_output: bool,

    /// Output buffer size as a multiple of the device minimum (at least 4)
    #[arg(long, default_value_t = MIN_BUFFER_MAGNITUDE)]
    pub buffer_magnitude: usize,

    /// Decoder chunk size in samples
    #[arg(long, default_value_t = 2048)]
    pub decoder_buffer: usize,

    /// Resampler input chunk size in frames, used when the device rate differs from the file
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Playback callback refill cap (frames). Larger reduces lock churn but can add latency.
    #[arg(long, default_value_t = 4096)]
    pub refill_max_frames: usize,

    /// Ignore stdin commands
    #[arg(long)]
    pub no_stdin: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Simple,
    Stretching,
}
