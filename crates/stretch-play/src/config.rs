use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use stretch_player::format::validate_factor;
use stretch_player::{PlaybackParameters, PlayerConfig, PlayerKind};

use crate::cli::{Args, KindArg};

/// Everything `run_play` needs, resolved from the command line.
#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub path: PathBuf,
    pub device: Option<String>,
    pub kind: PlayerKind,
    pub params: PlaybackParameters,
    pub null_output: bool,
    pub interactive: bool,
    pub player: PlayerConfig,
}

impl PlayConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let path = args.path.clone().context("no input file given")?;
        let kind = match args.kind {
            KindArg::Simple => PlayerKind::Simple,
            KindArg::Stretching => PlayerKind::Stretching,
        };
        let params = PlaybackParameters {
            speed: validate_factor("speed", args.speed)?,
            pitch: validate_factor("pitch", args.pitch)?,
            rate: validate_factor("rate", args.rate)?,
        };
        if kind == PlayerKind::Simple && !params.is_identity() {
            bail!("--speed, --pitch and --rate need --kind stretching");
        }
        if args.decoder_buffer == 0 || args.chunk_frames == 0 || args.refill_max_frames == 0 {
            bail!("buffer sizes must be greater than zero");
        }

        let player = PlayerConfig {
            decoder_buffer_samples: args.decoder_buffer,
            buffer_min_magnitude: args.buffer_magnitude,
            resample_chunk_frames: args.chunk_frames,
            refill_max_frames: args.refill_max_frames,
            ..PlayerConfig::default()
        };

        Ok(Self {
            path,
            device: args.device.clone(),
            kind,
            params,
            null_output: args.null_output,
            interactive: !args.no_stdin,
            player,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use stretch_player::config::MIN_BUFFER_MAGNITUDE;

    fn parse(argv: &[&str]) -> Args {
        let mut full = vec!["stretch-play"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    #[test]
    fn maps_flags_into_player_config() {
        let cfg = PlayConfig::from_args(&parse(&[
            "--buffer-magnitude",
            "8",
            "--chunk-frames",
            "512",
            "--speed",
            "1.25",
            "--no-stdin",
            "x.flac",
        ]))
        .unwrap();
        assert_eq!(cfg.path, PathBuf::from("x.flac"));
        assert_eq!(cfg.kind, PlayerKind::Stretching);
        assert_eq!(cfg.params.speed, 1.25);
        assert_eq!(cfg.player.buffer_min_magnitude, 8);
        assert_eq!(cfg.player.resample_chunk_frames, 512);
        assert!(!cfg.interactive);
    }

    #[test]
    fn small_magnitude_is_raised_by_the_player() {
        let cfg = PlayConfig::from_args(&parse(&["--buffer-magnitude", "1", "x.flac"])).unwrap();
        assert_eq!(cfg.player.effective_buffer_magnitude(), MIN_BUFFER_MAGNITUDE);
    }

    #[test]
    fn rejects_invalid_factors() {
        assert!(PlayConfig::from_args(&parse(&["--speed", "0", "x.flac"])).is_err());
        assert!(PlayConfig::from_args(&parse(&["--rate=-1", "x.flac"])).is_err());
    }

    #[test]
    fn simple_kind_rejects_non_identity_parameters() {
        let err = PlayConfig::from_args(&parse(&["--kind", "simple", "--pitch", "1.2", "x.flac"]))
            .unwrap_err();
        assert!(err.to_string().contains("--kind stretching"));
        assert!(PlayConfig::from_args(&parse(&["--kind", "simple", "x.flac"])).is_ok());
    }
}
