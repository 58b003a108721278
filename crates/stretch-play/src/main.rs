//! stretch-play: plays one audio file through the stretch-player core.
//!
//! Speed, pitch and rate can be set on the command line; while playing, stdin accepts
//! `p` (pause/resume), `s` (stop), `+`/`-` (speed) and `t` (elapsed time).

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stretch_play::{cli, config::PlayConfig, runtime};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,stretch_play=info,stretch_player=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let config = PlayConfig::from_args(&args)?;
    runtime::run_play(config)
}
