//! Runtime helpers: device listing and interactive playback of one file.

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::DeviceTrait;
use crossbeam_channel::{Receiver, bounded, never, select, tick, unbounded};
use stretch_player::device::{self, CpalDeviceOpener, DeviceOpener, MemoryDeviceOpener};
use stretch_player::{AudioPlayer, MediaSource, PlayerKind};

use crate::config::PlayConfig;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
const SPEED_STEP: f32 = 0.1;
const MIN_SPEED: f32 = 0.1;
const MAX_SPEED: f32 = 4.0;

/// Interactive commands read from stdin, one per line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    TogglePause,
    Stop,
    Faster,
    Slower,
    Elapsed,
}

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for (index, name) in device::list_devices(&host)?.iter().enumerate() {
        println!("{index}: {name}");
    }
    Ok(())
}

/// Play `config.path` until it ends, is stopped from stdin, or Ctrl-C is pressed.
pub fn run_play(config: PlayConfig) -> Result<()> {
    let opener = build_opener(&config)?;
    let mut player = AudioPlayer::with_config(config.kind, opener, config.player.clone());
    let source = MediaSource::path(&config.path);

    let (done_tx, done_rx) = bounded(1);
    player
        .play(&source, move |result| {
            let _ = done_tx.send(result);
        })
        .with_context(|| format!("play {}", config.path.display()))?;
    tracing::info!(path = %config.path.display(), kind = ?config.kind, "playing");

    let mut speed = config.params.speed;
    if config.kind == PlayerKind::Stretching && !config.params.is_identity() {
        player.set_speed(config.params.speed)?;
        player.set_pitch(config.params.pitch)?;
        player.set_rate(config.params.rate)?;
    }

    let (interrupt_tx, interrupt_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    let commands = if config.interactive {
        spawn_stdin_reader()
    } else {
        never()
    };
    let closed = never();
    let mut stdin_open = true;
    let ticker = tick(PROGRESS_INTERVAL);

    loop {
        let command_rx = if stdin_open { &commands } else { &closed };
        select! {
            recv(done_rx) -> result => {
                let result = result.unwrap_or(Ok(()));
                tracing::info!(elapsed_ms = player.elapsed_millis(), "playback finished");
                return result.context("playback failed");
            }
            recv(interrupt_rx) -> _ => {
                tracing::info!("interrupted; stopping");
                player.stop();
            }
            recv(command_rx) -> command => match command {
                Ok(command) => {
                    if let Err(e) = apply_command(&mut player, &mut speed, command) {
                        tracing::warn!(?command, "command failed: {e}");
                    }
                }
                Err(_) => stdin_open = false,
            },
            recv(ticker) -> _ => {
                tracing::debug!(
                    elapsed_ms = player.elapsed_millis(),
                    paused = player.is_paused(),
                    "progress"
                );
            }
        }
    }
}

fn build_opener(config: &PlayConfig) -> Result<Arc<dyn DeviceOpener>> {
    if config.null_output {
        tracing::info!("output device: null (paced, in memory)");
        return Ok(Arc::new(MemoryDeviceOpener::new().realtime()));
    }
    let host = cpal::default_host();
    let device_name = normalize_device_name(config.device.clone());
    let device = device::pick_device(&host, device_name.as_deref())?;
    tracing::info!(device = %device.description()?, "output device");
    Ok(Arc::new(
        CpalDeviceOpener::new(device_name).with_refill_max_frames(config.player.refill_max_frames),
    ))
}

fn spawn_stdin_reader() -> Receiver<Command> {
    let (tx, rx) = unbounded();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match parse_command(&line) {
                Some(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => eprintln!("commands: p (pause/resume), s (stop), + / - (speed), t (elapsed)"),
            }
        }
    });
    rx
}

pub fn parse_command(line: &str) -> Option<Command> {
    match line.trim() {
        "p" | "P" => Some(Command::TogglePause),
        "s" | "S" => Some(Command::Stop),
        "+" | "=" => Some(Command::Faster),
        "-" => Some(Command::Slower),
        "t" | "T" => Some(Command::Elapsed),
        _ => None,
    }
}

fn apply_command(player: &mut AudioPlayer, speed: &mut f32, command: Command) -> Result<()> {
    match command {
        Command::TogglePause => {
            if player.is_paused() {
                player.resume()?;
                tracing::info!("resumed");
            } else {
                player.pause()?;
                tracing::info!("paused");
            }
        }
        Command::Stop => player.stop(),
        Command::Faster | Command::Slower => {
            let delta = if command == Command::Faster { SPEED_STEP } else { -SPEED_STEP };
            let next = step_speed(*speed, delta);
            player.set_speed(next)?;
            *speed = next;
            tracing::info!(speed = next, "speed changed");
        }
        Command::Elapsed => println!("{}", format_elapsed(player.elapsed_millis())),
    }
    Ok(())
}

/// Move `speed` by `delta`, snapped to tenths and kept within the supported range.
fn step_speed(speed: f32, delta: f32) -> f32 {
    (((speed + delta) * 10.0).round() / 10.0).clamp(MIN_SPEED, MAX_SPEED)
}

fn format_elapsed(millis: u64) -> String {
    let secs = millis / 1000;
    format!("{}:{:02}.{:03}", secs / 60, secs % 60, millis % 1000)
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("p"), Some(Command::TogglePause));
        assert_eq!(parse_command("  s \n"), Some(Command::Stop));
        assert_eq!(parse_command("+"), Some(Command::Faster));
        assert_eq!(parse_command("-"), Some(Command::Slower));
        assert_eq!(parse_command("T"), Some(Command::Elapsed));
        assert_eq!(parse_command("pause"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn speed_steps_snap_and_clamp() {
        assert_eq!(step_speed(1.0, SPEED_STEP), 1.1);
        assert_eq!(step_speed(1.1, -SPEED_STEP), 1.0);
        assert_eq!(step_speed(0.1, -SPEED_STEP), MIN_SPEED);
        assert_eq!(step_speed(MAX_SPEED, SPEED_STEP), MAX_SPEED);
    }

    #[test]
    fn elapsed_is_minutes_seconds_millis() {
        assert_eq!(format_elapsed(0), "0:00.000");
        assert_eq!(format_elapsed(61_250), "1:01.250");
        assert_eq!(format_elapsed(600_005), "10:00.005");
    }

    #[test]
    fn normalize_device_name_trims_and_drops_empty() {
        assert_eq!(normalize_device_name(None), None);
        assert_eq!(normalize_device_name(Some("  ".to_string())), None);
        assert_eq!(
            normalize_device_name(Some("  USB  DAC ".to_string())),
            Some("USB  DAC".to_string())
        );
    }

    #[test]
    fn commands_drive_a_headless_player() {
        use stretch_player::PlayerConfig;

        let opener = Arc::new(MemoryDeviceOpener::new().realtime());
        let mut player =
            AudioPlayer::with_config(PlayerKind::Stretching, opener, PlayerConfig::default());
        let mut speed = 1.0;
        assert!(apply_command(&mut player, &mut speed, Command::TogglePause).is_err());
        assert!(apply_command(&mut player, &mut speed, Command::Faster).is_err());
        assert_eq!(speed, 1.0);
        apply_command(&mut player, &mut speed, Command::Stop).unwrap();
        apply_command(&mut player, &mut speed, Command::Elapsed).unwrap();
    }
}
