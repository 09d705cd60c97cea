//! Player runtime: device/decoder listing, probing, and interactive playback.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use av_engine::backend::synthetic::{SyntheticBackend, SyntheticMedia};
use av_engine::backend::{MediaBackend, default_backend};
use av_engine::catalog;
use av_engine::hwaccel;
use av_engine::media::MediaKind;
use av_engine::output::{DiscardVideoOutput, SharedAudioOutput, shared_audio, shared_video};
use av_engine::{
    EngineConfig, EngineEvent, PlaybackState, PlaybackStatus, TransportController, TransportError,
};
use crossbeam_channel::{Receiver, Sender};

use crate::commands::{UserCommand, parse_command};
use crate::config::{PlayConfig, Source};

/// List output devices and print them to stdout.
#[cfg(feature = "cpal")]
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for (i, name) in av_engine::device::list_devices(&host)?.iter().enumerate() {
        println!("#{i}: {name}");
    }
    Ok(())
}

#[cfg(not(feature = "cpal"))]
pub fn list_devices() -> Result<()> {
    anyhow::bail!("built without the `cpal` feature; no output devices to list")
}

/// Print the hardware video decoders that initialize on this machine.
pub fn list_hwaccels() -> Result<()> {
    let backend = default_backend();
    let devices = backend
        .hw_platform()
        .map(hwaccel::available_devices)
        .unwrap_or_default();
    if devices.is_empty() {
        println!("no hardware decoders available ({} backend)", backend.name());
    }
    for name in devices {
        println!("{name}");
    }
    Ok(())
}

/// Open `path`, print what the engine would play, and exit.
pub fn run_probe(path: &Path, engine: &EngineConfig) -> Result<()> {
    let backend = default_backend();
    let opened = catalog::open(backend.as_ref(), path, engine)
        .with_context(|| format!("probe {}", path.display()))?;
    let info = &opened.info;

    println!("path:      {}", info.path.display());
    println!("backend:   {}", backend.name());
    println!("media:     {:?}", info.media_type);
    match info.duration_ms {
        Some(ms) => println!("duration:  {}", format_ms(ms)),
        None => println!("duration:  unknown"),
    }
    if let Some(a) = &info.audio {
        println!(
            "audio:     #{} {} {} Hz {} ch, {} frames",
            a.index,
            a.codec,
            a.sample_rate.unwrap_or(0),
            a.channels.unwrap_or(0),
            info.frame_count(MediaKind::Audio)
        );
    }
    if let Some(v) = &info.video {
        println!(
            "video:     #{} {} {}x{}, {} frames, decode: {}",
            v.index,
            v.codec,
            v.width.unwrap_or(0),
            v.height.unwrap_or(0),
            info.frame_count(MediaKind::Video),
            opened.hw.backend_name()
        );
    }
    Ok(())
}

/// Play until the media ends or the user quits.
pub fn run_play(config: PlayConfig) -> Result<()> {
    let backend: Arc<dyn MediaBackend> = match &config.source {
        Source::File(_) => default_backend(),
        Source::TestPattern => Arc::new(SyntheticBackend::new(SyntheticMedia::default())),
    };
    let path = match &config.source {
        Source::File(path) => path.clone(),
        Source::TestPattern => PathBuf::from("test-pattern"),
    };

    let (mut controller, events) = TransportController::new(
        backend,
        config.engine.clone(),
        audio_output(&config),
        shared_video(DiscardVideoOutput::default()),
    );
    let info = controller
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    tracing::info!(
        path = %info.path.display(),
        media = ?info.media_type,
        "media opened"
    );

    if let Some(start) = config.start_ms {
        controller.seek(start)?;
    }
    if !config.start_paused {
        controller.play()?;
    }

    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
    spawn_stdin_reader(cmd_tx.clone())?;
    let ctrlc_tx = cmd_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(UserCommand::Quit);
    }) {
        tracing::warn!("ctrl-c handler not installed: {e}");
    }

    run_loop(&controller, &events, &cmd_rx);
    controller.close();
    drop(cmd_tx);
    Ok(())
}

fn run_loop(
    controller: &TransportController,
    events: &Receiver<EngineEvent>,
    commands: &Receiver<UserCommand>,
) {
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(EngineEvent::PlaybackFinished) => {
                    tracing::info!("playback finished");
                    return;
                }
                Ok(event) => log_event(&event),
                Err(_) => return,
            },
            recv(commands) -> cmd => match cmd {
                Ok(UserCommand::Quit) | Err(_) => return,
                Ok(cmd) => {
                    if let Err(e) = apply(controller, cmd) {
                        tracing::warn!("command rejected: {e}");
                    }
                }
            },
        }
    }
}

fn apply(controller: &TransportController, cmd: UserCommand) -> Result<(), TransportError> {
    match cmd {
        UserCommand::Play => controller.play(),
        UserCommand::Pause => controller.pause(),
        UserCommand::Toggle => {
            if controller.state() == PlaybackState::Playing {
                controller.pause()
            } else {
                controller.play()
            }
        }
        UserCommand::Stop => controller.stop(),
        UserCommand::Seek(target) => {
            let position = controller.position_ms().unwrap_or(0.0).max(0.0) as u64;
            controller.seek(target.resolve(position))
        }
        UserCommand::Status => {
            println!("{}", status_line(&controller.status()));
            Ok(())
        }
        UserCommand::Quit => Ok(()),
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::DurationKnown(ms) => tracing::info!(duration = %format_ms(*ms), "duration"),
        EngineEvent::Progress { seconds } => {
            tracing::debug!(position = %format_ms(*seconds * 1000), "progress")
        }
        EngineEvent::StateChanged(state) => tracing::info!(%state, "transport"),
        EngineEvent::HwAccel { backend } => tracing::info!(%backend, "video decode"),
        EngineEvent::PlaybackFinished => {}
    }
}

fn spawn_stdin_reader(tx: Sender<UserCommand>) -> Result<()> {
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match parse_command(&line) {
                    Ok(cmd) => {
                        if tx.send(cmd).is_err() {
                            break;
                        }
                    }
                    Err(e) => eprintln!("{e}"),
                }
            }
            tracing::debug!("stdin closed");
        })
        .context("spawn stdin reader")?;
    Ok(())
}

#[cfg(feature = "cpal")]
fn audio_output(config: &PlayConfig) -> SharedAudioOutput {
    shared_audio(av_engine::playback::CpalAudioOutput::new(
        config.device.clone(),
        config.engine.sink_buffer_ms,
    ))
}

#[cfg(not(feature = "cpal"))]
fn audio_output(config: &PlayConfig) -> SharedAudioOutput {
    if config.device.is_some() {
        tracing::warn!("built without the `cpal` feature; --device ignored");
    }
    shared_audio(av_engine::output::NullAudioOutput::new(
        config.engine.sink_buffer_ms,
    ))
}

fn status_line(status: &PlaybackStatus) -> String {
    let duration = status
        .duration_ms
        .map(format_ms)
        .unwrap_or_else(|| "--:--".to_string());
    let mut line = format!(
        "[{}] {} / {}",
        status.state,
        format_ms(status.position_ms),
        duration
    );
    if let Some(codec) = &status.audio_codec {
        line.push_str(&format!(" audio={codec}"));
        if let Some(rate) = status.output_sample_rate {
            line.push_str(&format!("@{rate}"));
        }
    }
    if let Some(codec) = &status.video_codec {
        line.push_str(&format!(" video={codec}"));
    }
    if let Some(backend) = &status.video_backend {
        line.push_str(&format!(" ({backend})"));
    }
    line
}

fn format_ms(ms: u64) -> String {
    let secs = ms / 1000;
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}
