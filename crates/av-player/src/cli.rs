use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "av-player", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// List hardware video decoders that can be initialized on this machine and exit
    #[arg(long)]
    pub list_hwaccels: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Resample all audio to this rate instead of negotiating with the output
    #[arg(long)]
    pub output_rate: Option<u32>,

    /// Resampler input chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Audio output buffer in milliseconds
    #[arg(long, default_value_t = 200)]
    pub buffer_ms: u32,

    /// Packets in flight per pipeline before the reader blocks
    #[arg(long, default_value_t = 1)]
    pub queue_depth: usize,

    /// Always decode video in software
    #[arg(long)]
    pub no_hwaccel: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a media file, reading transport commands from stdin
    Play {
        /// Path to the media file
        #[arg(required_unless_present = "test_pattern")]
        path: Option<PathBuf>,

        /// Play a generated tone + gray ramp instead of a file
        #[arg(long)]
        test_pattern: bool,

        /// Start position in seconds
        #[arg(long)]
        start: Option<f64>,

        /// Open paused (at `--start` if given) and wait for `play`
        #[arg(long)]
        paused: bool,
    },

    /// Print the streams selected for a media file and exit
    Probe {
        /// Path to the media file
        path: PathBuf,
    },
}
