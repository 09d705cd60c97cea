//! av-player: headless command-line host for the `av-engine` transport.
//!
//! Opens one media file (or a generated test pattern), plays it through the default
//! audio output, and reads transport commands from stdin (`play`, `pause`, `seek 30`,
//! `+10`, `stop`, `status`, `quit`). Video frames are decoded, paced against the audio
//! clock and counted; there is no window.

use anyhow::{Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use av_player::cli::{Args, Command};
use av_player::config::{PlayConfig, engine_config};
use av_player::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,av_engine=info,av_player=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }
    if args.list_hwaccels {
        return runtime::list_hwaccels();
    }

    match &args.cmd {
        Some(Command::Play {
            path,
            test_pattern,
            start,
            paused,
        }) => {
            let config = PlayConfig::new(&args, path.clone(), *test_pattern, *start, *paused);
            runtime::run_play(config)
        }
        Some(Command::Probe { path }) => runtime::run_probe(path, &engine_config(&args)),
        None => bail!("nothing to do; see `av-player --help`"),
    }
}
