use std::path::PathBuf;

use av_engine::EngineConfig;

use crate::cli::Args;

/// What to open.
#[derive(Clone, Debug, PartialEq)]
pub enum Source {
    File(PathBuf),
    TestPattern,
}

#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub source: Source,
    pub device: Option<String>,
    pub start_ms: Option<u64>,
    pub start_paused: bool,
    pub engine: EngineConfig,
}

impl PlayConfig {
    pub fn new(
        args: &Args,
        path: Option<PathBuf>,
        test_pattern: bool,
        start_secs: Option<f64>,
        start_paused: bool,
    ) -> Self {
        let source = match path {
            Some(path) if !test_pattern => Source::File(path),
            _ => Source::TestPattern,
        };
        Self {
            source,
            device: normalize_device_name(args.device.clone()),
            start_ms: start_secs.map(|s| (s.max(0.0) * 1000.0).round() as u64),
            start_paused,
            engine: engine_config(args),
        }
    }
}

/// Map command line tuning flags onto the engine configuration.
pub fn engine_config(args: &Args) -> EngineConfig {
    EngineConfig {
        output_sample_rate: args.output_rate.filter(|r| *r > 0),
        resample_chunk_frames: args.chunk_frames.max(1),
        packet_queue_depth: args.queue_depth.max(1),
        hwaccel: !args.no_hwaccel,
        sink_buffer_ms: args.buffer_ms,
        ..EngineConfig::default()
    }
}

pub fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
