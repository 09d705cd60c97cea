//! Typed errors for the fatal-at-open path and transport misuse.
//!
//! Per-unit failures (one packet, one frame) never use these: they are logged
//! and skipped inside the pipelines.

use std::path::PathBuf;

use crate::media::{CodecId, MediaKind};

/// Errors that prevent playback from starting.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("cannot open container {path:?}: {reason}")]
    ContainerOpen { path: PathBuf, reason: String },

    #[error("no audio or video stream found")]
    NoSuchStream,

    #[error("no decoder available for {kind} codec {codec}")]
    CodecUnsupported { kind: MediaKind, codec: CodecId },

    #[error("failed to initialize {kind} codec context: {reason}")]
    CodecInit { kind: MediaKind, reason: String },

    #[error("failed to initialize audio resampler: {0}")]
    AudioInit(String),

    #[error("audio output rejected stream format: {0}")]
    AudioOutput(String),

    #[error("video output rejected pixel layout: {0}")]
    VideoOutput(String),

    #[error("failed to start {name} worker: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
}

/// Errors returned by transport commands.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no media is open")]
    NotOpen,
}
