use std::path::PathBuf;

use crate::catalog::MediaInfo;
use crate::media::MediaType;
use crate::transport::PlaybackState;

/// Point-in-time view of the transport returned by [`TransportController::status`].
///
/// [`TransportController::status`]: crate::transport::TransportController::status
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    /// File currently open.
    pub path: Option<PathBuf>,
    /// Current clock position in milliseconds (0 before the first audio buffer).
    pub position_ms: u64,
    /// Total duration in milliseconds when the container reports one.
    pub duration_ms: Option<u64>,
    pub media_type: Option<MediaType>,
    /// Audio decoder name (for example `mp3`, `aac`).
    pub audio_codec: Option<String>,
    /// Video decoder name.
    pub video_codec: Option<String>,
    /// Video decode back-end: `software` or a hardware device name.
    pub video_backend: Option<String>,
    /// Output sample rate after resampling.
    pub output_sample_rate: Option<u32>,
}

/// Per-open facts that do not change while the media stays open.
#[derive(Clone, Debug, Default)]
pub(crate) struct SessionFacts {
    pub(crate) audio_codec: Option<String>,
    pub(crate) video_codec: Option<String>,
    pub(crate) video_backend: Option<String>,
    pub(crate) output_sample_rate: Option<u32>,
}

impl PlaybackStatus {
    /// Status with nothing open.
    pub fn idle() -> Self {
        Self {
            state: PlaybackState::Idle,
            path: None,
            position_ms: 0,
            duration_ms: None,
            media_type: None,
            audio_codec: None,
            video_codec: None,
            video_backend: None,
            output_sample_rate: None,
        }
    }

    pub(crate) fn snapshot(
        state: PlaybackState,
        position_ms: Option<f64>,
        info: &MediaInfo,
        facts: &SessionFacts,
    ) -> Self {
        let mut position_ms = position_ms.unwrap_or(0.0).max(0.0) as u64;
        if let Some(duration) = info.duration_ms {
            position_ms = position_ms.min(duration);
        }
        Self {
            state,
            path: Some(info.path.clone()),
            position_ms,
            duration_ms: info.duration_ms,
            media_type: Some(info.media_type),
            audio_codec: facts.audio_codec.clone(),
            video_codec: facts.video_codec.clone(),
            video_backend: facts.video_backend.clone(),
            output_sample_rate: facts.output_sample_rate,
        }
    }

    /// Position as a fraction of the duration, when both are known.
    pub fn progress(&self) -> Option<f64> {
        match self.duration_ms {
            Some(d) if d > 0 => Some(self.position_ms as f64 / d as f64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::backend::synthetic::{SyntheticBackend, SyntheticMedia};
    use crate::catalog;
    use crate::config::EngineConfig;

    fn info() -> MediaInfo {
        catalog::open(
            &SyntheticBackend::new(SyntheticMedia::default()),
            Path::new("clip.synthetic"),
            &EngineConfig::default(),
        )
        .unwrap()
        .info
    }

    #[test]
    fn snapshot_clamps_position_to_duration() {
        let snap = PlaybackStatus::snapshot(
            PlaybackState::Playing,
            Some(12_345.0),
            &info(),
            &SessionFacts::default(),
        );
        assert_eq!(snap.position_ms, 10_000);
        assert_eq!(snap.progress(), Some(1.0));
    }

    #[test]
    fn snapshot_before_first_audio_is_zero() {
        let facts = SessionFacts {
            video_backend: Some("software".to_string()),
            ..SessionFacts::default()
        };
        let snap = PlaybackStatus::snapshot(PlaybackState::Paused, None, &info(), &facts);
        assert_eq!(snap.position_ms, 0);
        assert_eq!(snap.media_type, Some(MediaType::AudioVideo));
        assert_eq!(snap.video_backend.as_deref(), Some("software"));
    }

    #[test]
    fn idle_has_no_progress() {
        let snap = PlaybackStatus::idle();
        assert_eq!(snap.state, PlaybackState::Idle);
        assert_eq!(snap.progress(), None);
    }
}
