//! Stream catalog: open a container, select streams, build decoders.

use std::path::{Path, PathBuf};

use crate::backend::{AudioDecoder, Demuxer, MediaBackend, VideoDecoder};
use crate::config::EngineConfig;
use crate::error::OpenError;
use crate::hwaccel::{HwSelection, HwSelector};
use crate::media::{MediaKind, MediaType, StreamDescriptor};

/// What was found in an opened container.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub media_type: MediaType,
    pub audio: Option<StreamDescriptor>,
    pub video: Option<StreamDescriptor>,
    /// `None` when the container does not report a duration.
    pub duration_ms: Option<u64>,
    audio_frames: Option<u64>,
    video_frames: Option<u64>,
}

impl MediaInfo {
    /// Stream used for container seeks: video unless the media is audio-only.
    pub fn default_stream(&self) -> Option<&StreamDescriptor> {
        self.video.as_ref().or(self.audio.as_ref())
    }

    /// Container-reported frame count for `kind`, or `-1` when unknown.
    pub fn frame_count(&self, kind: MediaKind) -> i64 {
        let count = match kind {
            MediaKind::Audio => self.audio_frames,
            MediaKind::Video => self.video_frames,
        };
        count.map_or(-1, |n| n as i64)
    }
}

/// Everything the transport needs to start playback of one container.
pub struct OpenedMedia {
    pub info: MediaInfo,
    pub demuxer: Box<dyn Demuxer>,
    pub audio_decoder: Option<Box<dyn AudioDecoder>>,
    pub video_decoder: Option<Box<dyn VideoDecoder>>,
    pub hw: HwSelection,
}

/// Open `path`, pick the best audio and video stream and build their decoders.
pub fn open(
    backend: &dyn MediaBackend,
    path: &Path,
    config: &EngineConfig,
) -> Result<OpenedMedia, OpenError> {
    let demuxer = backend.open(path)?;

    let find = |kind: MediaKind| {
        demuxer
            .best_stream(kind)
            .and_then(|idx| demuxer.streams().iter().find(|s| s.index == idx))
            .filter(|s| s.kind == kind)
            .cloned()
    };
    let audio = find(MediaKind::Audio);
    let video = find(MediaKind::Video);

    let media_type = match (&audio, &video) {
        (Some(_), Some(_)) => MediaType::AudioVideo,
        (Some(_), None) => MediaType::AudioOnly,
        (None, Some(_)) => MediaType::VideoOnly,
        (None, None) => return Err(OpenError::NoSuchStream),
    };

    let audio_decoder = audio
        .as_ref()
        .map(|s| demuxer.audio_decoder(s.index))
        .transpose()?;

    let mut hw = HwSelection::Software;
    let mut video_decoder = None;
    if let Some(stream) = &video {
        if config.hwaccel {
            if let Some(platform) = backend.hw_platform() {
                hw = HwSelector::new(platform, config.cuda_max_width)
                    .select(&stream.codec, stream.width.unwrap_or(0));
            }
        }
        video_decoder = Some(match demuxer.video_decoder(stream.index, hw.device()) {
            Ok(decoder) => decoder,
            Err(err) if hw.device().is_some() => {
                tracing::warn!(
                    backend = hw.backend_name(),
                    "hardware decoder init failed, retrying in software: {err}"
                );
                hw = HwSelection::Software;
                demuxer.video_decoder(stream.index, None)?
            }
            Err(err) => return Err(err),
        });
    }

    let info = MediaInfo {
        path: path.to_path_buf(),
        media_type,
        duration_ms: demuxer.duration_ms(),
        audio_frames: audio.as_ref().and_then(|s| demuxer.frame_count(s.index)),
        video_frames: video.as_ref().and_then(|s| demuxer.frame_count(s.index)),
        audio,
        video,
    };

    tracing::info!(
        path = %path.display(),
        backend = backend.name(),
        media_type = ?info.media_type,
        audio_codec = info.audio.as_ref().map(|s| s.codec.as_str()),
        video_codec = info.video.as_ref().map(|s| s.codec.as_str()),
        duration_ms = info.duration_ms,
        video_backend = hw.backend_name(),
        "media opened"
    );

    Ok(OpenedMedia {
        info,
        demuxer,
        audio_decoder,
        video_decoder,
        hw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::synthetic::{SyntheticBackend, SyntheticMedia};
    use crate::hwaccel::HwDeviceType;

    fn open_synthetic(media: SyntheticMedia, config: &EngineConfig) -> Result<OpenedMedia, OpenError> {
        open(&SyntheticBackend::new(media), Path::new("test.synthetic"), config)
    }

    #[test]
    fn two_stream_media_reports_duration_and_counts() {
        let opened = open_synthetic(SyntheticMedia::default(), &EngineConfig::default()).unwrap();
        let info = &opened.info;
        assert_eq!(info.media_type, MediaType::AudioVideo);
        assert_eq!(info.duration_ms, Some(10_000));
        assert_eq!(info.frame_count(MediaKind::Video), 250);
        assert_eq!(info.default_stream().unwrap().kind, MediaKind::Video);
        assert!(opened.audio_decoder.is_some());
        assert!(opened.video_decoder.is_some());
    }

    #[test]
    fn audio_only_seeks_on_audio_stream() {
        let opened =
            open_synthetic(SyntheticMedia::audio_only(2000), &EngineConfig::default()).unwrap();
        assert_eq!(opened.info.media_type, MediaType::AudioOnly);
        assert_eq!(opened.info.default_stream().unwrap().kind, MediaKind::Audio);
        assert!(opened.video_decoder.is_none());
    }

    #[test]
    fn missing_metadata_is_unknown_not_guessed() {
        let media = SyntheticMedia {
            report_duration: false,
            report_frame_counts: false,
            ..SyntheticMedia::default()
        };
        let opened = open_synthetic(media, &EngineConfig::default()).unwrap();
        assert_eq!(opened.info.duration_ms, None);
        assert_eq!(opened.info.frame_count(MediaKind::Video), -1);
        assert_eq!(opened.info.frame_count(MediaKind::Audio), -1);
    }

    #[test]
    fn no_streams_is_an_error() {
        let media = SyntheticMedia {
            audio: None,
            video: None,
            ..SyntheticMedia::default()
        };
        let err = open_synthetic(media, &EngineConfig::default()).err().unwrap();
        assert!(matches!(err, OpenError::NoSuchStream));
    }

    #[test]
    fn unreadable_container_is_an_error() {
        let media = SyntheticMedia {
            open_error: Some("truncated header".to_string()),
            ..SyntheticMedia::default()
        };
        let err = open_synthetic(media, &EngineConfig::default()).err().unwrap();
        assert!(matches!(err, OpenError::ContainerOpen { .. }));
    }

    #[test]
    fn missing_decoder_is_codec_unsupported() {
        let media = SyntheticMedia {
            missing_decoder: Some(MediaKind::Video),
            ..SyntheticMedia::default()
        };
        let err = open_synthetic(media, &EngineConfig::default()).err().unwrap();
        assert!(matches!(
            err,
            OpenError::CodecUnsupported {
                kind: MediaKind::Video,
                ..
            }
        ));
    }

    #[test]
    fn hardware_is_selected_when_available() {
        let media = SyntheticMedia {
            hw_broken: vec![HwDeviceType::Cuda],
            hw_devices: vec![HwDeviceType::Vaapi],
            ..SyntheticMedia::default()
        };
        let opened = open_synthetic(media.clone(), &EngineConfig::default()).unwrap();
        assert_eq!(opened.hw.backend_name(), "vaapi");
        assert!(opened.video_decoder.unwrap().hw_active());

        let config = EngineConfig {
            hwaccel: false,
            ..EngineConfig::default()
        };
        let opened = open_synthetic(media, &config).unwrap();
        assert_eq!(opened.hw.backend_name(), "software");
    }
}
