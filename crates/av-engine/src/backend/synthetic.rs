//! Deterministic test-pattern backend.
//!
//! Produces a sine tone and a gray-ramp picture without touching the filesystem. Faults can
//! be injected per packet or per frame, and fake hardware devices can be advertised, so the
//! whole engine can be exercised without media files or system codec libraries.

use std::path::Path;

use anyhow::{Result, anyhow, bail};

use crate::backend::{AudioDecoder, Demuxer, MediaBackend, OwnedPicture, Picture, VideoDecoder};
use crate::error::OpenError;
use crate::hwaccel::{HwConfig, HwDevice, HwDeviceType, HwPlatform};
use crate::media::{
    CodecId, MediaKind, Packet, PixelFormat, RawAudioFrame, SampleFormat, StreamDescriptor,
    TimeBase, chroma_size,
};

const CORRUPT_MARKER: &[u8] = b"corrupt";
const TONE_HZ: f64 = 440.0;
const HW_PIXEL_FORMAT: &str = "synthetic_hw";

#[derive(Clone, Debug)]
pub struct SyntheticAudio {
    pub sample_rate: u32,
    pub channels: u16,
    /// Length of one packet in milliseconds.
    pub packet_ms: u32,
    pub format: SampleFormat,
    pub planar: bool,
}

impl Default for SyntheticAudio {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            packet_ms: 20,
            format: SampleFormat::F32,
            planar: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyntheticVideo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub keyframe_interval: u32,
    pub pixel_format: PixelFormat,
    /// Extra bytes at the end of every row, to exercise stride removal.
    pub row_padding: usize,
}

impl Default for SyntheticVideo {
    fn default() -> Self {
        Self {
            width: 64,
            height: 36,
            fps: 25,
            keyframe_interval: 25,
            pixel_format: PixelFormat::Yuv420p,
            row_padding: 16,
        }
    }
}

/// Description of the media the synthetic backend pretends to open.
#[derive(Clone, Debug)]
pub struct SyntheticMedia {
    pub duration_ms: u64,
    pub audio: Option<SyntheticAudio>,
    pub video: Option<SyntheticVideo>,
    /// Report the duration in container metadata.
    pub report_duration: bool,
    pub report_frame_counts: bool,
    /// `(kind, n)`: the n-th packet of that stream fails to decode.
    pub corrupt_packets: Vec<(MediaKind, u64)>,
    /// Video frame numbers emitted in a pixel format the pipeline cannot normalize.
    pub unsupported_frames: Vec<u64>,
    /// Devices the fake platform lists and can create.
    pub hw_devices: Vec<HwDeviceType>,
    /// Devices the fake platform lists but fails to create.
    pub hw_broken: Vec<HwDeviceType>,
    /// Stream kind whose decoder is missing.
    pub missing_decoder: Option<MediaKind>,
    /// Fail `open` with this reason.
    pub open_error: Option<String>,
}

impl Default for SyntheticMedia {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
            audio: Some(SyntheticAudio::default()),
            video: Some(SyntheticVideo::default()),
            report_duration: true,
            report_frame_counts: true,
            corrupt_packets: Vec::new(),
            unsupported_frames: Vec::new(),
            hw_devices: Vec::new(),
            hw_broken: Vec::new(),
            missing_decoder: None,
            open_error: None,
        }
    }
}

impl SyntheticMedia {
    pub fn audio_only(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            video: None,
            ..Self::default()
        }
    }

    pub fn video_only(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            audio: None,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SyntheticBackend {
    media: SyntheticMedia,
}

impl SyntheticBackend {
    pub fn new(media: SyntheticMedia) -> Self {
        Self { media }
    }
}

impl MediaBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Demuxer>, OpenError> {
        if let Some(reason) = &self.media.open_error {
            return Err(OpenError::ContainerOpen {
                path: path.to_path_buf(),
                reason: reason.clone(),
            });
        }
        tracing::debug!(path = %path.display(), "opening synthetic media");
        Ok(Box::new(SyntheticDemuxer::new(self.media.clone())))
    }

    fn hw_platform(&self) -> Option<&dyn HwPlatform> {
        if self.media.hw_devices.is_empty() && self.media.hw_broken.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

impl HwPlatform for SyntheticBackend {
    fn device_types(&self) -> Vec<HwDeviceType> {
        self.media
            .hw_broken
            .iter()
            .chain(self.media.hw_devices.iter())
            .copied()
            .collect()
    }

    fn codec_configs(&self, _codec: &CodecId) -> Vec<HwConfig> {
        self.device_types()
            .into_iter()
            .map(|device_type| HwConfig {
                device_type,
                pixel_format: HW_PIXEL_FORMAT.to_string(),
                supports_device_ctx: true,
            })
            .collect()
    }

    fn create_device(&self, device_type: HwDeviceType, pixel_format: &str) -> Result<HwDevice> {
        if self.media.hw_devices.contains(&device_type) {
            Ok(HwDevice::new(device_type, pixel_format, Box::new(())))
        } else {
            Err(anyhow!("synthetic {device_type} device unavailable"))
        }
    }
}

struct SyntheticDemuxer {
    media: SyntheticMedia,
    streams: Vec<StreamDescriptor>,
    audio_index: Option<usize>,
    video_index: Option<usize>,
    next_audio_packet: u64,
    next_video_frame: u64,
}

impl SyntheticDemuxer {
    fn new(media: SyntheticMedia) -> Self {
        let mut streams = Vec::new();
        let audio_index = media.audio.as_ref().map(|a| {
            streams.push(StreamDescriptor {
                index: streams.len(),
                kind: MediaKind::Audio,
                codec: CodecId::new("sine"),
                time_base: TimeBase::new(1, a.sample_rate as i64),
                width: None,
                height: None,
                sample_rate: Some(a.sample_rate),
                channels: Some(a.channels),
            });
            streams.len() - 1
        });
        let video_index = media.video.as_ref().map(|v| {
            streams.push(StreamDescriptor {
                index: streams.len(),
                kind: MediaKind::Video,
                codec: CodecId::new("testsrc"),
                time_base: TimeBase::new(1, v.fps as i64),
                width: Some(v.width),
                height: Some(v.height),
                sample_rate: None,
                channels: None,
            });
            streams.len() - 1
        });
        Self {
            media,
            streams,
            audio_index,
            video_index,
            next_audio_packet: 0,
            next_video_frame: 0,
        }
    }

    fn audio_packet_count(&self) -> u64 {
        match &self.media.audio {
            Some(a) => self.media.duration_ms.div_ceil(a.packet_ms.max(1) as u64),
            None => 0,
        }
    }

    fn video_frame_count(&self) -> u64 {
        match &self.media.video {
            Some(v) => (self.media.duration_ms * v.fps as u64).div_ceil(1000),
            None => 0,
        }
    }

    fn audio_packet_start_ms(&self, n: u64) -> u64 {
        self.media
            .audio
            .as_ref()
            .map_or(u64::MAX, |a| n * a.packet_ms.max(1) as u64)
    }

    fn video_frame_start_ms(&self, n: u64) -> u64 {
        self.media
            .video
            .as_ref()
            .map_or(u64::MAX, |v| n * 1000 / v.fps.max(1) as u64)
    }

    fn payload(&self, kind: MediaKind, n: u64) -> Vec<u8> {
        if self.media.corrupt_packets.contains(&(kind, n)) {
            CORRUPT_MARKER.to_vec()
        } else {
            n.to_le_bytes().to_vec()
        }
    }

    fn audio_packet(&self, index: usize, n: u64) -> Option<Packet> {
        let a = self.media.audio.as_ref()?;
        let samples_per_packet = a.sample_rate as u64 * a.packet_ms.max(1) as u64 / 1000;
        let start = n * samples_per_packet;
        let total = self.media.duration_ms * a.sample_rate as u64 / 1000;
        let len = samples_per_packet.min(total.saturating_sub(start));
        Some(Packet {
            stream_index: index,
            pts: Some(start as i64),
            dts: Some(start as i64),
            duration: len as i64,
            is_key: true,
            data: self.payload(MediaKind::Audio, n),
        })
    }

    fn video_packet(&self, index: usize, n: u64) -> Option<Packet> {
        let v = self.media.video.as_ref()?;
        Some(Packet {
            stream_index: index,
            pts: Some(n as i64),
            dts: Some(n as i64),
            duration: 1,
            is_key: n % v.keyframe_interval.max(1) as u64 == 0,
            data: self.payload(MediaKind::Video, n),
        })
    }
}

impl Demuxer for SyntheticDemuxer {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn duration_ms(&self) -> Option<u64> {
        self.media.report_duration.then_some(self.media.duration_ms)
    }

    fn frame_count(&self, stream_index: usize) -> Option<u64> {
        if !self.media.report_frame_counts {
            return None;
        }
        if Some(stream_index) == self.audio_index {
            Some(self.audio_packet_count())
        } else if Some(stream_index) == self.video_index {
            Some(self.video_frame_count())
        } else {
            None
        }
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let audio_left = self.next_audio_packet < self.audio_packet_count();
        let video_left = self.next_video_frame < self.video_frame_count();
        let audio_ms = self.audio_packet_start_ms(self.next_audio_packet);
        let video_ms = self.video_frame_start_ms(self.next_video_frame);

        match (audio_left, video_left) {
            (false, false) => Ok(None),
            (true, false) => self.take_audio(),
            (false, true) => self.take_video(),
            (true, true) if audio_ms <= video_ms => self.take_audio(),
            (true, true) => self.take_video(),
        }
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<()> {
        let stream = self
            .streams
            .get(stream_index)
            .ok_or_else(|| anyhow!("no stream {stream_index}"))?;
        let target_ms = stream.time_base.to_ms(timestamp.max(0)).max(0.0) as u64;

        let mut resume_ms = target_ms;
        if let Some(v) = &self.media.video {
            let fps = v.fps.max(1) as u64;
            let interval = v.keyframe_interval.max(1) as u64;
            let frame = target_ms * fps / 1000;
            let key = frame - frame % interval;
            self.next_video_frame = key;
            resume_ms = self.video_frame_start_ms(key);
        }
        if let Some(a) = &self.media.audio {
            self.next_audio_packet = resume_ms / a.packet_ms.max(1) as u64;
        }
        tracing::debug!(target_ms, resume_ms, "synthetic seek");
        Ok(())
    }

    fn audio_decoder(&self, stream_index: usize) -> Result<Box<dyn AudioDecoder>, OpenError> {
        let stream = self.streams.get(stream_index).ok_or(OpenError::NoSuchStream)?;
        if self.media.missing_decoder == Some(MediaKind::Audio) {
            return Err(OpenError::CodecUnsupported {
                kind: MediaKind::Audio,
                codec: stream.codec.clone(),
            });
        }
        let audio = self.media.audio.clone().ok_or(OpenError::NoSuchStream)?;
        Ok(Box::new(SineDecoder {
            audio,
            pending: None,
        }))
    }

    fn video_decoder(
        &self,
        stream_index: usize,
        hw: Option<&HwDevice>,
    ) -> Result<Box<dyn VideoDecoder>, OpenError> {
        let stream = self.streams.get(stream_index).ok_or(OpenError::NoSuchStream)?;
        if self.media.missing_decoder == Some(MediaKind::Video) {
            return Err(OpenError::CodecUnsupported {
                kind: MediaKind::Video,
                codec: stream.codec.clone(),
            });
        }
        let video = self.media.video.clone().ok_or(OpenError::NoSuchStream)?;
        Ok(Box::new(RampDecoder {
            video,
            unsupported: self.media.unsupported_frames.clone(),
            hw_format: hw.map(|d| d.pixel_format.clone()),
            pending: None,
        }))
    }
}

impl SyntheticDemuxer {
    fn take_audio(&mut self) -> Result<Option<Packet>> {
        let index = self.audio_index.ok_or_else(|| anyhow!("no audio stream"))?;
        let packet = self.audio_packet(index, self.next_audio_packet);
        self.next_audio_packet += 1;
        Ok(packet)
    }

    fn take_video(&mut self) -> Result<Option<Packet>> {
        let index = self.video_index.ok_or_else(|| anyhow!("no video stream"))?;
        let packet = self.video_packet(index, self.next_video_frame);
        self.next_video_frame += 1;
        Ok(packet)
    }
}

fn packet_number(packet: &Packet) -> Result<u64> {
    if packet.data == CORRUPT_MARKER {
        bail!("corrupt packet at pts {:?}", packet.pts);
    }
    let bytes: [u8; 8] = packet
        .data
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("malformed packet of {} bytes", packet.data.len()))?;
    Ok(u64::from_le_bytes(bytes))
}

struct SineDecoder {
    audio: SyntheticAudio,
    pending: Option<RawAudioFrame>,
}

impl SineDecoder {
    fn render(&self, start: i64, samples: usize) -> RawAudioFrame {
        let a = &self.audio;
        let channels = a.channels.max(1) as usize;
        let mut planes = if a.planar {
            vec![Vec::with_capacity(samples * a.format.bytes()); channels]
        } else {
            vec![Vec::with_capacity(samples * channels * a.format.bytes())]
        };
        for i in 0..samples {
            let t = (start + i as i64) as f64 / a.sample_rate.max(1) as f64;
            let v = 0.25 * (2.0 * std::f64::consts::PI * TONE_HZ * t).sin();
            for ch in 0..channels {
                let plane = if a.planar { &mut planes[ch] } else { &mut planes[0] };
                encode_sample(a.format, v, plane);
            }
        }
        RawAudioFrame {
            format: a.format,
            planar: a.planar,
            channels: a.channels,
            sample_rate: a.sample_rate,
            samples,
            pts: Some(start),
            planes,
        }
    }
}

fn encode_sample(format: SampleFormat, v: f64, out: &mut Vec<u8>) {
    match format {
        SampleFormat::U8 => out.push((v * 127.0 + 128.0) as u8),
        SampleFormat::S16 => out.extend_from_slice(&((v * i16::MAX as f64) as i16).to_ne_bytes()),
        SampleFormat::S32 => out.extend_from_slice(&((v * i32::MAX as f64) as i32).to_ne_bytes()),
        SampleFormat::F32 => out.extend_from_slice(&(v as f32).to_ne_bytes()),
        SampleFormat::F64 => out.extend_from_slice(&v.to_ne_bytes()),
    }
}

impl AudioDecoder for SineDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        packet_number(packet)?;
        let start = packet.pts.unwrap_or(0);
        self.pending = Some(self.render(start, packet.duration.max(0) as usize));
        Ok(())
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<RawAudioFrame>> {
        Ok(self.pending.take())
    }

    fn flush(&mut self) {
        self.pending = None;
    }

    fn codec_name(&self) -> Option<String> {
        Some("sine".to_string())
    }
}

struct RampDecoder {
    video: SyntheticVideo,
    unsupported: Vec<u64>,
    hw_format: Option<String>,
    pending: Option<OwnedPicture>,
}

impl RampDecoder {
    fn render(&self, n: u64, pts: Option<i64>) -> OwnedPicture {
        let v = &self.video;
        let luma = (n % 256) as u8;
        let format = if self.unsupported.contains(&n) {
            PixelFormat::Other("rgb24".to_string())
        } else if let Some(hw) = &self.hw_format {
            PixelFormat::Hardware(hw.clone())
        } else {
            v.pixel_format.clone()
        };
        let (cw, ch) = chroma_size(v.width, v.height);
        let w = v.width as usize;
        let h = v.height as usize;
        let pad = v.row_padding;
        let plane = |row: usize, rows: usize, fill: u8| (vec![fill; (row + pad) * rows], row + pad);
        let layout: Vec<(Vec<u8>, usize)> = match &format {
            PixelFormat::Yuv420p => vec![plane(w, h, luma), plane(cw, ch, 128), plane(cw, ch, 128)],
            PixelFormat::Nv12 | PixelFormat::Hardware(_) => {
                vec![plane(w, h, luma), plane(cw * 2, ch, 128)]
            }
            PixelFormat::Other(_) => vec![plane(w * 3, h, luma)],
        };
        let (planes, strides): (Vec<Vec<u8>>, Vec<usize>) = layout.into_iter().unzip();
        OwnedPicture {
            format,
            width: v.width,
            height: v.height,
            pts,
            planes,
            strides,
        }
    }
}

impl VideoDecoder for RampDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let n = packet_number(packet)?;
        self.pending = Some(self.render(n, packet.pts));
        Ok(())
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<Box<dyn Picture>>> {
        Ok(self
            .pending
            .take()
            .map(|p| Box::new(p) as Box<dyn Picture>))
    }

    fn flush(&mut self) {
        self.pending = None;
    }

    fn hw_active(&self) -> bool {
        self.hw_format.is_some()
    }

    fn transfer_to_host(&mut self, picture: Box<dyn Picture>) -> Result<Box<dyn Picture>> {
        if !matches!(picture.format(), PixelFormat::Hardware(_)) {
            return Ok(picture);
        }
        let planes: Vec<Vec<u8>> = (0..picture.plane_count())
            .map(|i| picture.plane(i).to_vec())
            .collect();
        let strides = (0..picture.plane_count()).map(|i| picture.stride(i)).collect();
        Ok(Box::new(OwnedPicture {
            format: PixelFormat::Nv12,
            width: picture.width(),
            height: picture.height(),
            pts: picture.pts(),
            planes,
            strides,
        }))
    }

    fn codec_name(&self) -> Option<String> {
        Some("testsrc".to_string())
    }
}
