//! Media data model shared by every stage.
//!
//! - [`StreamDescriptor`]: one selected elementary stream (immutable after selection)
//! - [`Packet`]: compressed, timestamped unit routed to exactly one pipeline
//! - [`DecodedAudioBuffer`] / [`DecodedVideoFrame`]: renderer-ready units, moved (never shared)
//!   from the pipeline to the sink/presenter and finally to the output

use std::fmt;

/// Kind of an elementary stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Which streams an opened container ended up with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaType {
    AudioOnly,
    VideoOnly,
    AudioVideo,
}

/// Rational ticks-per-second time base (`num / den` seconds per tick).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i64,
    pub den: i64,
}

impl TimeBase {
    pub const MILLIS: TimeBase = TimeBase { num: 1, den: 1000 };

    pub fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// Convert a timestamp in this time base to milliseconds.
    ///
    /// A zero denominator yields `0.0` rather than a division fault.
    pub fn to_ms(&self, ts: i64) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        ts as f64 * self.num as f64 * 1000.0 / self.den as f64
    }

    /// Convert milliseconds to the nearest tick at or before `ms`.
    pub fn from_ms(&self, ms: f64) -> i64 {
        if self.num == 0 {
            return 0;
        }
        (ms * self.den as f64 / (self.num as f64 * 1000.0)).floor() as i64
    }
}

/// Codec identity as reported by the container.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CodecId(pub String);

impl CodecId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One elementary stream of an opened container.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamDescriptor {
    /// Container stream index (what [`Packet::stream_index`] refers to).
    pub index: usize,
    pub kind: MediaKind,
    pub codec: CodecId,
    pub time_base: TimeBase,
    /// Display width (video only).
    pub width: Option<u32>,
    /// Display height (video only).
    pub height: Option<u32>,
    /// Native sample rate (audio only).
    pub sample_rate: Option<u32>,
    /// Native channel count (audio only).
    pub channels: Option<u16>,
}

/// A compressed unit of one stream, in container read order.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub stream_index: usize,
    /// Presentation timestamp in stream time-base ticks.
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub is_key: bool,
    pub data: Vec<u8>,
}

/// Interleaved signed 16-bit little-endian PCM, ready for the audio sink.
#[derive(Debug, PartialEq)]
pub struct DecodedAudioBuffer {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Presentation time in milliseconds.
    pub pts_ms: f64,
}

impl DecodedAudioBuffer {
    /// Bytes per interleaved output frame (all channels, 16-bit).
    pub const BYTES_PER_SAMPLE: usize = 2;

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn frames(&self) -> usize {
        let frame_bytes = Self::BYTES_PER_SAMPLE * self.channels.max(1) as usize;
        self.data.len() / frame_bytes
    }

    /// Playback length of this buffer in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        self.duration_ms_of(self.frames())
    }

    /// Split off everything after the first `frames` frames, advancing its pts accordingly.
    ///
    /// Returns `None` when the buffer is not longer than `frames`.
    pub fn split_off_frames(&mut self, frames: usize) -> Option<DecodedAudioBuffer> {
        let frame_bytes = Self::BYTES_PER_SAMPLE * self.channels.max(1) as usize;
        let at = frames.max(1) * frame_bytes;
        if self.data.len() <= at {
            return None;
        }
        let head_ms = self.duration_ms_of(frames.max(1));
        Some(DecodedAudioBuffer {
            data: self.data.split_off(at),
            sample_rate: self.sample_rate,
            channels: self.channels,
            pts_ms: self.pts_ms + head_ms,
        })
    }

    fn duration_ms_of(&self, frames: usize) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Iterate the samples as `i16`.
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
    }
}

/// Canonical 4:2:0 layouts handed to the renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    /// Y plane followed by one interleaved UV plane (NV12).
    TwoPlane,
    /// Y, U and V planes (YUV420P).
    ThreePlane,
}

/// Borrowed plane view of a [`DecodedVideoFrame`].
#[derive(Debug, PartialEq, Eq)]
pub enum FramePlanes<'a> {
    TwoPlane { y: &'a [u8], uv: &'a [u8] },
    ThreePlane { y: &'a [u8], u: &'a [u8], v: &'a [u8] },
}

/// Tightly packed (no stride padding) 4:2:0 picture.
#[derive(Debug, PartialEq)]
pub struct DecodedVideoFrame {
    pub layout: PixelLayout,
    pub width: u32,
    pub height: u32,
    /// Presentation time in milliseconds.
    pub pts_ms: f64,
    pub data: Vec<u8>,
}

/// Chroma dimensions for a 4:2:0 picture (odd sizes round up).
pub fn chroma_size(width: u32, height: u32) -> (usize, usize) {
    (width.div_ceil(2) as usize, height.div_ceil(2) as usize)
}

/// Byte size of a tightly packed 4:2:0 picture, identical for both layouts.
pub fn packed_420_len(width: u32, height: u32) -> usize {
    let (cw, ch) = chroma_size(width, height);
    width as usize * height as usize + 2 * cw * ch
}

impl DecodedVideoFrame {
    pub fn planes(&self) -> FramePlanes<'_> {
        let luma = self.width as usize * self.height as usize;
        let (cw, ch) = chroma_size(self.width, self.height);
        let chroma = cw * ch;
        let (y, rest) = self.data.split_at(luma.min(self.data.len()));
        match self.layout {
            PixelLayout::TwoPlane => FramePlanes::TwoPlane { y, uv: rest },
            PixelLayout::ThreePlane => {
                let (u, v) = rest.split_at(chroma.min(rest.len()));
                FramePlanes::ThreePlane { y, u, v }
            }
        }
    }
}

/// Raw sample encodings a decoder may hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
}

impl SampleFormat {
    pub fn bytes(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }
}

/// Decoder output before resampling. Samples are native-endian.
#[derive(Clone, Debug, PartialEq)]
pub struct RawAudioFrame {
    pub format: SampleFormat,
    /// One plane per channel when `true`, a single interleaved plane otherwise.
    pub planar: bool,
    pub channels: u16,
    pub sample_rate: u32,
    /// Samples per channel.
    pub samples: usize,
    /// Presentation timestamp in stream time-base ticks.
    pub pts: Option<i64>,
    pub planes: Vec<Vec<u8>>,
}

/// Pixel formats as seen by the pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    /// Opaque device surface that must be transferred to host memory first.
    Hardware(String),
    Other(String),
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Yuv420p => f.write_str("yuv420p"),
            PixelFormat::Nv12 => f.write_str("nv12"),
            PixelFormat::Hardware(name) => write!(f, "hw:{name}"),
            PixelFormat::Other(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_base_converts_ticks_to_ms() {
        let tb = TimeBase::new(1, 90_000);
        assert_eq!(tb.to_ms(90_000), 1000.0);
        assert_eq!(tb.from_ms(1000.0), 90_000);
        let audio = TimeBase::new(1, 48_000);
        assert_eq!(audio.to_ms(24_000), 500.0);
    }

    #[test]
    fn time_base_zero_den_is_safe() {
        let tb = TimeBase::new(1, 0);
        assert_eq!(tb.to_ms(1234), 0.0);
    }

    #[test]
    fn audio_buffer_duration_follows_frames() {
        let buf = DecodedAudioBuffer {
            data: vec![0u8; 48_000 * 2 * 2 / 10],
            sample_rate: 48_000,
            channels: 2,
            pts_ms: 0.0,
        };
        assert_eq!(buf.frames(), 4800);
        assert!((buf.duration_ms() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn split_off_frames_advances_pts() {
        let mut buf = DecodedAudioBuffer {
            data: vec![0u8; 1000 * 2 * 2],
            sample_rate: 1000,
            channels: 2,
            pts_ms: 500.0,
        };
        let tail = buf.split_off_frames(400).unwrap();
        assert_eq!(buf.frames(), 400);
        assert_eq!(tail.frames(), 600);
        assert_eq!(tail.pts_ms, 900.0);
        let mut short = tail;
        assert!(short.split_off_frames(600).is_none());
    }

    #[test]
    fn three_plane_split_matches_chroma_size() {
        let frame = DecodedVideoFrame {
            layout: PixelLayout::ThreePlane,
            width: 5,
            height: 3,
            pts_ms: 0.0,
            data: vec![0u8; packed_420_len(5, 3)],
        };
        match frame.planes() {
            FramePlanes::ThreePlane { y, u, v } => {
                assert_eq!(y.len(), 15);
                assert_eq!(u.len(), 6);
                assert_eq!(v.len(), 6);
            }
            other => panic!("unexpected planes {other:?}"),
        }
    }

    #[test]
    fn two_plane_split_keeps_interleaved_chroma() {
        let frame = DecodedVideoFrame {
            layout: PixelLayout::TwoPlane,
            width: 4,
            height: 4,
            pts_ms: 0.0,
            data: vec![0u8; packed_420_len(4, 4)],
        };
        match frame.planes() {
            FramePlanes::TwoPlane { y, uv } => {
                assert_eq!(y.len(), 16);
                assert_eq!(uv.len(), 8);
            }
            other => panic!("unexpected planes {other:?}"),
        }
    }
}
