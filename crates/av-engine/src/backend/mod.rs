//! Container/codec seam.
//!
//! The engine never talks to a demuxer or codec library directly. Each backend implements:
//! - [`MediaBackend`]: open a path, optionally expose a [`HwPlatform`]
//! - [`Demuxer`]: enumerate streams, read packets in file order, seek, build decoders
//! - [`AudioDecoder`] / [`VideoDecoder`]: send/receive decode primitives plus flush

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::error::OpenError;
use crate::hwaccel::{HwDevice, HwPlatform};
use crate::media::{MediaKind, Packet, PixelFormat, RawAudioFrame, StreamDescriptor};

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod symphonia;
pub mod synthetic;

/// Opens containers and (optionally) exposes hardware decode back-ends.
pub trait MediaBackend: Send + Sync {
    /// Short backend label used in logs and status.
    fn name(&self) -> &'static str;

    /// Open and probe the container at `path`.
    fn open(&self, path: &Path) -> Result<Box<dyn Demuxer>, OpenError>;

    /// Platform hardware decode surface, if this backend supports one.
    fn hw_platform(&self) -> Option<&dyn HwPlatform> {
        None
    }
}

/// Demuxer state for one opened container. Owned by the packet router after open.
pub trait Demuxer: Send {
    /// All streams of the container, in container index order.
    fn streams(&self) -> &[StreamDescriptor];

    /// Best stream of `kind`, or `None` when the container has none.
    fn best_stream(&self, kind: MediaKind) -> Option<usize> {
        self.streams()
            .iter()
            .find(|s| s.kind == kind)
            .map(|s| s.index)
    }

    /// Container-reported duration in milliseconds.
    fn duration_ms(&self) -> Option<u64>;

    /// Container-reported frame count for a stream.
    fn frame_count(&self, stream_index: usize) -> Option<u64>;

    /// Read the next packet in file order. `Ok(None)` is end of stream.
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// Reposition to the nearest keyframe at or before `timestamp` (stream time-base ticks).
    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<()>;

    /// Build a decoder for an audio stream of this container.
    fn audio_decoder(&self, stream_index: usize) -> Result<Box<dyn AudioDecoder>, OpenError>;

    /// Build a decoder for a video stream, attaching `hw` when present.
    fn video_decoder(
        &self,
        stream_index: usize,
        hw: Option<&HwDevice>,
    ) -> Result<Box<dyn VideoDecoder>, OpenError>;
}

/// Audio send/receive decode primitives.
pub trait AudioDecoder: Send {
    fn send_packet(&mut self, packet: &Packet) -> Result<()>;

    /// Signal end of input so buffered frames can be drained.
    fn send_eof(&mut self) -> Result<()>;

    /// Next decoded frame, or `Ok(None)` when more input is needed.
    fn receive_frame(&mut self) -> Result<Option<RawAudioFrame>>;

    /// Drop all internal state (buffered input and reference frames).
    fn flush(&mut self);

    fn codec_name(&self) -> Option<String> {
        None
    }
}

/// Video send/receive decode primitives.
pub trait VideoDecoder: Send {
    fn send_packet(&mut self, packet: &Packet) -> Result<()>;

    fn send_eof(&mut self) -> Result<()>;

    fn receive_frame(&mut self) -> Result<Option<Box<dyn Picture>>>;

    fn flush(&mut self);

    /// Whether frames come back as device surfaces.
    fn hw_active(&self) -> bool {
        false
    }

    /// Copy a device surface into host memory.
    fn transfer_to_host(&mut self, picture: Box<dyn Picture>) -> Result<Box<dyn Picture>> {
        Ok(picture)
    }

    fn codec_name(&self) -> Option<String> {
        None
    }
}

/// A decoded picture with backend-specific storage.
pub trait Picture: Send {
    fn format(&self) -> PixelFormat;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Presentation timestamp in stream time-base ticks.
    fn pts(&self) -> Option<i64>;
    fn plane_count(&self) -> usize;
    fn plane(&self, index: usize) -> &[u8];
    /// Bytes per row of `plane(index)`, including padding.
    fn stride(&self, index: usize) -> usize;
    fn as_any(&self) -> &dyn Any;
}

/// Host-memory picture with explicit strides.
#[derive(Clone, Debug)]
pub struct OwnedPicture {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub pts: Option<i64>,
    pub planes: Vec<Vec<u8>>,
    pub strides: Vec<usize>,
}

impl Picture for OwnedPicture {
    fn format(&self) -> PixelFormat {
        self.format.clone()
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn pts(&self) -> Option<i64> {
        self.pts
    }

    fn plane_count(&self) -> usize {
        self.planes.len()
    }

    fn plane(&self, index: usize) -> &[u8] {
        self.planes.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    fn stride(&self, index: usize) -> usize {
        self.strides.get(index).copied().unwrap_or(0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Backend used when the caller does not pick one.
///
/// FFmpeg when compiled in, otherwise the pure-Rust audio backend.
pub fn default_backend() -> Arc<dyn MediaBackend> {
    #[cfg(feature = "ffmpeg")]
    {
        Arc::new(ffmpeg::FfmpegBackend::new())
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        Arc::new(symphonia::SymphoniaBackend)
    }
}
