//! Presentation-layer boundary.
//!
//! The engine hands decoded units to an [`AudioOutput`] and a [`VideoOutput`] and reports
//! lifecycle changes as [`EngineEvent`]s on a channel. Both outputs are shared with the
//! transport (pause/reset) so they live behind a mutex.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Result, anyhow};

use crate::media::{DecodedAudioBuffer, DecodedVideoFrame, PixelLayout};
use crate::transport::PlaybackState;

/// Audio sink fed by the audio writer.
pub trait AudioOutput: Send {
    /// Output rate to resample to for a `source_rate` stream.
    fn negotiate_rate(&mut self, source_rate: u32) -> u32 {
        source_rate
    }

    /// Called once per open before any buffer is written.
    fn init(&mut self, sample_rate: u32, channels: u16) -> Result<()>;

    /// Bytes that can be written without overrunning the sink.
    fn bytes_free(&mut self) -> usize;

    /// Queue one buffer. Callers only write when `bytes_free() >= buffer.byte_len()`.
    fn write(&mut self, buffer: DecodedAudioBuffer) -> Result<()>;

    fn set_paused(&mut self, _paused: bool) {}

    /// Drop everything queued (seek/stop).
    fn reset(&mut self) {}
}

/// Renderer fed by the presenter.
pub trait VideoOutput: Send {
    /// Called once per open with the layout every frame will use.
    fn init(&mut self, layout: PixelLayout) -> Result<()>;

    /// Show one frame.
    ///
    /// Runs while the transport lock is held, so once `seek`, `stop` or `close` returns no
    /// frame from before the command can still appear. Transport commands and audio writes
    /// wait for this call: hand the frame off (upload, swap, queue to a UI thread) and
    /// return without blocking on vsync or the display.
    fn render(&mut self, frame: DecodedVideoFrame);
}

pub type SharedAudioOutput = Arc<Mutex<Box<dyn AudioOutput>>>;
pub type SharedVideoOutput = Arc<Mutex<Box<dyn VideoOutput>>>;

pub fn shared_audio(output: impl AudioOutput + 'static) -> SharedAudioOutput {
    Arc::new(Mutex::new(Box::new(output)))
}

pub fn shared_video(output: impl VideoOutput + 'static) -> SharedVideoOutput {
    Arc::new(Mutex::new(Box::new(output)))
}

/// Notifications for the presentation layer.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    DurationKnown(u64),
    /// Playback position crossed into a new whole second.
    Progress { seconds: u64 },
    StateChanged(PlaybackState),
    /// Natural end of media. Fires once per playback.
    PlaybackFinished,
    /// Video decode back-end chosen at open (`software` or a device name).
    HwAccel { backend: String },
}

/// Headless sink that consumes PCM at real-time rate.
///
/// Behaves like a device with a `capacity_ms` buffer so the audio clock advances at the
/// speed of the media.
#[derive(Debug)]
pub struct NullAudioOutput {
    capacity_ms: u32,
    rate: u32,
    channels: u16,
    queued_frames: f64,
    last_drain: Option<Instant>,
    paused: bool,
}

impl NullAudioOutput {
    pub fn new(capacity_ms: u32) -> Self {
        Self {
            capacity_ms: capacity_ms.max(1),
            rate: 0,
            channels: 0,
            queued_frames: 0.0,
            last_drain: None,
            paused: false,
        }
    }

    fn frame_bytes(&self) -> usize {
        DecodedAudioBuffer::BYTES_PER_SAMPLE * self.channels.max(1) as usize
    }

    fn capacity_frames(&self) -> f64 {
        self.rate as f64 * self.capacity_ms as f64 / 1000.0
    }

    fn drain(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_drain {
            if !self.paused {
                let consumed = now.duration_since(last).as_secs_f64() * self.rate as f64;
                self.queued_frames = (self.queued_frames - consumed).max(0.0);
            }
        }
        self.last_drain = Some(now);
    }
}

impl AudioOutput for NullAudioOutput {
    fn init(&mut self, sample_rate: u32, channels: u16) -> Result<()> {
        if sample_rate == 0 || channels == 0 {
            return Err(anyhow!("invalid format {sample_rate} Hz / {channels} ch"));
        }
        self.rate = sample_rate;
        self.channels = channels;
        self.queued_frames = 0.0;
        self.last_drain = None;
        Ok(())
    }

    fn bytes_free(&mut self) -> usize {
        self.drain();
        let free = (self.capacity_frames() - self.queued_frames).max(0.0) as usize;
        free * self.frame_bytes()
    }

    fn write(&mut self, buffer: DecodedAudioBuffer) -> Result<()> {
        self.drain();
        self.queued_frames += buffer.frames() as f64;
        Ok(())
    }

    fn set_paused(&mut self, paused: bool) {
        self.drain();
        self.paused = paused;
    }

    fn reset(&mut self) {
        self.queued_frames = 0.0;
        self.last_drain = None;
    }
}

/// Renderer that drops every frame. Used by the headless player.
#[derive(Debug, Default)]
pub struct DiscardVideoOutput;

impl VideoOutput for DiscardVideoOutput {
    fn init(&mut self, layout: PixelLayout) -> Result<()> {
        tracing::debug!(?layout, "video output initialized");
        Ok(())
    }

    fn render(&mut self, frame: DecodedVideoFrame) {
        tracing::trace!(pts_ms = frame.pts_ms, "frame discarded");
    }
}
