//! Recording outputs and event helpers shared by engine tests.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::Receiver;

use crate::clock::PlaybackClock;
use crate::media::{DecodedAudioBuffer, DecodedVideoFrame, PixelLayout};
use crate::output::{
    AudioOutput, EngineEvent, NullAudioOutput, SharedAudioOutput, SharedVideoOutput, VideoOutput,
    shared_audio, shared_video,
};

#[derive(Clone, Debug, Default)]
pub(crate) struct OutputLog {
    pub(crate) audio_inits: Vec<(u32, u16)>,
    pub(crate) video_inits: Vec<PixelLayout>,
    pub(crate) audio_pts: Vec<f64>,
    pub(crate) video_pts: Vec<f64>,
    /// Clock reading at each render, when [`OutputLog::clock`] is attached.
    pub(crate) video_clock: Vec<Option<f64>>,
    pub(crate) clock: Option<Arc<PlaybackClock>>,
    pub(crate) resets: usize,
    /// `(audio_pts.len(), video_pts.len())` at each [`OutputLog::mark_seek`].
    pub(crate) seek_marks: Vec<(usize, usize)>,
}

impl OutputLog {
    pub(crate) fn mark_seek(&mut self) {
        self.seek_marks
            .push((self.audio_pts.len(), self.video_pts.len()));
    }
}

pub(crate) type SharedLog = Arc<Mutex<OutputLog>>;

struct RecordingAudio {
    inner: NullAudioOutput,
    log: SharedLog,
}

impl AudioOutput for RecordingAudio {
    fn init(&mut self, sample_rate: u32, channels: u16) -> Result<()> {
        self.log.lock().unwrap().audio_inits.push((sample_rate, channels));
        self.inner.init(sample_rate, channels)
    }

    fn bytes_free(&mut self) -> usize {
        self.inner.bytes_free()
    }

    fn write(&mut self, buffer: DecodedAudioBuffer) -> Result<()> {
        self.log.lock().unwrap().audio_pts.push(buffer.pts_ms);
        self.inner.write(buffer)
    }

    fn set_paused(&mut self, paused: bool) {
        self.inner.set_paused(paused);
    }

    fn reset(&mut self) {
        self.log.lock().unwrap().resets += 1;
        self.inner.reset();
    }
}

struct RecordingVideo {
    log: SharedLog,
}

impl VideoOutput for RecordingVideo {
    fn init(&mut self, layout: PixelLayout) -> Result<()> {
        self.log.lock().unwrap().video_inits.push(layout);
        Ok(())
    }

    fn render(&mut self, frame: DecodedVideoFrame) {
        let mut log = self.log.lock().unwrap();
        let clock = log.clock.as_ref().and_then(|c| c.read());
        log.video_pts.push(frame.pts_ms);
        log.video_clock.push(clock);
    }
}

/// Outputs that record every call. Audio drains in real time from a `capacity_ms` buffer.
pub(crate) fn recording_outputs(
    capacity_ms: u32,
) -> (SharedAudioOutput, SharedVideoOutput, SharedLog) {
    let log = SharedLog::default();
    let audio = shared_audio(RecordingAudio {
        inner: NullAudioOutput::new(capacity_ms),
        log: log.clone(),
    });
    let video = shared_video(RecordingVideo { log: log.clone() });
    (audio, video, log)
}

/// Receive events until one matches `done`. Panics with everything seen on timeout.
pub(crate) fn collect_until(
    rx: &Receiver<EngineEvent>,
    timeout: Duration,
    done: impl Fn(&EngineEvent) -> bool,
) -> Vec<EngineEvent> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(event) => {
                let matched = done(&event);
                seen.push(event);
                if matched {
                    return seen;
                }
            }
            Err(_) => panic!("timed out waiting for event; saw {seen:?}"),
        }
    }
}
