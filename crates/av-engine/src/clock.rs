//! Master playback clock.
//!
//! With an audio stream the clock is a single atomic scalar written by the audio writer after
//! each buffer is queued to the sink. Without one it is a monotonic wall-clock timer that the
//! transport starts, pauses and rebases.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

const UNSET: u64 = u64::MAX;

/// Shared media-timeline position in milliseconds.
#[derive(Debug)]
pub struct PlaybackClock {
    audio_driven: bool,
    position_bits: AtomicU64,
    wall: Mutex<WallTimer>,
}

#[derive(Debug, Default)]
struct WallTimer {
    base_ms: f64,
    started: Option<Instant>,
}

impl WallTimer {
    fn now_ms(&self) -> f64 {
        match self.started {
            Some(at) => self.base_ms + at.elapsed().as_secs_f64() * 1000.0,
            None => self.base_ms,
        }
    }
}

impl PlaybackClock {
    pub fn new(audio_driven: bool) -> Self {
        Self {
            audio_driven,
            position_bits: AtomicU64::new(UNSET),
            wall: Mutex::new(WallTimer::default()),
        }
    }

    pub fn is_audio_driven(&self) -> bool {
        self.audio_driven
    }

    /// Current position, or `None` before the first audio buffer reached the sink.
    pub fn read(&self) -> Option<f64> {
        if self.is_audio_driven() {
            let bits = self.position_bits.load(Ordering::Acquire);
            (bits != UNSET).then(|| f64::from_bits(bits))
        } else {
            Some(self.wall.lock().unwrap().now_ms())
        }
    }

    /// Publish the position of the buffer just queued to the audio sink.
    pub fn write(&self, ms: f64) {
        self.position_bits.store(ms.to_bits(), Ordering::Release);
    }

    /// Jump to `ms` after a seek. Keeps the wall timer's running state.
    pub fn rebase(&self, ms: f64) {
        if self.is_audio_driven() {
            self.write(ms);
        } else {
            let mut wall = self.wall.lock().unwrap();
            wall.base_ms = ms;
            if wall.started.is_some() {
                wall.started = Some(Instant::now());
            }
        }
    }

    /// Start the wall timer. No-op for an audio clock or a running timer.
    pub fn start(&self) {
        if self.is_audio_driven() {
            return;
        }
        let mut wall = self.wall.lock().unwrap();
        if wall.started.is_none() {
            wall.started = Some(Instant::now());
        }
    }

    /// Freeze the wall timer at its current position.
    pub fn pause(&self) {
        if self.is_audio_driven() {
            return;
        }
        let mut wall = self.wall.lock().unwrap();
        wall.base_ms = wall.now_ms();
        wall.started = None;
    }

    /// Whether the clock is past the warm-up threshold and can pace video.
    pub fn is_warm(&self, warmup_ms: f64) -> bool {
        self.read().is_some_and(|ms| ms >= warmup_ms)
    }

    pub fn reset(&self) {
        self.position_bits.store(UNSET, Ordering::Release);
        *self.wall.lock().unwrap() = WallTimer::default();
    }
}
