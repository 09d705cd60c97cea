//! Video presentation against the master clock.
//!
//! `delay = frame.pts - clock`. A frame ahead of a warm clock waits for the delay (capped per
//! frame); a late frame is shown immediately. Frames are never dropped for being late.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::media::DecodedVideoFrame;
use crate::output::EngineEvent;
use crate::transport::{PlaybackState, Shared};

pub(crate) struct Presenter {
    shared: Arc<Shared>,
    /// Emit progress ticks from video pts (media without audio).
    report_progress: bool,
    last_second: Option<u64>,
}

impl Presenter {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let report_progress = !shared.has_audio;
        Self {
            shared,
            report_progress,
            last_second: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.last_second = None;
    }

    /// Milliseconds until `pts_ms` is due, or `None` when the clock cannot pace yet.
    fn delay_ms(&self, pts_ms: f64) -> Option<f64> {
        let clock = &self.shared.clock;
        if clock.is_audio_driven() && !clock.is_warm(self.shared.config.clock_warmup_ms) {
            return None;
        }
        Some(pts_ms - clock.read()?)
    }

    /// Wait until `frame` is due, then render it.
    ///
    /// Pause holds the frame; a seek, stop or close discards it. Returns whether it was rendered.
    pub(crate) fn present(&mut self, frame: DecodedVideoFrame, generation: u64) -> bool {
        let config = &self.shared.config;
        let control = &self.shared.control;
        let cap = Duration::from_millis(config.max_present_delay_ms);
        let mut waited = Duration::ZERO;
        let mut frame = frame;

        loop {
            if !control.wait_unpaused(generation) {
                tracing::trace!(pts_ms = frame.pts_ms, "frame discarded by transport");
                return false;
            }
            if let Some(delay) = self.delay_ms(frame.pts_ms) {
                if delay > 0.0 && waited < cap {
                    let step = Duration::from_secs_f64(delay / 1000.0)
                        .min(config.poll_interval)
                        .min(cap - waited);
                    let started = Instant::now();
                    control.sleep(step);
                    waited += started.elapsed();
                    continue;
                }
            }

            let pts_ms = frame.pts_ms;
            let video_out = &self.shared.video_out;
            let outcome = control.guarded(generation, |state| {
                if state == PlaybackState::Paused {
                    return Some(frame);
                }
                video_out.lock().unwrap().render(frame);
                None
            });
            match outcome {
                None => return false,
                Some(Some(held)) => frame = held,
                Some(None) => {
                    if waited >= cap {
                        tracing::debug!(pts_ms, "presentation delay capped");
                    }
                    self.progress(pts_ms);
                    return true;
                }
            }
        }
    }

    fn progress(&mut self, pts_ms: f64) {
        if !self.report_progress {
            return;
        }
        let second = (pts_ms.max(0.0) / 1000.0) as u64;
        if self.last_second != Some(second) {
            self.last_second = Some(second);
            self.shared
                .control
                .emit(EngineEvent::Progress { seconds: second });
        }
    }
}
