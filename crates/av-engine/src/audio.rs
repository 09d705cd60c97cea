//! Audio decode pipeline and sink writer.
//!
//! Owns the audio decoder and converter. For every routed packet: decode, convert to the
//! sink format, wait for room in the sink, write, then publish the buffer's pts as the
//! master clock.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::backend::AudioDecoder;
use crate::error::OpenError;
use crate::media::{DecodedAudioBuffer, RawAudioFrame, TimeBase};
use crate::output::EngineEvent;
use crate::resample::AudioConverter;
use crate::router::{Routed, RoutedItem};
use crate::transport::Shared;

const SINK_POLL: Duration = Duration::from_millis(10);

/// Stream parameters fixed at open.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AudioParams {
    pub(crate) source_rate: u32,
    pub(crate) channels: u16,
    pub(crate) output_rate: u32,
    pub(crate) time_base: TimeBase,
}

pub(crate) struct AudioWorker {
    shared: Arc<Shared>,
    decoder: Box<dyn AudioDecoder>,
    converter: AudioConverter,
    time_base: TimeBase,
    generation: u64,
    floor_ms: Option<f64>,
    next_pts_ms: f64,
    last_second: Option<u64>,
    max_write_frames: usize,
}

impl AudioWorker {
    /// Build the converter on this thread, report the outcome on `ready`, then run.
    pub(crate) fn start(
        shared: Arc<Shared>,
        decoder: Box<dyn AudioDecoder>,
        params: AudioParams,
        ready: Sender<Result<(), OpenError>>,
    ) {
        match Self::new(shared, decoder, params) {
            Ok(mut worker) => {
                let _ = ready.send(Ok(()));
                worker.run();
            }
            Err(err) => {
                let _ = ready.send(Err(err));
            }
        }
    }

    fn new(
        shared: Arc<Shared>,
        decoder: Box<dyn AudioDecoder>,
        params: AudioParams,
    ) -> Result<Self, OpenError> {
        let converter = AudioConverter::new(
            params.source_rate,
            params.channels,
            params.output_rate,
            shared.config.resample_chunk_frames,
        )?;
        let max_write_frames =
            (params.output_rate as u64 * shared.config.sink_buffer_ms as u64 / 2000).max(1) as usize;
        let generation = shared.control.generation();
        Ok(Self {
            shared,
            decoder,
            converter,
            time_base: params.time_base,
            generation,
            floor_ms: None,
            next_pts_ms: 0.0,
            last_second: None,
            max_write_frames,
        })
    }

    fn run(&mut self) {
        let shared = Arc::clone(&self.shared);
        while let Some(routed) = shared.audio_q.pop(|| shared.control.is_shutdown()) {
            self.handle(routed);
            shared.audio_q.complete();
        }
        tracing::debug!("audio worker exiting");
    }

    fn handle(&mut self, routed: Routed) {
        if !self.shared.control.is_current(routed.generation) {
            return;
        }
        if routed.generation != self.generation {
            self.restart(routed.generation);
        }
        match routed.item {
            RoutedItem::Packet(packet) => {
                if let Err(err) = self.decoder.send_packet(&packet) {
                    tracing::warn!(pts = packet.pts, "audio packet failed to decode, skipping: {err:#}");
                    return;
                }
                self.drain();
            }
            RoutedItem::EndOfStream => {
                if let Err(err) = self.decoder.send_eof() {
                    tracing::warn!("audio decoder drain failed: {err:#}");
                }
                self.drain();
                match self.converter.flush() {
                    Ok(Some(buffer)) => self.deliver(buffer),
                    Ok(None) => {}
                    Err(err) => tracing::warn!("resampler flush failed: {err:#}"),
                }
                tracing::debug!(clock_ms = self.shared.clock.read(), "audio drained");
            }
        }
    }

    /// New generation: drop decoder and resampler state from before the seek.
    fn restart(&mut self, generation: u64) {
        self.decoder.flush();
        self.converter.reset();
        self.generation = generation;
        self.floor_ms = self.shared.control.seek_floor_ms();
        self.next_pts_ms = self.floor_ms.unwrap_or(0.0).max(0.0);
        self.last_second = None;
        tracing::debug!(generation, floor_ms = self.floor_ms, "audio pipeline flushed");
    }

    fn drain(&mut self) {
        loop {
            let frame = match self.decoder.receive_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("audio decode failed, skipping frame: {err:#}");
                    break;
                }
            };
            self.convert(&frame);
            if !self.shared.control.is_current(self.generation) {
                break;
            }
        }
    }

    fn convert(&mut self, frame: &RawAudioFrame) {
        let pts_ms = frame
            .pts
            .map_or(self.next_pts_ms, |pts| self.time_base.to_ms(pts));
        if frame.sample_rate > 0 {
            self.next_pts_ms = pts_ms + frame.samples as f64 * 1000.0 / frame.sample_rate as f64;
        }
        match self.converter.convert(frame, pts_ms) {
            Ok(Some(buffer)) => self.deliver(buffer),
            Ok(None) => {}
            Err(err) => tracing::warn!(pts_ms, "audio frame conversion failed, skipping: {err:#}"),
        }
    }

    fn deliver(&mut self, buffer: DecodedAudioBuffer) {
        if let Some(floor) = self.floor_ms {
            if buffer.pts_ms < floor {
                tracing::trace!(pts_ms = buffer.pts_ms, floor, "dropping audio before seek target");
                return;
            }
        }
        let mut next = Some(buffer);
        while let Some(mut piece) = next.take() {
            next = piece.split_off_frames(self.max_write_frames);
            if !self.write(piece) {
                return;
            }
        }
    }

    /// Wait for sink room, write, advance the clock. Returns `false` once the generation is stale.
    fn write(&mut self, buffer: DecodedAudioBuffer) -> bool {
        let needed = buffer.byte_len();
        let control = &self.shared.control;
        let poll = SINK_POLL.min(self.shared.config.poll_interval);
        loop {
            if !control.is_current(self.generation) {
                return false;
            }
            let free = self.shared.audio_out.lock().unwrap().bytes_free();
            if free >= needed {
                break;
            }
            control.sleep(poll);
        }

        let pts_ms = buffer.pts_ms;
        let shared = &self.shared;
        let written = control.guarded(self.generation, |_| {
            let res = shared.audio_out.lock().unwrap().write(buffer);
            if res.is_ok() {
                shared.clock.write(pts_ms);
            }
            res
        });
        match written {
            None => false,
            Some(Err(err)) => {
                tracing::warn!(pts_ms, "audio sink write failed: {err:#}");
                true
            }
            Some(Ok(())) => {
                self.progress(pts_ms);
                true
            }
        }
    }

    fn progress(&mut self, pts_ms: f64) {
        let second = (pts_ms.max(0.0) / 1000.0) as u64;
        if self.last_second != Some(second) {
            self.last_second = Some(second);
            self.shared
                .control
                .emit(EngineEvent::Progress { seconds: second });
        }
    }
}
