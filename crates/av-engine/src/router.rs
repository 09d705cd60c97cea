//! Packet router: the only reader of the container.
//!
//! Runs while the transport is `Playing`. Each packet goes to the audio or video queue of its
//! stream; a push blocks until that pipeline has consumed its previous packet (queue depth 1
//! by default), which bounds A/V skew to one packet per stream.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::backend::Demuxer;
use crate::catalog::MediaInfo;
use crate::media::{MediaKind, Packet, TimeBase};
use crate::queue::PacketQueue;
use crate::transport::{RouterStep, SeekRequest, Shared};

/// Unit handed from the router to a pipeline.
pub(crate) struct Routed {
    /// Transport generation the packet was read under.
    pub(crate) generation: u64,
    pub(crate) item: RoutedItem,
}

pub(crate) enum RoutedItem {
    Packet(Packet),
    /// No more packets: drain the decoder.
    EndOfStream,
}

pub(crate) struct Router {
    shared: Arc<Shared>,
    demuxer: Box<dyn Demuxer>,
    audio_index: Option<usize>,
    video_index: Option<usize>,
    seek_stream: Option<(usize, TimeBase)>,
    /// Read but not yet accepted by a pipeline (push interrupted by pause).
    pending: VecDeque<(MediaKind, Routed)>,
    at_eos: bool,
    routed: u64,
}

impl Router {
    pub(crate) fn new(shared: Arc<Shared>, demuxer: Box<dyn Demuxer>, info: &MediaInfo) -> Self {
        Self {
            shared,
            demuxer,
            audio_index: info.audio.as_ref().map(|s| s.index),
            video_index: info.video.as_ref().map(|s| s.index),
            seek_stream: info.default_stream().map(|s| (s.index, s.time_base)),
            pending: VecDeque::new(),
            at_eos: false,
            routed: 0,
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            match self.shared.control.next_router_step() {
                RouterStep::Shutdown => break,
                RouterStep::Seek(req) => self.seek(&req),
                RouterStep::Read { generation } => self.step(generation),
            }
        }
        tracing::debug!(routed = self.routed, "router exiting");
    }

    fn step(&mut self, generation: u64) {
        if self.pending.is_empty() && !self.at_eos {
            self.read_next(generation);
        }
        if !self.flush_pending(generation) {
            return;
        }
        if self.at_eos {
            self.finish(generation);
        }
    }

    fn read_next(&mut self, generation: u64) {
        match self.demuxer.read_packet() {
            Ok(Some(packet)) => {
                let kind = if Some(packet.stream_index) == self.audio_index {
                    MediaKind::Audio
                } else if Some(packet.stream_index) == self.video_index {
                    MediaKind::Video
                } else {
                    tracing::trace!(stream = packet.stream_index, "skipping unselected stream");
                    return;
                };
                tracing::trace!(%kind, pts = packet.pts, "routing packet");
                self.pending.push_back((
                    kind,
                    Routed {
                        generation,
                        item: RoutedItem::Packet(packet),
                    },
                ));
            }
            Ok(None) => self.begin_eos(generation),
            Err(err) => {
                tracing::warn!("container read failed, treating as end of stream: {err:#}");
                self.begin_eos(generation);
            }
        }
    }

    fn begin_eos(&mut self, generation: u64) {
        tracing::debug!(routed = self.routed, "end of stream");
        self.at_eos = true;
        let kinds = [
            self.audio_index.map(|_| MediaKind::Audio),
            self.video_index.map(|_| MediaKind::Video),
        ];
        for kind in kinds.into_iter().flatten() {
            self.pending.push_back((
                kind,
                Routed {
                    generation,
                    item: RoutedItem::EndOfStream,
                },
            ));
        }
    }

    fn queue(&self, kind: MediaKind) -> &PacketQueue<Routed> {
        match kind {
            MediaKind::Audio => &self.shared.audio_q,
            MediaKind::Video => &self.shared.video_q,
        }
    }

    /// Push everything pending. Returns `false` when interrupted by a command.
    fn flush_pending(&mut self, generation: u64) -> bool {
        while let Some((kind, routed)) = self.pending.pop_front() {
            let control = &self.shared.control;
            match self.queue(kind).push(routed, || !control.is_running(generation)) {
                Ok(()) => self.routed += 1,
                Err(routed) => {
                    // Paused: keep the packet for resume. Seek/stop: it is stale.
                    if control.is_current(generation) {
                        self.pending.push_front((kind, routed));
                    }
                    return false;
                }
            }
        }
        true
    }

    fn finish(&mut self, generation: u64) {
        let control = &self.shared.control;
        let abort = || !control.is_running(generation);
        if !self.shared.audio_q.wait_idle(abort) || !self.shared.video_q.wait_idle(abort) {
            return;
        }
        if control.finish_playback(generation) {
            self.shared.clock.pause();
            tracing::info!(routed = self.routed, "playback finished");
        }
    }

    fn seek(&mut self, req: &SeekRequest) {
        let dropped =
            self.shared.audio_q.clear() + self.shared.video_q.clear() + self.pending.len();
        self.pending.clear();
        self.at_eos = false;

        if let Some((index, time_base)) = self.seek_stream {
            let ts = time_base.from_ms(req.target_ms);
            if let Err(err) = self.demuxer.seek(index, ts) {
                tracing::warn!(target_ms = req.target_ms, "container seek failed: {err:#}");
            }
        }
        tracing::debug!(target_ms = req.target_ms, dropped, "router repositioned");
        self.shared.control.finish_seek(req);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use crossbeam_channel::Receiver;

    use crate::backend::synthetic::{SyntheticBackend, SyntheticMedia};
    use crate::catalog;
    use crate::config::EngineConfig;
    use crate::output::EngineEvent;
    use crate::testutil::recording_outputs;
    use crate::transport::PlaybackState;

    fn setup(media: SyntheticMedia) -> (Arc<Shared>, Router, Receiver<EngineEvent>) {
        let opened = catalog::open(
            &SyntheticBackend::new(media),
            Path::new("clip.synthetic"),
            &EngineConfig::default(),
        )
        .unwrap();
        let (audio, video, _log) = recording_outputs(100);
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared::new(
            EngineConfig::default(),
            audio,
            video,
            tx,
            opened.info.audio.is_some(),
            opened.info.duration_ms,
        ));
        let router = Router::new(shared.clone(), opened.demuxer, &opened.info);
        (shared, router, rx)
    }

    fn take(shared: &Shared, kind: MediaKind) -> Routed {
        let q = match kind {
            MediaKind::Audio => &shared.audio_q,
            MediaKind::Video => &shared.video_q,
        };
        let routed = q.pop(|| false).unwrap();
        q.complete();
        routed
    }

    fn pts(routed: &Routed) -> Option<i64> {
        match &routed.item {
            RoutedItem::Packet(p) => p.pts,
            RoutedItem::EndOfStream => None,
        }
    }

    #[test]
    fn packets_are_routed_by_stream_in_read_order() {
        let (shared, mut router, _rx) = setup(SyntheticMedia::default());
        shared.play();
        let generation = shared.control.generation();

        // Audio 0 and video 0 start together; audio is read first.
        router.step(generation);
        assert_eq!(pts(&take(&shared, MediaKind::Audio)), Some(0));
        router.step(generation);
        assert_eq!(pts(&take(&shared, MediaKind::Video)), Some(0));
        router.step(generation);
        assert_eq!(pts(&take(&shared, MediaKind::Audio)), Some(960));
    }

    #[test]
    fn pause_keeps_the_blocked_packet() {
        let (shared, mut router, _rx) = setup(SyntheticMedia::audio_only(1_000));
        shared.play();
        let generation = shared.control.generation();
        router.step(generation);
        // Slot occupied and never completed: the next push blocks until paused.
        let first = shared.audio_q.pop(|| false).unwrap();
        let pauser = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                shared.pause();
            })
        };
        router.step(generation);
        pauser.join().unwrap();
        assert_eq!(router.pending.len(), 1);
        assert_eq!(pts(&first), Some(0));
        shared.audio_q.complete();

        shared.play();
        router.step(generation);
        assert!(router.pending.is_empty());
        assert_eq!(pts(&take(&shared, MediaKind::Audio)), Some(960));
    }

    #[test]
    fn seek_clears_queues_and_repositions() {
        let (shared, mut router, rx) = setup(SyntheticMedia::default());
        shared.play();
        let generation = shared.control.generation();
        router.step(generation);
        assert_eq!(shared.audio_q.len(), 1);

        shared.seek(5_000);
        let RouterStep::Seek(req) = shared.control.next_router_step() else {
            panic!("expected a seek step");
        };
        router.seek(&req);
        assert!(shared.audio_q.is_empty());
        assert_eq!(shared.control.state(), PlaybackState::Playing);

        let generation = shared.control.generation();
        router.step(generation);
        let routed = take(&shared, MediaKind::Audio);
        assert_eq!(routed.generation, generation);
        assert_eq!(pts(&routed), Some(5_000 * 48));

        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.contains(&EngineEvent::StateChanged(PlaybackState::SeekPending)));
    }

    #[test]
    fn end_of_stream_sends_markers_and_finishes_once() {
        let (shared, mut router, rx) = setup(SyntheticMedia::audio_only(40));
        shared.play();
        let generation = shared.control.generation();
        for _ in 0..2 {
            router.step(generation);
            assert!(pts(&take(&shared, MediaKind::Audio)).is_some());
        }
        let consumer = {
            let shared = shared.clone();
            std::thread::spawn(move || take(&shared, MediaKind::Audio))
        };
        router.step(generation);
        let eos = consumer.join().unwrap();
        assert!(matches!(eos.item, RoutedItem::EndOfStream));

        assert_eq!(shared.control.state(), PlaybackState::Ended);
        let events: Vec<_> = rx.try_iter().collect();
        let finished = events
            .iter()
            .filter(|e| **e == EngineEvent::PlaybackFinished)
            .count();
        assert_eq!(finished, 1);
        assert!(!shared.control.finish_playback(generation));
    }
}
