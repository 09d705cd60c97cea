//! Transport state machine and session ownership.
//!
//! [`TransportController`] is the only writer of [`PlaybackState`]. Each `open` spawns three
//! workers sharing one [`Shared`] block:
//! - router: the only container reader ([`crate::router`])
//! - audio: decode, resample, write to the sink, advance the clock ([`crate::audio`])
//! - video: decode, normalize, pace against the clock, render ([`crate::video`])
//!
//! Seek, stop and close bump a generation counter. Every routed packet carries the generation
//! it was read under and every blocking wait re-checks it, so work that a command made stale
//! is dropped instead of presented.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::audio::{AudioParams, AudioWorker};
use crate::backend::MediaBackend;
use crate::catalog::{self, MediaInfo, OpenedMedia};
use crate::clock::PlaybackClock;
use crate::config::EngineConfig;
use crate::error::{OpenError, TransportError};
use crate::hwaccel::{self, HwSelection};
use crate::media::{MediaKind, PixelLayout};
use crate::output::{EngineEvent, SharedAudioOutput, SharedVideoOutput};
use crate::queue::PacketQueue;
use crate::router::{Routed, Router};
use crate::status::{PlaybackStatus, SessionFacts};
use crate::video::VideoWorker;

/// Transport state. Exactly one per open media.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    /// A seek was issued and the router has not repositioned the container yet.
    SeekPending,
    Stopped,
    Ended,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::SeekPending => "seeking",
            PlaybackState::Stopped => "stopped",
            PlaybackState::Ended => "ended",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SeekRequest {
    pub(crate) target_ms: f64,
    pub(crate) generation: u64,
}

/// What the router should do next.
pub(crate) enum RouterStep {
    Shutdown,
    Seek(SeekRequest),
    Read { generation: u64 },
}

struct ControlState {
    state: PlaybackState,
    generation: u64,
    seek: Option<SeekRequest>,
    resume_after_seek: PlaybackState,
    seek_floor_ms: Option<f64>,
    shutdown: bool,
    finished_emitted: bool,
}

/// Transport state shared read-only with the workers.
///
/// Waiters block on the condition variable with a bounded timeout so a missed notification
/// costs at most one poll interval.
pub(crate) struct Control {
    inner: Mutex<ControlState>,
    cv: Condvar,
    poll: Duration,
    events: Sender<EngineEvent>,
}

impl Control {
    fn new(poll: Duration, events: Sender<EngineEvent>) -> Self {
        Self {
            inner: Mutex::new(ControlState {
                state: PlaybackState::Idle,
                generation: 0,
                seek: None,
                resume_after_seek: PlaybackState::Paused,
                seek_floor_ms: None,
                shutdown: false,
                finished_emitted: false,
            }),
            cv: Condvar::new(),
            poll,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.lock().unwrap()
    }

    fn enter(&self, g: &mut ControlState, next: PlaybackState) {
        if g.state == next {
            return;
        }
        tracing::debug!(from = %g.state, to = %next, "transport state");
        g.state = next;
        self.emit(EngineEvent::StateChanged(next));
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn notify(&self) {
        self.cv.notify_all();
    }

    pub(crate) fn state(&self) -> PlaybackState {
        self.lock().state
    }

    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Whether work tagged with `generation` is still wanted.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        let g = self.lock();
        !g.shutdown && g.generation == generation
    }

    /// Whether the router may keep reading under `generation`.
    pub(crate) fn is_running(&self, generation: u64) -> bool {
        let g = self.lock();
        !g.shutdown && g.generation == generation && g.state == PlaybackState::Playing
    }

    /// Lowest pts still presented after the last seek.
    pub(crate) fn seek_floor_ms(&self) -> Option<f64> {
        self.lock().seek_floor_ms
    }

    /// Run `f` under the control lock if `generation` is still current.
    ///
    /// No command can invalidate the generation while `f` runs, so a sink write or render done
    /// here can never land after the seek or stop that made it stale.
    pub(crate) fn guarded<R>(
        &self,
        generation: u64,
        f: impl FnOnce(PlaybackState) -> R,
    ) -> Option<R> {
        let g = self.lock();
        if g.shutdown || g.generation != generation {
            return None;
        }
        Some(f(g.state))
    }

    /// Sleep up to `timeout`, returning early when a command arrives.
    pub(crate) fn sleep(&self, timeout: Duration) {
        let g = self.lock();
        if g.shutdown {
            return;
        }
        let _ = self.cv.wait_timeout(g, timeout).unwrap();
    }

    /// Block while the transport is paused. Returns `false` once `generation` is stale.
    pub(crate) fn wait_unpaused(&self, generation: u64) -> bool {
        let mut g = self.lock();
        loop {
            if g.shutdown || g.generation != generation {
                return false;
            }
            if g.state != PlaybackState::Paused {
                return true;
            }
            g = self.cv.wait_timeout(g, self.poll).unwrap().0;
        }
    }

    pub(crate) fn next_router_step(&self) -> RouterStep {
        let mut g = self.lock();
        loop {
            if g.shutdown {
                return RouterStep::Shutdown;
            }
            if let Some(req) = g.seek.take() {
                return RouterStep::Seek(req);
            }
            if g.state == PlaybackState::Playing {
                return RouterStep::Read {
                    generation: g.generation,
                };
            }
            g = self.cv.wait_timeout(g, self.poll).unwrap().0;
        }
    }

    /// Leave `SeekPending` once the container is repositioned.
    pub(crate) fn finish_seek(&self, req: &SeekRequest) {
        let mut g = self.lock();
        if g.shutdown || g.generation != req.generation || g.state != PlaybackState::SeekPending {
            return;
        }
        let resume = g.resume_after_seek;
        self.enter(&mut g, resume);
        drop(g);
        self.notify();
    }

    /// Natural end of media. Returns `true` for the one call that emitted `PlaybackFinished`.
    pub(crate) fn finish_playback(&self, generation: u64) -> bool {
        let mut g = self.lock();
        if g.shutdown
            || g.generation != generation
            || g.state != PlaybackState::Playing
            || g.finished_emitted
        {
            return false;
        }
        g.finished_emitted = true;
        self.enter(&mut g, PlaybackState::Ended);
        self.emit(EngineEvent::PlaybackFinished);
        drop(g);
        self.notify();
        true
    }

    fn begin_seek(&self, g: &mut ControlState, target_ms: f64, resume: PlaybackState, tolerance_ms: f64) {
        g.generation += 1;
        g.seek = Some(SeekRequest {
            target_ms,
            generation: g.generation,
        });
        g.resume_after_seek = resume;
        g.seek_floor_ms = Some(target_ms - tolerance_ms);
        g.finished_emitted = false;
        self.enter(g, PlaybackState::SeekPending);
    }
}

/// Side effects of a command on the clock and the audio sink, applied outside the control lock.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Effect {
    None,
    Resume,
    Pause,
    Seek { resume: PlaybackState },
    Stop,
}

/// State shared by the controller and the workers of one open media.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) control: Control,
    pub(crate) clock: Arc<PlaybackClock>,
    pub(crate) audio_q: PacketQueue<Routed>,
    pub(crate) video_q: PacketQueue<Routed>,
    pub(crate) audio_out: SharedAudioOutput,
    pub(crate) video_out: SharedVideoOutput,
    pub(crate) has_audio: bool,
    duration_ms: Option<u64>,
}

impl Shared {
    pub(crate) fn new(
        config: EngineConfig,
        audio_out: SharedAudioOutput,
        video_out: SharedVideoOutput,
        events: Sender<EngineEvent>,
        has_audio: bool,
        duration_ms: Option<u64>,
    ) -> Self {
        let depth = config.packet_queue_depth;
        let poll = config.poll_interval;
        Self {
            control: Control::new(poll, events),
            clock: Arc::new(PlaybackClock::new(has_audio)),
            audio_q: PacketQueue::new(depth, poll),
            video_q: PacketQueue::new(depth, poll),
            audio_out,
            video_out,
            has_audio,
            duration_ms,
            config,
        }
    }

    fn wake(&self) {
        self.control.notify();
        self.audio_q.wake();
        self.video_q.wake();
    }

    pub(crate) fn play(&self) {
        let mut g = self.control.lock();
        let effect = match g.state {
            PlaybackState::Idle | PlaybackState::Paused => {
                self.control.enter(&mut g, PlaybackState::Playing);
                Effect::Resume
            }
            PlaybackState::SeekPending => {
                g.resume_after_seek = PlaybackState::Playing;
                Effect::Resume
            }
            PlaybackState::Stopped | PlaybackState::Ended => {
                tracing::info!("restarting from the beginning");
                self.control.begin_seek(
                    &mut g,
                    0.0,
                    PlaybackState::Playing,
                    self.config.seek_tolerance_ms,
                );
                self.clock.rebase(0.0);
                Effect::Seek {
                    resume: PlaybackState::Playing,
                }
            }
            PlaybackState::Playing => Effect::None,
        };
        drop(g);
        self.apply(effect);
    }

    pub(crate) fn pause(&self) {
        let mut g = self.control.lock();
        let effect = match g.state {
            PlaybackState::Playing => {
                self.control.enter(&mut g, PlaybackState::Paused);
                Effect::Pause
            }
            PlaybackState::SeekPending => {
                g.resume_after_seek = PlaybackState::Paused;
                Effect::Pause
            }
            _ => Effect::None,
        };
        drop(g);
        self.apply(effect);
    }

    pub(crate) fn seek(&self, target_ms: u64) {
        let target_ms = match self.duration_ms {
            Some(d) => target_ms.min(d),
            None => target_ms,
        } as f64;
        let mut g = self.control.lock();
        let resume = match g.state {
            PlaybackState::Idle | PlaybackState::Paused => PlaybackState::Paused,
            PlaybackState::Playing | PlaybackState::Stopped | PlaybackState::Ended => {
                PlaybackState::Playing
            }
            PlaybackState::SeekPending => g.resume_after_seek,
        };
        self.control
            .begin_seek(&mut g, target_ms, resume, self.config.seek_tolerance_ms);
        self.clock.rebase(target_ms);
        drop(g);
        tracing::info!(target_ms, resume = %resume, "seek");
        self.apply(Effect::Seek { resume });
    }

    pub(crate) fn stop(&self) {
        let mut g = self.control.lock();
        if g.state == PlaybackState::Ended {
            return;
        }
        g.generation += 1;
        g.seek = None;
        self.control.enter(&mut g, PlaybackState::Ended);
        drop(g);
        tracing::info!("playback stopped");
        self.apply(Effect::Stop);
    }

    /// Stop every worker for good. Used by `close`.
    pub(crate) fn shutdown(&self) {
        let mut g = self.control.lock();
        g.shutdown = true;
        g.generation += 1;
        g.seek = None;
        self.control.enter(&mut g, PlaybackState::Stopped);
        drop(g);
        self.audio_q.close();
        self.video_q.close();
        self.wake();
    }

    fn apply(&self, effect: Effect) {
        match effect {
            Effect::None => return,
            Effect::Resume => {
                self.clock.start();
                self.audio_out.lock().unwrap().set_paused(false);
            }
            Effect::Pause => {
                self.clock.pause();
                self.audio_out.lock().unwrap().set_paused(true);
            }
            Effect::Seek { resume } => {
                {
                    let mut out = self.audio_out.lock().unwrap();
                    out.reset();
                    out.set_paused(resume != PlaybackState::Playing);
                }
                if resume == PlaybackState::Playing {
                    self.clock.start();
                } else {
                    self.clock.pause();
                }
            }
            Effect::Stop => {
                self.clock.pause();
                self.audio_out.lock().unwrap().reset();
            }
        }
        self.wake();
    }
}

struct Session {
    shared: Arc<Shared>,
    info: MediaInfo,
    facts: SessionFacts,
    workers: Vec<JoinHandle<()>>,
    _hw: HwSelection,
}

/// Play/pause/seek/stop over one open media at a time.
///
/// Events (duration, progress, state changes, end of media) are delivered on the receiver
/// returned by [`TransportController::new`].
pub struct TransportController {
    backend: Arc<dyn MediaBackend>,
    config: EngineConfig,
    audio_out: SharedAudioOutput,
    video_out: SharedVideoOutput,
    events: Sender<EngineEvent>,
    session: Option<Session>,
}

impl TransportController {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        config: EngineConfig,
        audio_out: SharedAudioOutput,
        video_out: SharedVideoOutput,
    ) -> (Self, Receiver<EngineEvent>) {
        let (events, rx) = crossbeam_channel::unbounded();
        let controller = Self {
            backend,
            config,
            audio_out,
            video_out,
            events,
            session: None,
        };
        (controller, rx)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open `path`, replacing whatever was open. The transport starts in `Idle`.
    ///
    /// Output init callbacks fire here, once each, before any unit is delivered.
    pub fn open(&mut self, path: &Path) -> Result<&MediaInfo, OpenError> {
        self.close();

        let OpenedMedia {
            info,
            demuxer,
            audio_decoder,
            video_decoder,
            hw,
        } = catalog::open(self.backend.as_ref(), path, &self.config)?;

        let mut facts = SessionFacts::default();

        let audio = match (&info.audio, audio_decoder) {
            (Some(stream), Some(decoder)) => {
                let source_rate = stream
                    .sample_rate
                    .filter(|r| *r > 0)
                    .ok_or_else(|| OpenError::AudioInit("stream reports no sample rate".into()))?;
                let channels = stream
                    .channels
                    .filter(|c| *c > 0)
                    .ok_or_else(|| OpenError::AudioInit("stream reports no channels".into()))?;
                let mut out = self.audio_out.lock().unwrap();
                let output_rate = self
                    .config
                    .output_sample_rate
                    .unwrap_or_else(|| out.negotiate_rate(source_rate));
                out.init(output_rate, channels)
                    .map_err(|e| OpenError::AudioOutput(format!("{e:#}")))?;
                drop(out);
                facts.audio_codec = decoder
                    .codec_name()
                    .or_else(|| Some(stream.codec.to_string()));
                facts.output_sample_rate = Some(output_rate);
                let params = AudioParams {
                    source_rate,
                    channels,
                    output_rate,
                    time_base: stream.time_base,
                };
                Some((decoder, params))
            }
            _ => None,
        };

        let video = match (&info.video, video_decoder) {
            (Some(stream), Some(decoder)) => {
                let layout = if decoder.hw_active() {
                    PixelLayout::TwoPlane
                } else {
                    PixelLayout::ThreePlane
                };
                self.video_out
                    .lock()
                    .unwrap()
                    .init(layout)
                    .map_err(|e| OpenError::VideoOutput(format!("{e:#}")))?;
                facts.video_codec = decoder
                    .codec_name()
                    .or_else(|| Some(stream.codec.to_string()));
                facts.video_backend = Some(hw.backend_name().to_string());
                Some((decoder, layout, stream.time_base))
            }
            _ => None,
        };

        let shared = Arc::new(Shared::new(
            self.config.clone(),
            Arc::clone(&self.audio_out),
            Arc::clone(&self.video_out),
            self.events.clone(),
            audio.is_some(),
            info.duration_ms,
        ));

        let mut workers = Vec::new();
        if let Err(err) = start_workers(&shared, &info, demuxer, audio, video, &mut workers) {
            shared.shutdown();
            for handle in workers {
                let _ = handle.join();
            }
            self.audio_out.lock().unwrap().reset();
            return Err(err);
        }

        if let Some(ms) = info.duration_ms {
            shared.control.emit(EngineEvent::DurationKnown(ms));
        }
        if let Some(backend) = &facts.video_backend {
            shared.control.emit(EngineEvent::HwAccel {
                backend: backend.clone(),
            });
        }

        let session = self.session.insert(Session {
            shared,
            info,
            facts,
            workers,
            _hw: hw,
        });
        Ok(&session.info)
    }

    fn shared(&self) -> Result<&Shared, TransportError> {
        self.session
            .as_ref()
            .map(|s| s.shared.as_ref())
            .ok_or(TransportError::NotOpen)
    }

    /// Start or resume. From `Stopped`/`Ended` playback restarts at 0.
    pub fn play(&self) -> Result<(), TransportError> {
        self.shared()?.play();
        Ok(())
    }

    pub fn pause(&self) -> Result<(), TransportError> {
        self.shared()?.pause();
        Ok(())
    }

    /// Jump to `target_ms` (clamped to the duration when known).
    ///
    /// Lands in `Paused` from `Idle`/`Paused`, otherwise in `Playing`.
    pub fn seek(&self, target_ms: u64) -> Result<(), TransportError> {
        self.shared()?.seek(target_ms);
        Ok(())
    }

    /// Force `Ended` immediately. Does not emit `PlaybackFinished`.
    pub fn stop(&self) -> Result<(), TransportError> {
        self.shared()?.stop();
        Ok(())
    }

    /// Tear down the open media and return to `Idle`. No-op when nothing is open.
    pub fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.shared.shutdown();
        for handle in session.workers {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::error!(worker = %name, "worker panicked");
            }
        }
        self.audio_out.lock().unwrap().reset();
        session.shared.clock.reset();
        let mut g = session.shared.control.lock();
        session.shared.control.enter(&mut g, PlaybackState::Idle);
        drop(g);
        tracing::info!(path = %session.info.path.display(), "media closed");
    }

    pub fn state(&self) -> PlaybackState {
        self.session
            .as_ref()
            .map_or(PlaybackState::Idle, |s| s.shared.control.state())
    }

    pub fn media(&self) -> Option<&MediaInfo> {
        self.session.as_ref().map(|s| &s.info)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.media().and_then(|m| m.duration_ms)
    }

    /// Container-reported frame count, `-1` when unknown or nothing is open.
    pub fn frame_count(&self, kind: MediaKind) -> i64 {
        self.media().map_or(-1, |m| m.frame_count(kind))
    }

    /// Current clock position. `None` when nothing is open or no audio reached the sink yet.
    pub fn position_ms(&self) -> Option<f64> {
        self.session.as_ref().and_then(|s| s.shared.clock.read())
    }

    pub fn status(&self) -> PlaybackStatus {
        match &self.session {
            Some(s) => PlaybackStatus::snapshot(
                s.shared.control.state(),
                s.shared.clock.read(),
                &s.info,
                &s.facts,
            ),
            None => PlaybackStatus::idle(),
        }
    }

    /// Hardware decoders whose device context can be created on this machine.
    pub fn available_hw_devices(&self) -> Vec<String> {
        self.backend
            .hw_platform()
            .map(hwaccel::available_devices)
            .unwrap_or_default()
    }
}

impl Drop for TransportController {
    fn drop(&mut self) {
        self.close();
    }
}

type AudioSetup = (Box<dyn crate::backend::AudioDecoder>, AudioParams);
type VideoSetup = (
    Box<dyn crate::backend::VideoDecoder>,
    PixelLayout,
    crate::media::TimeBase,
);

fn start_workers(
    shared: &Arc<Shared>,
    info: &MediaInfo,
    demuxer: Box<dyn crate::backend::Demuxer>,
    audio: Option<AudioSetup>,
    video: Option<VideoSetup>,
    workers: &mut Vec<JoinHandle<()>>,
) -> Result<(), OpenError> {
    if let Some((decoder, params)) = audio {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let worker_shared = Arc::clone(shared);
        workers.push(spawn_worker("audio", move || {
            AudioWorker::start(worker_shared, decoder, params, ready_tx)
        })?);
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(OpenError::AudioInit(
                    "audio worker exited during setup".to_string(),
                ));
            }
        }
    }

    if let Some((decoder, layout, time_base)) = video {
        let worker = VideoWorker::new(Arc::clone(shared), decoder, layout, time_base);
        workers.push(spawn_worker("video", move || worker.run())?);
    }

    let router = Router::new(Arc::clone(shared), demuxer, info);
    workers.push(spawn_worker("router", move || router.run())?);
    Ok(())
}

fn spawn_worker(
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, OpenError> {
    thread::Builder::new()
        .name(format!("av-{name}"))
        .spawn(f)
        .map_err(|source| OpenError::Spawn { name, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::backend::synthetic::{SyntheticAudio, SyntheticBackend, SyntheticMedia};
    use crate::hwaccel::HwDeviceType;
    use crate::testutil::{OutputLog, SharedLog, collect_until, recording_outputs};

    const LONG: Duration = Duration::from_secs(10);
    const SINK_MS: u32 = 100;

    fn controller(media: SyntheticMedia) -> (TransportController, Receiver<EngineEvent>, SharedLog) {
        controller_with(media, EngineConfig::default())
    }

    fn controller_with(
        media: SyntheticMedia,
        config: EngineConfig,
    ) -> (TransportController, Receiver<EngineEvent>, SharedLog) {
        let (audio, video, log) = recording_outputs(SINK_MS);
        let (ctl, rx) =
            TransportController::new(Arc::new(SyntheticBackend::new(media)), config, audio, video);
        (ctl, rx, log)
    }

    fn open(ctl: &mut TransportController) {
        ctl.open(Path::new("clip.synthetic")).unwrap();
    }

    /// Record the clock position next to every rendered frame.
    fn watch_clock(ctl: &TransportController, log: &SharedLog) {
        let session = ctl.session.as_ref().unwrap();
        log.lock().unwrap().clock = Some(session.shared.clock.clone());
    }

    fn count(events: &[EngineEvent], pred: impl Fn(&EngineEvent) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    fn snapshot(log: &SharedLog) -> OutputLog {
        log.lock().unwrap().clone()
    }

    #[test]
    fn commands_without_media_are_rejected() {
        let (ctl, _rx, _log) = controller(SyntheticMedia::default());
        assert!(matches!(ctl.play(), Err(TransportError::NotOpen)));
        assert!(matches!(ctl.seek(10), Err(TransportError::NotOpen)));
        assert_eq!(ctl.state(), PlaybackState::Idle);
        assert_eq!(ctl.frame_count(MediaKind::Video), -1);
        assert_eq!(ctl.status(), PlaybackStatus::idle());
    }

    #[test]
    fn open_initializes_outputs_once_and_reports_metadata() {
        let (mut ctl, rx, log) = controller(SyntheticMedia::default());
        let started = Instant::now();
        open(&mut ctl);
        ctl.play().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        let out = snapshot(&log);
        assert_eq!(out.audio_inits, vec![(48_000, 2)]);
        assert_eq!(out.video_inits, vec![PixelLayout::ThreePlane]);
        assert_eq!(ctl.duration_ms(), Some(10_000));
        assert_eq!(ctl.frame_count(MediaKind::Video), 250);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(count(&events, |e| *e == EngineEvent::DurationKnown(10_000)), 1);
        assert!(events.contains(&EngineEvent::HwAccel {
            backend: "software".to_string()
        }));
        assert!(events.contains(&EngineEvent::StateChanged(PlaybackState::Playing)));
    }

    #[test]
    fn natural_end_fires_finished_once_and_stops_delivery() {
        let (mut ctl, rx, log) = controller(SyntheticMedia::default());
        open(&mut ctl);
        ctl.play().unwrap();
        // Jump near the end so the playthrough stays short.
        ctl.seek(9_500).unwrap();

        let events = collect_until(&rx, LONG, |e| *e == EngineEvent::PlaybackFinished);
        assert_eq!(count(&events, |e| *e == EngineEvent::DurationKnown(10_000)), 1);
        assert_eq!(ctl.state(), PlaybackState::Ended);

        let at_finish = snapshot(&log);
        assert!(!at_finish.audio_pts.is_empty());
        assert!(!at_finish.video_pts.is_empty());
        assert!(*at_finish.video_pts.last().unwrap() >= 9_900.0);

        std::thread::sleep(Duration::from_millis(200));
        let later = snapshot(&log);
        assert_eq!(later.audio_pts.len(), at_finish.audio_pts.len());
        assert_eq!(later.video_pts.len(), at_finish.video_pts.len());
        let extra: Vec<_> = rx.try_iter().collect();
        assert_eq!(count(&extra, |e| *e == EngineEvent::PlaybackFinished), 0);
    }

    #[test]
    fn seek_discards_stale_units_and_rebases_clock() {
        let (mut ctl, rx, log) = controller(SyntheticMedia::default());
        open(&mut ctl);
        ctl.play().unwrap();
        collect_until(&rx, LONG, |e| *e == EngineEvent::Progress { seconds: 0 });

        let before = snapshot(&log).audio_pts.len();
        ctl.seek(5_000).unwrap();
        // Anything delivered from here on belongs to the new position.
        log.lock().unwrap().mark_seek();
        let position = ctl.position_ms().unwrap();
        assert!(position >= 4_900.0, "clock at {position}");

        collect_until(&rx, LONG, |e| *e == EngineEvent::Progress { seconds: 5 });
        ctl.stop().unwrap();

        let out = snapshot(&log);
        let floor = 5_000.0 - EngineConfig::default().seek_tolerance_ms;
        let after_audio = &out.audio_pts[out.seek_marks[0].0..];
        let after_video = &out.video_pts[out.seek_marks[0].1..];
        assert!(out.audio_pts.len() > before);
        assert!(after_audio.iter().all(|pts| *pts >= floor), "{after_audio:?}");
        assert!(after_video.iter().all(|pts| *pts >= floor), "{after_video:?}");
        assert!(out.resets >= 1);
    }

    #[test]
    fn rendered_video_stays_within_one_packet_and_sink_of_audio_clock() {
        let (mut ctl, rx, log) = controller(SyntheticMedia::default());
        open(&mut ctl);
        watch_clock(&ctl, &log);
        ctl.play().unwrap();
        collect_until(&rx, LONG, |e| *e == EngineEvent::Progress { seconds: 1 });

        ctl.seek(6_000).unwrap();
        log.lock().unwrap().mark_seek();
        collect_until(&rx, LONG, |e| *e == EngineEvent::Progress { seconds: 7 });
        ctl.stop().unwrap();

        let out = snapshot(&log);
        let warmup = EngineConfig::default().clock_warmup_ms;
        let bound = SyntheticAudio::default().packet_ms as f64 + SINK_MS as f64;
        let seek_at = out.seek_marks[0].1;
        let mut checked = (0, 0);
        let renders = out.video_pts.iter().zip(out.video_clock.iter().copied());
        for (i, (pts, clock)) in renders.enumerate() {
            let Some(clock) = clock.filter(|c| *c >= warmup) else {
                continue;
            };
            assert!(
                (pts - clock).abs() <= bound,
                "frame {i} at {pts} ms rendered with clock at {clock} ms"
            );
            if i < seek_at {
                checked.0 += 1;
            } else {
                checked.1 += 1;
            }
        }
        assert!(checked.0 >= 10, "{checked:?}");
        assert!(checked.1 >= 10, "{checked:?}");
    }

    #[test]
    fn audio_clock_never_decreases_between_seeks() {
        let media = SyntheticMedia::audio_only(1_500);
        let (mut ctl, rx, log) = controller(media);
        open(&mut ctl);
        ctl.play().unwrap();
        collect_until(&rx, LONG, |e| *e == EngineEvent::PlaybackFinished);

        let out = snapshot(&log);
        assert!(out.audio_pts.windows(2).all(|w| w[0] <= w[1]));
        assert!(*out.audio_pts.last().unwrap() >= 1_400.0);
    }

    #[test]
    fn pause_holds_delivery_and_resume_continues_in_order() {
        let (mut ctl, rx, log) = controller(SyntheticMedia::default());
        open(&mut ctl);
        ctl.play().unwrap();
        collect_until(&rx, LONG, |e| *e == EngineEvent::Progress { seconds: 0 });
        std::thread::sleep(Duration::from_millis(200));

        ctl.pause().unwrap();
        assert_eq!(ctl.state(), PlaybackState::Paused);
        std::thread::sleep(Duration::from_millis(100));
        let paused = snapshot(&log);
        std::thread::sleep(Duration::from_millis(300));
        let still = snapshot(&log);
        assert_eq!(paused.video_pts, still.video_pts);

        ctl.play().unwrap();
        std::thread::sleep(Duration::from_millis(300));
        ctl.stop().unwrap();

        let out = snapshot(&log);
        assert!(out.video_pts.len() > still.video_pts.len());
        // No frame repeated and none skipped across the pause.
        assert!(out.video_pts.windows(2).all(|w| (w[1] - w[0] - 40.0).abs() < 1e-6));
    }

    #[test]
    fn seek_while_idle_lands_paused_then_plays_from_target() {
        let (mut ctl, rx, log) = controller(SyntheticMedia::default());
        open(&mut ctl);
        ctl.seek(3_000).unwrap();
        collect_until(&rx, LONG, |e| *e == EngineEvent::StateChanged(PlaybackState::Paused));
        assert_eq!(ctl.state(), PlaybackState::Paused);

        ctl.play().unwrap();
        collect_until(&rx, LONG, |e| *e == EngineEvent::Progress { seconds: 3 });
        ctl.stop().unwrap();

        let out = snapshot(&log);
        assert!(out.audio_pts.iter().all(|pts| *pts >= 2_960.0));
        assert!(out.video_pts.iter().all(|pts| *pts >= 2_960.0));
    }

    #[test]
    fn stop_ends_without_finished_and_play_restarts_at_zero() {
        let (mut ctl, rx, log) = controller(SyntheticMedia::audio_only(5_000));
        open(&mut ctl);
        ctl.play().unwrap();
        collect_until(&rx, LONG, |e| *e == EngineEvent::Progress { seconds: 0 });
        ctl.seek(2_000).unwrap();
        collect_until(&rx, LONG, |e| *e == EngineEvent::Progress { seconds: 2 });

        ctl.stop().unwrap();
        assert_eq!(ctl.state(), PlaybackState::Ended);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(count(&events, |e| *e == EngineEvent::PlaybackFinished), 0);

        ctl.play().unwrap();
        log.lock().unwrap().mark_seek();
        collect_until(&rx, LONG, |e| *e == EngineEvent::StateChanged(PlaybackState::Playing));
        std::thread::sleep(Duration::from_millis(150));
        ctl.pause().unwrap();

        let out = snapshot(&log);
        let restarted = &out.audio_pts[out.seek_marks[0].0..];
        assert!(!restarted.is_empty());
        assert!(restarted[0] < 100.0, "restart began at {}", restarted[0]);
    }

    #[test]
    fn corrupt_and_unsupported_units_are_skipped() {
        let media = SyntheticMedia {
            duration_ms: 800,
            corrupt_packets: vec![(MediaKind::Audio, 3), (MediaKind::Video, 2)],
            unsupported_frames: vec![5],
            ..SyntheticMedia::default()
        };
        let (mut ctl, rx, log) = controller(media);
        open(&mut ctl);
        ctl.play().unwrap();
        collect_until(&rx, LONG, |e| *e == EngineEvent::PlaybackFinished);

        let out = snapshot(&log);
        assert!(!out.video_pts.contains(&80.0));
        assert!(!out.video_pts.contains(&200.0));
        assert!(out.video_pts.contains(&240.0));
        assert!(!out.audio_pts.contains(&60.0));
        assert!(out.audio_pts.contains(&80.0));
    }

    #[test]
    fn video_only_media_runs_on_wall_clock() {
        let (mut ctl, rx, log) = controller(SyntheticMedia::video_only(600));
        open(&mut ctl);
        let started = Instant::now();
        ctl.play().unwrap();
        let events = collect_until(&rx, LONG, |e| *e == EngineEvent::PlaybackFinished);
        // Paced against the timer rather than rendered as fast as decoded.
        assert!(started.elapsed() >= Duration::from_millis(450));
        assert!(events.contains(&EngineEvent::Progress { seconds: 0 }));
        assert_eq!(snapshot(&log).video_pts.len(), 15);
        assert!(snapshot(&log).audio_inits.is_empty());
    }

    #[test]
    fn hardware_session_reports_backend_and_two_plane_layout() {
        let media = SyntheticMedia {
            duration_ms: 400,
            hw_devices: vec![HwDeviceType::Vaapi],
            ..SyntheticMedia::default()
        };
        let (mut ctl, rx, log) = controller(media);
        open(&mut ctl);
        assert_eq!(ctl.available_hw_devices(), vec!["vaapi".to_string()]);
        assert_eq!(ctl.status().video_backend.as_deref(), Some("vaapi"));
        ctl.play().unwrap();
        let events = collect_until(&rx, LONG, |e| *e == EngineEvent::PlaybackFinished);
        assert!(events.contains(&EngineEvent::HwAccel {
            backend: "vaapi".to_string()
        }));
        let out = snapshot(&log);
        assert_eq!(out.video_inits, vec![PixelLayout::TwoPlane]);
        assert_eq!(out.video_pts.len(), 10);
    }

    #[test]
    fn close_returns_to_idle_and_reopen_reinitializes() {
        let (mut ctl, rx, log) = controller(SyntheticMedia::audio_only(2_000));
        open(&mut ctl);
        ctl.play().unwrap();
        ctl.close();
        assert_eq!(ctl.state(), PlaybackState::Idle);
        let events = collect_until(&rx, LONG, |e| *e == EngineEvent::StateChanged(PlaybackState::Idle));
        assert!(events.contains(&EngineEvent::StateChanged(PlaybackState::Stopped)));

        open(&mut ctl);
        assert_eq!(snapshot(&log).audio_inits.len(), 2);
        assert_eq!(ctl.status().state, PlaybackState::Idle);
    }

    #[test]
    fn fixed_output_rate_resamples() {
        let config = EngineConfig {
            output_sample_rate: Some(44_100),
            ..EngineConfig::default()
        };
        let (mut ctl, rx, log) = controller_with(SyntheticMedia::audio_only(500), config);
        open(&mut ctl);
        assert_eq!(ctl.status().output_sample_rate, Some(44_100));
        ctl.play().unwrap();
        collect_until(&rx, LONG, |e| *e == EngineEvent::PlaybackFinished);
        let out = snapshot(&log);
        assert_eq!(out.audio_inits, vec![(44_100, 2)]);
        assert!(!out.audio_pts.is_empty());
    }
}
