//! Device audio output (CPAL).
//!
//! [`CpalAudioOutput`] implements [`AudioOutput`] on top of a CPAL output stream. The stream
//! is built and owned by a dedicated thread; the engine side only touches a bounded
//! [`SampleQueue`] and a pause flag. The real-time callback:
//! - refills a small local buffer from the queue without blocking
//! - applies basic channel mapping (mono↔stereo, best-effort otherwise)
//! - converts `f32` samples to the device sample format

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::device::{pick_buffer_size, pick_device, pick_output_config};
use crate::media::DecodedAudioBuffer;
use crate::output::AudioOutput;
use crate::queue::{SampleQueue, calc_max_buffered_samples};

/// Frames pulled from the queue per callback refill.
const REFILL_MAX_FRAMES: usize = 1024;

/// Audio sink playing through a CPAL output device.
pub struct CpalAudioOutput {
    /// Case-insensitive substring of the device name; `None` uses the host default.
    device: Option<String>,
    buffer_ms: u32,
    queue: Option<Arc<SampleQueue>>,
    paused: Arc<AtomicBool>,
    underrun_events: Arc<AtomicU64>,
    stream: Option<StreamThread>,
}

struct StreamThread {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl CpalAudioOutput {
    pub fn new(device: Option<String>, buffer_ms: u32) -> Self {
        Self {
            device,
            buffer_ms,
            queue: None,
            paused: Arc::new(AtomicBool::new(false)),
            underrun_events: Arc::new(AtomicU64::new(0)),
            stream: None,
        }
    }

    fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.stop.send(());
            if stream.handle.join().is_err() {
                tracing::warn!("audio stream thread panicked");
            }
            let underruns = self.underrun_events.swap(0, Ordering::Relaxed);
            tracing::debug!(underruns, "audio stream closed");
        }
    }
}

impl AudioOutput for CpalAudioOutput {
    fn negotiate_rate(&mut self, source_rate: u32) -> u32 {
        let host = cpal::default_host();
        let picked = pick_device(&host, self.device.as_deref())
            .and_then(|device| pick_output_config(&device, Some(source_rate)));
        match picked {
            Ok(config) => {
                let rate = config.sample_rate();
                if rate != source_rate {
                    tracing::info!(source_rate, device_rate = rate, "device rate differs from media");
                }
                rate
            }
            Err(err) => {
                tracing::warn!("could not query output device, keeping {source_rate} Hz: {err:#}");
                source_rate
            }
        }
    }

    fn init(&mut self, sample_rate: u32, channels: u16) -> Result<()> {
        if sample_rate == 0 || channels == 0 {
            return Err(anyhow!("invalid format {sample_rate} Hz / {channels} ch"));
        }
        self.stop_stream();

        let capacity = calc_max_buffered_samples(sample_rate, channels as usize, self.buffer_ms);
        let queue = Arc::new(SampleQueue::new(channels as usize, capacity));
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        let args = StreamArgs {
            device: self.device.clone(),
            sample_rate,
            queue: queue.clone(),
            paused: self.paused.clone(),
            underrun_events: self.underrun_events.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("av-cpal".into())
            .spawn(move || run_stream(args, ready_tx, stop_rx))
            .context("failed to spawn audio stream thread")?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = handle.join();
                return Err(err);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(anyhow!("audio stream thread exited during startup"));
            }
        }

        tracing::info!(
            sample_rate,
            channels,
            buffer_ms = self.buffer_ms,
            capacity_samples = capacity,
            "audio device opened"
        );
        self.queue = Some(queue);
        self.stream = Some(StreamThread {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    fn bytes_free(&mut self) -> usize {
        self.queue
            .as_ref()
            .map_or(0, |q| q.free_samples() * DecodedAudioBuffer::BYTES_PER_SAMPLE)
    }

    fn write(&mut self, buffer: DecodedAudioBuffer) -> Result<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| anyhow!("audio device not initialized"))?;
        let samples = s16le_to_f32(&buffer.data);
        let accepted = queue.push_available(&samples);
        if accepted < samples.len() {
            tracing::warn!(
                dropped_samples = samples.len() - accepted,
                "audio queue overrun"
            );
        }
        Ok(())
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    fn reset(&mut self) {
        if let Some(queue) = &self.queue {
            queue.clear();
        }
    }
}

impl Drop for CpalAudioOutput {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

struct StreamArgs {
    device: Option<String>,
    sample_rate: u32,
    queue: Arc<SampleQueue>,
    paused: Arc<AtomicBool>,
    underrun_events: Arc<AtomicU64>,
}

/// Build the stream on this thread, report readiness, keep it alive until `stop`.
fn run_stream(args: StreamArgs, ready: Sender<Result<()>>, stop: Receiver<()>) {
    let stream = match open_stream(&args) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    let _ = stop.recv();
    drop(stream);
    tracing::debug!("audio stream closed");
}

fn open_stream(args: &StreamArgs) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = pick_device(&host, args.device.as_deref())?;
    let supported = pick_output_config(&device, Some(args.sample_rate))?;
    if supported.sample_rate() != args.sample_rate {
        return Err(anyhow!(
            "device cannot play {} Hz (closest {} Hz)",
            args.sample_rate,
            supported.sample_rate()
        ));
    }

    let mut config = supported.config();
    if let Some(buffer_size) = pick_buffer_size(&supported) {
        config.buffer_size = buffer_size;
    }
    tracing::debug!(
        device_channels = config.channels,
        sample_format = ?supported.sample_format(),
        buffer_size = ?config.buffer_size,
        "building output stream"
    );

    let stream = build_output_stream(&device, &config, supported.sample_format(), args)?;
    stream.play().context("failed to start output stream")?;
    Ok(stream)
}

fn s16le_to_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

/// Build a CPAL output stream that plays audio from `args.queue`.
///
/// The queue holds interleaved `f32` samples at the device rate. Underruns are filled with
/// silence; while paused the callback outputs silence and does not drain the queue.
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    args: &StreamArgs,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, args),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, args),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, args),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, args),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    args: &StreamArgs,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let state = Arc::new(Mutex::new(CallbackState {
        pos: 0,
        src_channels: args.queue.channels(),
        src: Vec::new(),
    }));

    let queue = args.queue.clone();
    let paused = args.paused.clone();
    let underrun_events = args.underrun_events.clone();
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if paused.load(Ordering::Relaxed) {
                data.fill(<T as cpal::Sample>::from_sample::<f32>(0.0));
                return;
            }

            let mut st = state.lock().unwrap();
            let frames = data.len() / channels_out;
            for frame in 0..frames {
                if st.pos >= st.src.len() {
                    st.pos = 0;
                    st.src.clear();
                    match queue.pop_up_to(REFILL_MAX_FRAMES) {
                        Some(v) => st.src = v,
                        None => {
                            underrun_events.fetch_add(1, Ordering::Relaxed);
                            data[frame * channels_out..]
                                .fill(<T as cpal::Sample>::from_sample::<f32>(0.0));
                            break;
                        }
                    }
                }
                for ch in 0..channels_out {
                    let sample = next_sample_mapped(&mut st, channels_out, ch);
                    data[frame * channels_out + ch] =
                        <T as cpal::Sample>::from_sample::<f32>(sample);
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Interleaved samples fetched from the queue, consumed frame by frame by the callback.
struct CallbackState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

/// Read one output sample for `dst_ch`, applying a simple channel mapping.
///
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to the available source channels
///
/// `st.pos` advances once per destination frame (after the last channel).
fn next_sample_mapped(st: &mut CallbackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &CallbackState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, _) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(src_channels: usize, src: Vec<f32>, dst_channels: usize) -> Vec<f32> {
        let mut st = CallbackState {
            pos: 0,
            src_channels,
            src,
        };
        let mut out = Vec::new();
        while st.pos < st.src.len() {
            for ch in 0..dst_channels {
                out.push(next_sample_mapped(&mut st, dst_channels, ch));
            }
        }
        out
    }

    #[test]
    fn mono_is_duplicated_to_stereo() {
        assert_eq!(render(1, vec![0.1, 0.2], 2), vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn stereo_is_averaged_to_mono() {
        assert_eq!(render(2, vec![0.25, 0.75, -1.0, 1.0], 1), vec![0.5, 0.0]);
    }

    #[test]
    fn extra_device_channels_repeat_the_last_source_channel() {
        assert_eq!(render(2, vec![0.1, 0.2], 4), vec![0.1, 0.2, 0.2, 0.2]);
    }

    #[test]
    fn s16_bytes_map_to_unit_range() {
        let mut bytes = Vec::new();
        for s in [i16::MIN, 0, 16384] {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        assert_eq!(s16le_to_f32(&bytes), vec![-1.0, 0.0, 0.5]);
    }

    #[test]
    fn uninitialized_output_has_no_room() {
        let mut out = CpalAudioOutput::new(None, 200);
        assert_eq!(out.bytes_free(), 0);
        assert!(out.write(DecodedAudioBuffer {
            data: vec![0; 4],
            sample_rate: 48_000,
            channels: 2,
            pts_ms: 0.0,
        })
        .is_err());
    }
}
