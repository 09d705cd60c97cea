//! Audio output conversion.
//!
//! Every decoded frame goes through here regardless of its native format:
//! - any sample format, planar or packed, becomes interleaved `f32`
//! - when the source and output rates differ, Rubato resamples in fixed input chunks
//! - the result is packed into interleaved signed 16-bit little-endian PCM

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::OpenError;
use crate::media::{DecodedAudioBuffer, RawAudioFrame, SampleFormat};

/// Converts decoder output to the sink's fixed PCM format.
pub struct AudioConverter {
    src_rate: u32,
    dst_rate: u32,
    channels: usize,
    chunk_frames: usize,
    resampler: Option<Box<dyn Resampler<f32>>>,
    pending: Vec<f32>,
    pending_pts_ms: f64,
    out_interleaved: Vec<f32>,
}

impl AudioConverter {
    /// Build a converter for `channels` at `src_rate` → `dst_rate`.
    ///
    /// Fails when the resampler cannot be constructed for these parameters.
    pub fn new(
        src_rate: u32,
        channels: u16,
        dst_rate: u32,
        chunk_frames: usize,
    ) -> Result<Self, OpenError> {
        if src_rate == 0 || dst_rate == 0 || channels == 0 {
            return Err(OpenError::AudioInit(format!(
                "invalid format {src_rate} Hz -> {dst_rate} Hz, {channels} ch"
            )));
        }
        let channels = channels as usize;
        let chunk_frames = chunk_frames.max(1);
        let resampler = if src_rate == dst_rate {
            tracing::info!(rate_hz = src_rate, "resample skipped (rates match)");
            None
        } else {
            tracing::info!(from_hz = src_rate, to_hz = dst_rate, "resampling");
            Some(build_resampler(src_rate, dst_rate, chunk_frames, channels)?)
        };
        let out_frames = resampler
            .as_ref()
            .map_or(chunk_frames, |r| r.output_frames_max());
        Ok(Self {
            src_rate,
            dst_rate,
            channels,
            chunk_frames,
            resampler,
            pending: Vec::new(),
            pending_pts_ms: 0.0,
            out_interleaved: vec![0.0; out_frames * channels],
        })
    }

    /// Convert one decoded frame presented at `pts_ms`.
    ///
    /// Returns `Ok(None)` while the resampler is still collecting a full input chunk.
    pub fn convert(
        &mut self,
        frame: &RawAudioFrame,
        pts_ms: f64,
    ) -> Result<Option<DecodedAudioBuffer>> {
        if frame.channels as usize != self.channels {
            return Err(anyhow!(
                "channel count changed mid-stream ({} -> {})",
                self.channels,
                frame.channels
            ));
        }
        if frame.sample_rate != 0 && frame.sample_rate != self.src_rate {
            return Err(anyhow!(
                "sample rate changed mid-stream ({} -> {})",
                self.src_rate,
                frame.sample_rate
            ));
        }
        let interleaved = to_interleaved_f32(frame)?;

        if self.resampler.is_none() {
            return Ok(Some(self.pack(&interleaved, pts_ms)));
        }

        if self.pending.is_empty() {
            self.pending_pts_ms = pts_ms;
        }
        self.pending.extend_from_slice(&interleaved);

        let mut out = Vec::new();
        let out_pts = self.pending_pts_ms - self.latency_ms();
        let chunk_samples = self.chunk_frames * self.channels;
        while self.pending.len() >= chunk_samples {
            let chunk: Vec<f32> = self.pending.drain(..chunk_samples).collect();
            let produced = self.process(&chunk, None)?;
            out.extend_from_slice(&self.out_interleaved[..produced]);
            self.pending_pts_ms += self.chunk_frames as f64 * 1000.0 / self.src_rate as f64;
        }

        if out.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.pack(&out, out_pts)))
    }

    /// Push the buffered tail through the resampler (end of stream).
    pub fn flush(&mut self) -> Result<Option<DecodedAudioBuffer>> {
        if self.resampler.is_none() || self.pending.is_empty() {
            return Ok(None);
        }
        let tail = std::mem::take(&mut self.pending);
        let tail_frames = tail.len() / self.channels;
        if tail_frames == 0 {
            return Ok(None);
        }
        let mut padded = tail;
        padded.resize(self.chunk_frames * self.channels, 0.0);
        let produced = self.process(&padded, Some(tail_frames))?;
        if produced == 0 {
            return Ok(None);
        }
        let out = self.out_interleaved[..produced].to_vec();
        let pts_ms = self.pending_pts_ms - self.latency_ms();
        Ok(Some(self.pack(&out, pts_ms)))
    }

    /// How far the resampler's output trails its input, in milliseconds.
    ///
    /// Subtracted from output timestamps so the clock follows what is audible.
    pub fn latency_ms(&self) -> f64 {
        self.resampler.as_ref().map_or(0.0, |r| {
            r.output_delay() as f64 * 1000.0 / self.dst_rate as f64
        })
    }

    /// Drop buffered input and filter state (seek).
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(r) = self.resampler.as_mut() {
            r.reset();
        }
    }

    fn process(&mut self, input: &[f32], partial_len: Option<usize>) -> Result<usize> {
        let channels = self.channels;
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(0);
        };
        let input_adapter = InterleavedSlice::new(input, channels, input.len() / channels)
            .map_err(|e| anyhow!("interleaved slice (input) error: {e}"))?;
        let out_capacity_frames = self.out_interleaved.len() / channels;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.out_interleaved, channels, out_capacity_frames)
                .map_err(|e| anyhow!("interleaved slice (output) error: {e}"))?;

        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };
        let (_nbr_in, nbr_out) = resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
            .map_err(|e| anyhow!("resampler process error: {e}"))?;
        Ok(nbr_out * channels)
    }

    fn pack(&self, samples: &[f32], pts_ms: f64) -> DecodedAudioBuffer {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            data.extend_from_slice(&f32_to_s16(*s).to_le_bytes());
        }
        DecodedAudioBuffer {
            data,
            sample_rate: self.dst_rate,
            channels: self.channels as u16,
            pts_ms,
        }
    }
}

fn build_resampler(
    src_rate: u32,
    dst_rate: u32,
    chunk_frames: usize,
    channels: usize,
) -> Result<Box<dyn Resampler<f32>>, OpenError> {
    let sinc_len = 128;
    let window = WindowFunction::BlackmanHarris2;
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    };
    let ratio = dst_rate as f64 / src_rate as f64;
    let resampler = Async::<f32>::new_sinc(
        ratio,
        1.1,
        &params,
        chunk_frames,
        channels,
        FixedAsync::Input,
    )
    .map_err(|e| OpenError::AudioInit(e.to_string()))?;
    Ok(Box::new(resampler))
}

fn f32_to_s16(s: f32) -> i16 {
    (s * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

/// Decode native-endian samples of any supported format into interleaved `f32`.
pub fn to_interleaved_f32(frame: &RawAudioFrame) -> Result<Vec<f32>> {
    let channels = frame.channels as usize;
    let width = frame.format.bytes();
    let expected_planes = if frame.planar { channels } else { 1 };
    let plane_len = if frame.planar {
        frame.samples * width
    } else {
        frame.samples * channels * width
    };
    if frame.planes.len() < expected_planes {
        return Err(anyhow!(
            "expected {expected_planes} planes, got {}",
            frame.planes.len()
        ));
    }
    if let Some(short) = frame.planes[..expected_planes]
        .iter()
        .find(|p| p.len() < plane_len)
    {
        return Err(anyhow!(
            "plane holds {} bytes, need {plane_len}",
            short.len()
        ));
    }

    let mut out = Vec::with_capacity(frame.samples * channels);
    if frame.planar {
        for i in 0..frame.samples {
            for plane in &frame.planes[..channels] {
                out.push(read_sample(frame.format, &plane[i * width..(i + 1) * width]));
            }
        }
    } else {
        out.extend(
            frame.planes[0][..plane_len]
                .chunks_exact(width)
                .map(|b| read_sample(frame.format, b)),
        );
    }
    Ok(out)
}

fn read_sample(format: SampleFormat, b: &[u8]) -> f32 {
    match format {
        SampleFormat::U8 => (b[0] as f32 - 128.0) / 128.0,
        SampleFormat::S16 => i16::from_ne_bytes([b[0], b[1]]) as f32 / 32768.0,
        SampleFormat::S32 => i32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f32 / 2_147_483_648.0,
        SampleFormat::F32 => f32::from_ne_bytes([b[0], b[1], b[2], b[3]]),
        SampleFormat::F64 => {
            f64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16_frame(samples: &[i16], channels: u16, rate: u32) -> RawAudioFrame {
        RawAudioFrame {
            format: SampleFormat::S16,
            planar: false,
            channels,
            sample_rate: rate,
            samples: samples.len() / channels as usize,
            pts: Some(0),
            planes: vec![samples.iter().flat_map(|s| s.to_ne_bytes()).collect()],
        }
    }

    fn f32_planar(left: &[f32], right: &[f32], rate: u32) -> RawAudioFrame {
        RawAudioFrame {
            format: SampleFormat::F32,
            planar: true,
            channels: 2,
            sample_rate: rate,
            samples: left.len(),
            pts: Some(0),
            planes: vec![
                left.iter().flat_map(|s| s.to_ne_bytes()).collect(),
                right.iter().flat_map(|s| s.to_ne_bytes()).collect(),
            ],
        }
    }

    #[test]
    fn s16_passthrough_is_bit_exact() {
        let input = [0i16, 1, -1, 16_384, -32_768, 32_767];
        let mut conv = AudioConverter::new(48_000, 2, 48_000, 1024).unwrap();
        let out = conv.convert(&s16_frame(&input, 2, 48_000), 12.5).unwrap().unwrap();
        assert_eq!(out.samples().collect::<Vec<_>>(), input.to_vec());
        assert_eq!(out.pts_ms, 12.5);
        assert_eq!(out.sample_rate, 48_000);
    }

    #[test]
    fn planar_input_is_interleaved() {
        let frame = f32_planar(&[0.5, 0.25], &[-0.5, -0.25], 48_000);
        assert_eq!(
            to_interleaved_f32(&frame).unwrap(),
            vec![0.5, -0.5, 0.25, -0.25]
        );
    }

    #[test]
    fn u8_and_f64_decode_to_unit_range() {
        let frame = RawAudioFrame {
            format: SampleFormat::U8,
            planar: false,
            channels: 1,
            sample_rate: 8000,
            samples: 3,
            pts: None,
            planes: vec![vec![0, 128, 255]],
        };
        let out = to_interleaved_f32(&frame).unwrap();
        assert_eq!(out[0], -1.0);
        assert_eq!(out[1], 0.0);
        assert!(out[2] > 0.99);

        let frame = RawAudioFrame {
            format: SampleFormat::F64,
            planar: false,
            channels: 1,
            sample_rate: 8000,
            samples: 1,
            pts: None,
            planes: vec![0.75f64.to_ne_bytes().to_vec()],
        };
        assert_eq!(to_interleaved_f32(&frame).unwrap(), vec![0.75]);
    }

    #[test]
    fn short_plane_is_rejected() {
        let mut frame = f32_planar(&[0.1; 4], &[0.1; 4], 48_000);
        frame.planes[1].truncate(8);
        assert!(to_interleaved_f32(&frame).is_err());
        frame.planes.pop();
        assert!(to_interleaved_f32(&frame).is_err());
    }

    #[test]
    fn out_of_range_samples_are_clamped() {
        assert_eq!(f32_to_s16(2.0), i16::MAX);
        assert_eq!(f32_to_s16(-2.0), i16::MIN);
        assert_eq!(f32_to_s16(0.0), 0);
    }

    #[test]
    fn zero_rate_is_an_init_error() {
        let err = AudioConverter::new(0, 2, 48_000, 1024).err().unwrap();
        assert!(matches!(err, OpenError::AudioInit(_)));
    }

    #[test]
    fn resampling_buffers_until_full_chunk() {
        let mut conv = AudioConverter::new(44_100, 2, 48_000, 1024).unwrap();
        let half = f32_planar(&[0.0; 512], &[0.0; 512], 44_100);
        assert!(conv.convert(&half, 0.0).unwrap().is_none());
        let out = conv.convert(&half, 11.6).unwrap().unwrap();
        // Output is stamped with the first pending frame's time, less the filter delay.
        assert_eq!(out.pts_ms, -conv.latency_ms());
        assert_eq!(out.sample_rate, 48_000);
        assert!(out.frames() > 0);
    }

    #[test]
    fn resampled_pts_trail_by_filter_delay() {
        let mut conv = AudioConverter::new(44_100, 1, 48_000, 1024).unwrap();
        let latency = conv.latency_ms();
        // 128-tap sinc at 48/44.1: about 69 output frames.
        assert!(latency > 1.0 && latency < 2.0, "latency {latency}");

        let chunk = RawAudioFrame {
            format: SampleFormat::F32,
            planar: false,
            channels: 1,
            sample_rate: 44_100,
            samples: 1024,
            pts: Some(0),
            planes: vec![vec![0u8; 1024 * 4]],
        };
        let first = conv.convert(&chunk, 1_000.0).unwrap().unwrap();
        assert_eq!(first.pts_ms, 1_000.0 - latency);
        let chunk_ms = 1024.0 * 1000.0 / 44_100.0;
        let second = conv.convert(&chunk, 1_000.0 + chunk_ms).unwrap().unwrap();
        assert!((second.pts_ms - (1_000.0 + chunk_ms - latency)).abs() < 1e-9);

        let same_rate = AudioConverter::new(48_000, 1, 48_000, 1024).unwrap();
        assert_eq!(same_rate.latency_ms(), 0.0);
    }

    #[test]
    fn resampling_preserves_duration_over_many_chunks() {
        let mut conv = AudioConverter::new(48_000, 1, 44_100, 480).unwrap();
        let mut produced = 0usize;
        let frame = RawAudioFrame {
            format: SampleFormat::F32,
            planar: false,
            channels: 1,
            sample_rate: 48_000,
            samples: 4800,
            pts: Some(0),
            planes: vec![vec![0u8; 4800 * 4]],
        };
        for i in 0..10 {
            if let Some(buf) = conv.convert(&frame, i as f64 * 100.0).unwrap() {
                produced += buf.frames();
            }
        }
        if let Some(buf) = conv.flush().unwrap() {
            produced += buf.frames();
        }
        // One second of input at 48 kHz should come out near 44 100 frames.
        assert!((43_000..=45_000).contains(&produced), "produced {produced}");
    }

    #[test]
    fn reset_drops_pending_input() {
        let mut conv = AudioConverter::new(44_100, 2, 48_000, 1024).unwrap();
        let half = f32_planar(&[0.1; 512], &[0.1; 512], 44_100);
        assert!(conv.convert(&half, 0.0).unwrap().is_none());
        conv.reset();
        assert!(conv.flush().unwrap().is_none());
        assert!(conv.convert(&half, 500.0).unwrap().is_none());
    }

    #[test]
    fn channel_change_is_rejected() {
        let mut conv = AudioConverter::new(48_000, 2, 48_000, 1024).unwrap();
        assert!(conv.convert(&s16_frame(&[1, 2, 3], 1, 48_000), 0.0).is_err());
    }
}
