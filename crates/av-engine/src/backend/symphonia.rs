//! Pure-Rust audio backend.
//!
//! Uses Symphonia to probe the container and decode audio tracks. Track ids are mapped onto
//! dense stream indices in track order; tracks without a known codec are skipped. Video is
//! not supported by this backend, so video-only files report `NoSuchStream`.

use std::fs::File;
use std::path::Path;

use anyhow::{Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::backend::{AudioDecoder, Demuxer, MediaBackend, VideoDecoder};
use crate::error::OpenError;
use crate::hwaccel::HwDevice;
use crate::media::{
    CodecId, MediaKind, Packet, RawAudioFrame, SampleFormat, StreamDescriptor, TimeBase,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct SymphoniaBackend;

impl MediaBackend for SymphoniaBackend {
    fn name(&self) -> &'static str {
        "symphonia"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Demuxer>, OpenError> {
        let container_err = |reason: String| OpenError::ContainerOpen {
            path: path.to_path_buf(),
            reason,
        };
        let file = File::open(path).map_err(|e| container_err(e.to_string()))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| container_err(e.to_string()))?;

        Ok(Box::new(SymphoniaDemuxer::new(probed.format)))
    }
}

struct SymphoniaDemuxer {
    format: Box<dyn FormatReader>,
    streams: Vec<StreamDescriptor>,
    track_ids: Vec<u32>,
    params: Vec<CodecParameters>,
}

impl SymphoniaDemuxer {
    fn new(format: Box<dyn FormatReader>) -> Self {
        let mut streams = Vec::new();
        let mut track_ids = Vec::new();
        let mut params = Vec::new();
        for track in format.tracks() {
            let p = &track.codec_params;
            if p.codec == CODEC_TYPE_NULL {
                continue;
            }
            let time_base = match (p.time_base, p.sample_rate) {
                (Some(tb), _) => TimeBase::new(tb.numer as i64, tb.denom as i64),
                (None, Some(rate)) => TimeBase::new(1, rate as i64),
                (None, None) => TimeBase::MILLIS,
            };
            streams.push(StreamDescriptor {
                index: streams.len(),
                kind: MediaKind::Audio,
                codec: CodecId::new(codec_name_from_params(p)),
                time_base,
                width: None,
                height: None,
                sample_rate: p.sample_rate,
                channels: p.channels.map(|c| c.count() as u16),
            });
            track_ids.push(track.id);
            params.push(p.clone());
        }
        Self {
            format,
            streams,
            track_ids,
            params,
        }
    }

    fn index_of_track(&self, track_id: u32) -> Option<usize> {
        self.track_ids.iter().position(|id| *id == track_id)
    }
}

impl Demuxer for SymphoniaDemuxer {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn duration_ms(&self) -> Option<u64> {
        self.params.iter().find_map(duration_ms_from_codec_params)
    }

    fn frame_count(&self, _stream_index: usize) -> Option<u64> {
        // Symphonia reports audio length in samples, not in coded frames.
        None
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(anyhow!("read packet: {e}")),
            };
            let Some(stream_index) = self.index_of_track(packet.track_id()) else {
                continue;
            };
            return Ok(Some(Packet {
                stream_index,
                pts: Some(packet.ts() as i64),
                dts: Some(packet.ts() as i64),
                duration: packet.dur() as i64,
                is_key: true,
                data: packet.data.to_vec(),
            }));
        }
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<()> {
        let track_id = *self
            .track_ids
            .get(stream_index)
            .ok_or_else(|| anyhow!("no stream {stream_index}"))?;
        self.format
            .seek(
                SeekMode::Coarse,
                SeekTo::TimeStamp {
                    ts: timestamp.max(0) as u64,
                    track_id,
                },
            )
            .map_err(|e| anyhow!("seek to {timestamp}: {e}"))?;
        Ok(())
    }

    fn audio_decoder(&self, stream_index: usize) -> Result<Box<dyn AudioDecoder>, OpenError> {
        let params = self.params.get(stream_index).ok_or(OpenError::NoSuchStream)?;
        let track_id = self.track_ids[stream_index];
        let codec = CodecId::new(codec_name_from_params(params));
        if symphonia::default::get_codecs()
            .get_codec(params.codec)
            .is_none()
        {
            return Err(OpenError::CodecUnsupported {
                kind: MediaKind::Audio,
                codec,
            });
        }
        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| OpenError::CodecInit {
                kind: MediaKind::Audio,
                reason: e.to_string(),
            })?;
        Ok(Box::new(SymphoniaAudioDecoder {
            decoder,
            track_id,
            codec,
            pending: None,
        }))
    }

    fn video_decoder(
        &self,
        _stream_index: usize,
        _hw: Option<&HwDevice>,
    ) -> Result<Box<dyn VideoDecoder>, OpenError> {
        Err(OpenError::NoSuchStream)
    }
}

struct SymphoniaAudioDecoder {
    decoder: Box<dyn Decoder>,
    track_id: u32,
    codec: CodecId,
    pending: Option<RawAudioFrame>,
}

impl AudioDecoder for SymphoniaAudioDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let ts = packet.pts.unwrap_or(0).max(0) as u64;
        let sym_packet = symphonia::core::formats::Packet::new_from_slice(
            self.track_id,
            ts,
            packet.duration.max(0) as u64,
            &packet.data,
        );
        let decoded = self
            .decoder
            .decode(&sym_packet)
            .map_err(|e| anyhow!("decode: {e}"))?;

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            return Ok(());
        }
        let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        let bytes: Vec<u8> = sample_buf
            .samples()
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .collect();
        self.pending = Some(RawAudioFrame {
            format: SampleFormat::F32,
            planar: false,
            channels: spec.channels.count() as u16,
            sample_rate: spec.rate,
            samples: frames,
            pts: packet.pts,
            planes: vec![bytes],
        });
        Ok(())
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<RawAudioFrame>> {
        Ok(self.pending.take())
    }

    fn flush(&mut self) {
        self.pending = None;
        self.decoder.reset();
    }

    fn codec_name(&self) -> Option<String> {
        Some(self.codec.to_string())
    }
}

/// Duration in milliseconds from codec metadata, when the track reports its length.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Short codec label (`flac`, `mp3`, ...).
fn codec_name_from_params(params: &CodecParameters) -> String {
    symphonia::default::get_codecs()
        .get_codec(params.codec)
        .map(|d| d.short_name.to_string())
        .unwrap_or_else(|| format!("codec-{}", params.codec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use symphonia::core::codecs::CODEC_TYPE_FLAC;

    fn write_wav(path: &Path, rate: u32, channels: u16, frames: u32) {
        let data_len = frames * channels as u32 * 2;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * channels as u32 * 2).to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..frames * channels as u32 {
            out.extend_from_slice(&((i % 200) as i16 * 100).to_le_bytes());
        }
        let mut f = File::create(path).unwrap();
        f.write_all(&out).unwrap();
    }

    fn temp_wav(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("av-engine-{}-{name}.wav", std::process::id()));
        write_wav(&path, 8000, 2, 8000);
        path
    }

    #[test]
    fn duration_ms_from_codec_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_ms_from_codec_params(&params).is_none());
    }

    #[test]
    fn duration_ms_from_codec_params_computes() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        params.n_frames = Some(96_000);
        assert_eq!(duration_ms_from_codec_params(&params), Some(2000));
    }

    #[test]
    fn codec_name_uses_registry_short_name() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert_eq!(codec_name_from_params(&params), "flac");
    }

    #[test]
    fn missing_file_is_container_error() {
        let err = SymphoniaBackend
            .open(Path::new("/nonexistent/input.flac"))
            .err()
            .unwrap();
        assert!(matches!(err, OpenError::ContainerOpen { .. }));
    }

    #[test]
    fn wav_opens_and_decodes_to_end() {
        let path = temp_wav("decode");
        let mut demuxer = SymphoniaBackend.open(&path).unwrap();
        assert_eq!(demuxer.streams().len(), 1);
        assert_eq!(demuxer.best_stream(MediaKind::Video), None);
        assert_eq!(demuxer.duration_ms(), Some(1000));

        let mut decoder = demuxer.audio_decoder(0).unwrap();
        let mut total = 0usize;
        while let Some(packet) = demuxer.read_packet().unwrap() {
            decoder.send_packet(&packet).unwrap();
            while let Some(frame) = decoder.receive_frame().unwrap() {
                assert_eq!(frame.channels, 2);
                total += frame.samples;
            }
        }
        assert_eq!(total, 8000);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn seek_repositions_reader() {
        let path = temp_wav("seek");
        let mut demuxer = SymphoniaBackend.open(&path).unwrap();
        demuxer.seek(0, 4000).unwrap();
        let packet = demuxer.read_packet().unwrap().unwrap();
        assert!(packet.pts.unwrap() <= 4000);
        assert!(packet.pts.unwrap() > 0);
        let _ = std::fs::remove_file(path);
    }
}
