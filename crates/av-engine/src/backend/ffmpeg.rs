//! FFmpeg backend (feature `ffmpeg`).
//!
//! Full audio + video support through `ffmpeg-next`, including platform hardware decoding:
//! device enumeration, per-codec hardware configs, device context creation, the
//! `get_format` negotiation hook and device → host frame transfer.

use std::any::Any;
use std::ffi::{CStr, CString, c_void};
use std::path::Path;
use std::ptr;

use anyhow::{Result, anyhow, bail};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::format::sample::Type as SampleLayout;

use crate::backend::{AudioDecoder, Demuxer, MediaBackend, Picture, VideoDecoder};
use crate::error::OpenError;
use crate::hwaccel::{HwConfig, HwDevice, HwDeviceType, HwPlatform};
use crate::media::{
    CodecId, MediaKind, Packet, PixelFormat, RawAudioFrame, SampleFormat, StreamDescriptor,
    TimeBase,
};

#[derive(Debug)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        if let Err(e) = ffmpeg::init() {
            tracing::warn!("ffmpeg init failed: {e}");
        }
        Self
    }
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Demuxer>, OpenError> {
        let input = ffmpeg::format::input(&path).map_err(|e| OpenError::ContainerOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(FfmpegDemuxer::new(input)))
    }

    fn hw_platform(&self) -> Option<&dyn HwPlatform> {
        Some(self)
    }
}

/// Owned `AVBufferRef` to a hardware device context.
struct HwDeviceCtx {
    ptr: *mut ffi::AVBufferRef,
}

impl Drop for HwDeviceCtx {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                ffi::av_buffer_unref(&mut self.ptr);
            }
        }
    }
}

// SAFETY: the buffer reference is refcounted by libavutil and only ever re-referenced
// (`av_buffer_ref`) or released, both of which are thread-safe.
unsafe impl Send for HwDeviceCtx {}
unsafe impl Sync for HwDeviceCtx {}

fn to_av_device_type(t: HwDeviceType) -> ffi::AVHWDeviceType {
    use ffi::AVHWDeviceType::*;
    match t {
        HwDeviceType::Vdpau => AV_HWDEVICE_TYPE_VDPAU,
        HwDeviceType::Cuda => AV_HWDEVICE_TYPE_CUDA,
        HwDeviceType::Vaapi => AV_HWDEVICE_TYPE_VAAPI,
        HwDeviceType::Dxva2 => AV_HWDEVICE_TYPE_DXVA2,
        HwDeviceType::Qsv => AV_HWDEVICE_TYPE_QSV,
        HwDeviceType::VideoToolbox => AV_HWDEVICE_TYPE_VIDEOTOOLBOX,
        HwDeviceType::D3d11va => AV_HWDEVICE_TYPE_D3D11VA,
        HwDeviceType::Drm => AV_HWDEVICE_TYPE_DRM,
        HwDeviceType::OpenCl => AV_HWDEVICE_TYPE_OPENCL,
        HwDeviceType::MediaCodec => AV_HWDEVICE_TYPE_MEDIACODEC,
        HwDeviceType::Vulkan => AV_HWDEVICE_TYPE_VULKAN,
        HwDeviceType::D3d12va => AV_HWDEVICE_TYPE_D3D12VA,
    }
}

fn from_av_device_type(t: ffi::AVHWDeviceType) -> Option<HwDeviceType> {
    HwDeviceType::ALL
        .into_iter()
        .find(|ours| to_av_device_type(*ours) == t)
}

fn pix_fmt_name(fmt: ffi::AVPixelFormat) -> Option<String> {
    unsafe {
        let name = ffi::av_get_pix_fmt_name(fmt);
        if name.is_null() {
            None
        } else {
            Some(CStr::from_ptr(name).to_string_lossy().into_owned())
        }
    }
}

fn pix_fmt_from_name(name: &str) -> ffi::AVPixelFormat {
    match CString::new(name) {
        Ok(c) => unsafe { ffi::av_get_pix_fmt(c.as_ptr()) },
        Err(_) => ffi::AVPixelFormat::AV_PIX_FMT_NONE,
    }
}

fn is_hw_pix_fmt(fmt: ffi::AVPixelFormat) -> bool {
    unsafe {
        let desc = ffi::av_pix_fmt_desc_get(fmt);
        !desc.is_null() && ((*desc).flags & ffi::AV_PIX_FMT_FLAG_HWACCEL as u64) != 0
    }
}

impl HwPlatform for FfmpegBackend {
    fn device_types(&self) -> Vec<HwDeviceType> {
        let mut out = Vec::new();
        let mut t = ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE;
        loop {
            t = unsafe { ffi::av_hwdevice_iterate_types(t) };
            if t == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
                break;
            }
            if let Some(ours) = from_av_device_type(t) {
                out.push(ours);
            }
        }
        out
    }

    fn codec_configs(&self, codec: &CodecId) -> Vec<HwConfig> {
        let Some(decoder) = ffmpeg::decoder::find_by_name(codec.as_str()) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for i in 0.. {
            let cfg = unsafe { ffi::avcodec_get_hw_config(decoder.as_ptr(), i) };
            if cfg.is_null() {
                break;
            }
            let (methods, device_type, pix_fmt) =
                unsafe { ((*cfg).methods, (*cfg).device_type, (*cfg).pix_fmt) };
            let Some(device_type) = from_av_device_type(device_type) else {
                continue;
            };
            out.push(HwConfig {
                device_type,
                pixel_format: pix_fmt_name(pix_fmt).unwrap_or_default(),
                supports_device_ctx: methods
                    & ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as i32
                    != 0,
            });
        }
        out
    }

    fn create_device(&self, device_type: HwDeviceType, pixel_format: &str) -> Result<HwDevice> {
        let mut ctx: *mut ffi::AVBufferRef = ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(
                &mut ctx,
                to_av_device_type(device_type),
                ptr::null(),
                ptr::null_mut(),
                0,
            )
        };
        if ret < 0 || ctx.is_null() {
            bail!("av_hwdevice_ctx_create({device_type}) failed: {}", ffmpeg::Error::from(ret));
        }
        Ok(HwDevice::new(
            device_type,
            pixel_format,
            Box::new(HwDeviceCtx { ptr: ctx }),
        ))
    }
}

/// Prefer the hardware surface format stored in `opaque`; otherwise let libavcodec pick a
/// software format.
unsafe extern "C" fn negotiate_hw_format(
    ctx: *mut ffi::AVCodecContext,
    formats: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    unsafe {
        let wanted = (*ctx).opaque as isize as i32;
        let mut fmt = formats;
        while *fmt != ffi::AVPixelFormat::AV_PIX_FMT_NONE {
            if *fmt as i32 == wanted {
                return *fmt;
            }
            fmt = fmt.add(1);
        }
        tracing::warn!("hardware surface format not offered by decoder");
        ffi::avcodec_default_get_format(ctx, formats)
    }
}

struct FfmpegDemuxer {
    input: ffmpeg::format::context::Input,
    streams: Vec<StreamDescriptor>,
    params: Vec<ffmpeg::codec::Parameters>,
    frames: Vec<i64>,
}

impl FfmpegDemuxer {
    fn new(input: ffmpeg::format::context::Input) -> Self {
        let mut streams = Vec::new();
        let mut params = Vec::new();
        let mut frames = Vec::new();
        for stream in input.streams() {
            let p = stream.parameters();
            let kind = match p.medium() {
                ffmpeg::media::Type::Audio => MediaKind::Audio,
                ffmpeg::media::Type::Video => MediaKind::Video,
                _ => continue,
            };
            let tb = stream.time_base();
            let (width, height, sample_rate, channels) = unsafe {
                let raw = p.as_ptr();
                match kind {
                    MediaKind::Video => (
                        Some((*raw).width.max(0) as u32),
                        Some((*raw).height.max(0) as u32),
                        None,
                        None,
                    ),
                    MediaKind::Audio => (
                        None,
                        None,
                        Some((*raw).sample_rate.max(0) as u32),
                        Some((*raw).ch_layout.nb_channels.max(0) as u16),
                    ),
                }
            };
            streams.push(StreamDescriptor {
                index: stream.index(),
                kind,
                codec: CodecId::new(p.id().name()),
                time_base: TimeBase::new(tb.numerator() as i64, tb.denominator() as i64),
                width,
                height,
                sample_rate,
                channels,
            });
            frames.push(stream.frames());
            params.push(p.clone());
        }
        Self {
            input,
            streams,
            params,
            frames,
        }
    }

    fn position(&self, stream_index: usize) -> Option<usize> {
        self.streams.iter().position(|s| s.index == stream_index)
    }

    fn context_for(
        &self,
        stream_index: usize,
        kind: MediaKind,
    ) -> Result<ffmpeg::codec::context::Context, OpenError> {
        let pos = self.position(stream_index).ok_or(OpenError::NoSuchStream)?;
        let params = self.params[pos].clone();
        if ffmpeg::decoder::find(params.id()).is_none() {
            return Err(OpenError::CodecUnsupported {
                kind,
                codec: self.streams[pos].codec.clone(),
            });
        }
        ffmpeg::codec::context::Context::from_parameters(params).map_err(|e| {
            OpenError::CodecInit {
                kind,
                reason: e.to_string(),
            }
        })
    }
}

impl Demuxer for FfmpegDemuxer {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn best_stream(&self, kind: MediaKind) -> Option<usize> {
        let medium = match kind {
            MediaKind::Audio => ffmpeg::media::Type::Audio,
            MediaKind::Video => ffmpeg::media::Type::Video,
        };
        self.input.streams().best(medium).map(|s| s.index())
    }

    fn duration_ms(&self) -> Option<u64> {
        let us = self.input.duration();
        (us > 0).then(|| us as u64 / 1000)
    }

    fn frame_count(&self, stream_index: usize) -> Option<u64> {
        let n = *self.frames.get(self.position(stream_index)?)?;
        (n > 0).then_some(n as u64)
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => Ok(Some(Packet {
                stream_index: packet.stream(),
                pts: packet.pts(),
                dts: packet.dts(),
                duration: packet.duration(),
                is_key: packet.is_key(),
                data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(anyhow!("read packet: {e}")),
        }
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<()> {
        let ret = unsafe {
            ffi::av_seek_frame(
                self.input.as_mut_ptr(),
                stream_index as i32,
                timestamp,
                ffi::AVSEEK_FLAG_BACKWARD as i32,
            )
        };
        if ret < 0 {
            bail!("av_seek_frame to {timestamp} failed: {}", ffmpeg::Error::from(ret));
        }
        Ok(())
    }

    fn audio_decoder(&self, stream_index: usize) -> Result<Box<dyn AudioDecoder>, OpenError> {
        let context = self.context_for(stream_index, MediaKind::Audio)?;
        let decoder = context.decoder().audio().map_err(|e| OpenError::CodecInit {
            kind: MediaKind::Audio,
            reason: e.to_string(),
        })?;
        Ok(Box::new(FfmpegAudioDecoder { decoder }))
    }

    fn video_decoder(
        &self,
        stream_index: usize,
        hw: Option<&HwDevice>,
    ) -> Result<Box<dyn VideoDecoder>, OpenError> {
        let mut context = self.context_for(stream_index, MediaKind::Video)?;
        let hw_ctx = hw.and_then(|d| d.handle::<HwDeviceCtx>().map(|h| (d, h)));
        if let Some((device, handle)) = hw_ctx {
            let wanted = pix_fmt_from_name(&device.pixel_format);
            unsafe {
                let raw = context.as_mut_ptr();
                (*raw).hw_device_ctx = ffi::av_buffer_ref(handle.ptr);
                (*raw).opaque = wanted as i32 as isize as *mut c_void;
                (*raw).get_format = Some(negotiate_hw_format);
            }
        }
        let decoder = context.decoder().video().map_err(|e| OpenError::CodecInit {
            kind: MediaKind::Video,
            reason: e.to_string(),
        })?;
        Ok(Box::new(FfmpegVideoDecoder {
            decoder,
            hw_active: hw_ctx.is_some(),
        }))
    }
}

fn to_ffmpeg_packet(packet: &Packet) -> ffmpeg::Packet {
    let mut out = ffmpeg::Packet::copy(&packet.data);
    out.set_stream(packet.stream_index);
    out.set_pts(packet.pts);
    out.set_dts(packet.dts);
    out.set_duration(packet.duration);
    if packet.is_key {
        out.set_flags(ffmpeg::packet::Flags::KEY);
    }
    out
}

/// `Ok(false)` when the decoder needs more input or is drained.
fn frame_ready(result: std::result::Result<(), ffmpeg::Error>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(ffmpeg::Error::Eof) => Ok(false),
        Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(false),
        Err(e) => Err(anyhow!("receive frame: {e}")),
    }
}

struct FfmpegAudioDecoder {
    decoder: ffmpeg::decoder::Audio,
}

impl AudioDecoder for FfmpegAudioDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        self.decoder
            .send_packet(&to_ffmpeg_packet(packet))
            .map_err(|e| anyhow!("send packet: {e}"))
    }

    fn send_eof(&mut self) -> Result<()> {
        self.decoder
            .send_eof()
            .map_err(|e| anyhow!("send eof: {e}"))
    }

    fn receive_frame(&mut self) -> Result<Option<RawAudioFrame>> {
        let mut frame = ffmpeg::frame::Audio::empty();
        if !frame_ready(self.decoder.receive_frame(&mut frame))? {
            return Ok(None);
        }
        let (format, planar) = match frame.format() {
            ffmpeg::format::Sample::U8(t) => (SampleFormat::U8, t == SampleLayout::Planar),
            ffmpeg::format::Sample::I16(t) => (SampleFormat::S16, t == SampleLayout::Planar),
            ffmpeg::format::Sample::I32(t) => (SampleFormat::S32, t == SampleLayout::Planar),
            ffmpeg::format::Sample::F32(t) => (SampleFormat::F32, t == SampleLayout::Planar),
            ffmpeg::format::Sample::F64(t) => (SampleFormat::F64, t == SampleLayout::Planar),
            other => bail!("unsupported sample format {other:?}"),
        };
        let channels = unsafe { (*frame.as_ptr()).ch_layout.nb_channels.max(0) as usize };
        let samples = frame.samples();
        let planes = if planar {
            let len = samples * format.bytes();
            (0..channels.min(frame.planes()))
                .map(|ch| frame.data(ch)[..len].to_vec())
                .collect()
        } else {
            let len = samples * channels * format.bytes();
            vec![frame.data(0)[..len].to_vec()]
        };
        Ok(Some(RawAudioFrame {
            format,
            planar,
            channels: channels as u16,
            sample_rate: frame.rate(),
            samples,
            pts: frame.pts(),
            planes,
        }))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn codec_name(&self) -> Option<String> {
        self.decoder.codec().map(|c| c.name().to_string())
    }
}

struct FfmpegPicture(ffmpeg::frame::Video);

impl FfmpegPicture {
    fn av_format(&self) -> ffi::AVPixelFormat {
        ffi::AVPixelFormat::from(self.0.format())
    }
}

impl Picture for FfmpegPicture {
    fn format(&self) -> PixelFormat {
        let fmt = self.av_format();
        let name = pix_fmt_name(fmt).unwrap_or_else(|| "none".to_string());
        match fmt {
            ffi::AVPixelFormat::AV_PIX_FMT_YUV420P => PixelFormat::Yuv420p,
            ffi::AVPixelFormat::AV_PIX_FMT_NV12 => PixelFormat::Nv12,
            _ if is_hw_pix_fmt(fmt) => PixelFormat::Hardware(name),
            _ => PixelFormat::Other(name),
        }
    }

    fn width(&self) -> u32 {
        self.0.width()
    }

    fn height(&self) -> u32 {
        self.0.height()
    }

    fn pts(&self) -> Option<i64> {
        self.0.pts()
    }

    fn plane_count(&self) -> usize {
        self.0.planes()
    }

    fn plane(&self, index: usize) -> &[u8] {
        // Device surfaces have no host-addressable planes.
        if is_hw_pix_fmt(self.av_format()) || index >= self.0.planes() {
            return &[];
        }
        self.0.data(index)
    }

    fn stride(&self, index: usize) -> usize {
        if index >= self.0.planes() {
            return 0;
        }
        self.0.stride(index)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct FfmpegVideoDecoder {
    decoder: ffmpeg::decoder::Video,
    hw_active: bool,
}

impl VideoDecoder for FfmpegVideoDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        self.decoder
            .send_packet(&to_ffmpeg_packet(packet))
            .map_err(|e| anyhow!("send packet: {e}"))
    }

    fn send_eof(&mut self) -> Result<()> {
        self.decoder
            .send_eof()
            .map_err(|e| anyhow!("send eof: {e}"))
    }

    fn receive_frame(&mut self) -> Result<Option<Box<dyn Picture>>> {
        let mut frame = ffmpeg::frame::Video::empty();
        if !frame_ready(self.decoder.receive_frame(&mut frame))? {
            return Ok(None);
        }
        Ok(Some(Box::new(FfmpegPicture(frame))))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn hw_active(&self) -> bool {
        self.hw_active
    }

    fn transfer_to_host(&mut self, picture: Box<dyn Picture>) -> Result<Box<dyn Picture>> {
        let Some(hw) = picture.as_any().downcast_ref::<FfmpegPicture>() else {
            return Ok(picture);
        };
        if !is_hw_pix_fmt(hw.av_format()) {
            return Ok(picture);
        }
        let mut sw = ffmpeg::frame::Video::empty();
        let ret = unsafe { ffi::av_hwframe_transfer_data(sw.as_mut_ptr(), hw.0.as_ptr(), 0) };
        if ret < 0 {
            bail!("av_hwframe_transfer_data failed: {}", ffmpeg::Error::from(ret));
        }
        sw.set_pts(hw.0.pts());
        Ok(Box::new(FfmpegPicture(sw)))
    }

    fn codec_name(&self) -> Option<String> {
        self.decoder.codec().map(|c| c.name().to_string())
    }
}
