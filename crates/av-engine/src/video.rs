//! Video decode pipeline.
//!
//! Decodes routed packets, moves hardware surfaces to host memory, and copies every picture
//! into one tightly packed 4:2:0 buffer in the layout announced to the renderer at open.
//! Pictures in any other pixel format are logged and dropped.

use std::sync::Arc;

use anyhow::{Result, bail};

use crate::backend::{Picture, VideoDecoder};
use crate::media::{
    DecodedVideoFrame, PixelFormat, PixelLayout, TimeBase, chroma_size, packed_420_len,
};
use crate::router::{Routed, RoutedItem};
use crate::sync::Presenter;
use crate::transport::Shared;

/// Stride-free copy-out into a fixed canonical layout.
#[derive(Clone, Copy, Debug)]
pub struct FrameNormalizer {
    layout: PixelLayout,
}

impl FrameNormalizer {
    pub fn new(layout: PixelLayout) -> Self {
        Self { layout }
    }

    /// Copy `picture` (YUV420P or NV12) into a packed frame of this normalizer's layout.
    pub fn normalize(&self, picture: &dyn Picture, pts_ms: f64) -> Result<DecodedVideoFrame> {
        let width = picture.width();
        let height = picture.height();
        if width == 0 || height == 0 {
            bail!("empty picture {width}x{height}");
        }
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = chroma_size(width, height);
        let mut data = Vec::with_capacity(packed_420_len(width, height));

        match picture.format() {
            PixelFormat::Yuv420p => {
                require_planes(picture, 3)?;
                copy_plane(picture, 0, w, h, &mut data)?;
                match self.layout {
                    PixelLayout::ThreePlane => {
                        copy_plane(picture, 1, cw, ch, &mut data)?;
                        copy_plane(picture, 2, cw, ch, &mut data)?;
                    }
                    PixelLayout::TwoPlane => interleave_chroma(picture, cw, ch, &mut data)?,
                }
            }
            PixelFormat::Nv12 => {
                require_planes(picture, 2)?;
                copy_plane(picture, 0, w, h, &mut data)?;
                match self.layout {
                    PixelLayout::TwoPlane => copy_plane(picture, 1, cw * 2, ch, &mut data)?,
                    PixelLayout::ThreePlane => deinterleave_chroma(picture, cw, ch, &mut data)?,
                }
            }
            other => bail!("unsupported pixel format {other}"),
        }

        Ok(DecodedVideoFrame {
            layout: self.layout,
            width,
            height,
            pts_ms,
            data,
        })
    }
}

fn require_planes(picture: &dyn Picture, count: usize) -> Result<()> {
    if picture.plane_count() < count {
        bail!(
            "{} picture has {} planes, need {count}",
            picture.format(),
            picture.plane_count()
        );
    }
    Ok(())
}

/// The first `row_bytes` of each of `rows` rows of one plane.
fn plane_rows<'a>(
    picture: &'a dyn Picture,
    index: usize,
    row_bytes: usize,
    rows: usize,
) -> Result<Vec<&'a [u8]>> {
    let plane = picture.plane(index);
    let stride = picture.stride(index);
    if stride < row_bytes {
        bail!("plane {index} stride {stride} is shorter than a {row_bytes}-byte row");
    }
    let needed = stride * rows.saturating_sub(1) + row_bytes;
    if plane.len() < needed {
        bail!("plane {index} holds {} bytes, need {needed}", plane.len());
    }
    Ok((0..rows)
        .map(|r| &plane[r * stride..r * stride + row_bytes])
        .collect())
}

fn copy_plane(
    picture: &dyn Picture,
    index: usize,
    row_bytes: usize,
    rows: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    for row in plane_rows(picture, index, row_bytes, rows)? {
        out.extend_from_slice(row);
    }
    Ok(())
}

fn interleave_chroma(picture: &dyn Picture, cw: usize, ch: usize, out: &mut Vec<u8>) -> Result<()> {
    let u = plane_rows(picture, 1, cw, ch)?;
    let v = plane_rows(picture, 2, cw, ch)?;
    for (u_row, v_row) in u.iter().zip(&v) {
        for (u, v) in u_row.iter().zip(v_row.iter()) {
            out.push(*u);
            out.push(*v);
        }
    }
    Ok(())
}

fn deinterleave_chroma(
    picture: &dyn Picture,
    cw: usize,
    ch: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    let uv = plane_rows(picture, 1, cw * 2, ch)?;
    for offset in [0, 1] {
        for row in &uv {
            out.extend(row.iter().skip(offset).step_by(2));
        }
    }
    Ok(())
}

pub(crate) struct VideoWorker {
    shared: Arc<Shared>,
    decoder: Box<dyn VideoDecoder>,
    normalizer: FrameNormalizer,
    presenter: Presenter,
    time_base: TimeBase,
    generation: u64,
    floor_ms: Option<f64>,
    last_pts_ms: f64,
    dropped: u64,
}

impl VideoWorker {
    pub(crate) fn new(
        shared: Arc<Shared>,
        decoder: Box<dyn VideoDecoder>,
        layout: PixelLayout,
        time_base: TimeBase,
    ) -> Self {
        let generation = shared.control.generation();
        Self {
            presenter: Presenter::new(Arc::clone(&shared)),
            shared,
            decoder,
            normalizer: FrameNormalizer::new(layout),
            time_base,
            generation,
            floor_ms: None,
            last_pts_ms: 0.0,
            dropped: 0,
        }
    }

    pub(crate) fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        while let Some(routed) = shared.video_q.pop(|| shared.control.is_shutdown()) {
            self.handle(routed);
            shared.video_q.complete();
        }
        tracing::debug!(dropped = self.dropped, "video worker exiting");
    }

    fn handle(&mut self, routed: Routed) {
        if !self.shared.control.is_current(routed.generation) {
            return;
        }
        if routed.generation != self.generation {
            self.decoder.flush();
            self.presenter.reset();
            self.generation = routed.generation;
            self.floor_ms = self.shared.control.seek_floor_ms();
            self.last_pts_ms = self.floor_ms.unwrap_or(0.0).max(0.0);
            tracing::debug!(generation = self.generation, floor_ms = self.floor_ms, "video pipeline flushed");
        }
        match routed.item {
            RoutedItem::Packet(packet) => {
                if let Err(err) = self.decoder.send_packet(&packet) {
                    tracing::warn!(pts = packet.pts, "video packet failed to decode, skipping: {err:#}");
                    return;
                }
            }
            RoutedItem::EndOfStream => {
                if let Err(err) = self.decoder.send_eof() {
                    tracing::warn!("video decoder drain failed: {err:#}");
                }
            }
        }
        self.drain();
    }

    fn drain(&mut self) {
        loop {
            let picture = match self.decoder.receive_frame() {
                Ok(Some(picture)) => picture,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("video decode failed, skipping frame: {err:#}");
                    break;
                }
            };
            if !self.process(picture) {
                break;
            }
        }
    }

    /// Returns `false` once the generation went stale.
    fn process(&mut self, picture: Box<dyn Picture>) -> bool {
        let picture = if matches!(picture.format(), PixelFormat::Hardware(_)) {
            match self.decoder.transfer_to_host(picture) {
                Ok(host) => host,
                Err(err) => {
                    self.dropped += 1;
                    tracing::warn!("hardware frame transfer failed, dropping frame: {err:#}");
                    return true;
                }
            }
        } else {
            picture
        };

        let pts_ms = picture
            .pts()
            .map_or(self.last_pts_ms, |pts| self.time_base.to_ms(pts));
        self.last_pts_ms = pts_ms;
        if let Some(floor) = self.floor_ms {
            if pts_ms < floor {
                tracing::trace!(pts_ms, floor, "dropping video before seek target");
                return true;
            }
        }

        let frame = match self.normalizer.normalize(picture.as_ref(), pts_ms) {
            Ok(frame) => frame,
            Err(err) => {
                self.dropped += 1;
                tracing::warn!(pts_ms, format = %picture.format(), "dropping video frame: {err:#}");
                return true;
            }
        };
        self.presenter.present(frame, self.generation)
    }
}
