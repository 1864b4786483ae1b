//! Built-in YUV4MPEG2 pipeline
//!
//! Decodes 4:2:0 Y4M streams pulled through a [`ByteSource`]. Each frame is
//! repacked from planar I420 into NV12 inside a sealed memory file, which is
//! the buffer handed to the host. Playback is paced by a wall clock anchored
//! at the last play or seek; frames that fall behind the clock are skipped.
//!
//! Frame bytes are requested ahead and collected as they arrive, so `poll`
//! returns `None` instead of waiting on a slow host.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, info, trace};

use super::{MediaInfo, Pipeline, PipelineError, PipelineEvent, Sample, SharedBuffer};
use crate::source::ByteSource;

const MAGIC: &[u8] = b"YUV4MPEG2 ";
const FRAME_TAG: &[u8] = b"FRAME";
const MAX_HEADER: usize = 1024;
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Where everything lives in the stream, learned at preroll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamLayout {
    width: u32,
    height: u32,
    fps_num: u64,
    fps_den: u64,
    header_len: u64,
    frame_header_len: u64,
    /// Frame header plus planes.
    stride: u64,
    frame_count: u64,
}

impl StreamLayout {
    fn chroma_size(&self) -> (usize, usize) {
        (self.width.div_ceil(2) as usize, self.height.div_ceil(2) as usize)
    }

    /// Only valid for `index < frame_count`.
    fn offset(&self, index: u64) -> u64 {
        self.header_len + index * self.stride
    }

    fn pts(&self, index: u64) -> u64 {
        let ns = (index as u128 * NANOS_PER_SEC).saturating_mul(self.fps_den as u128)
            / self.fps_num as u128;
        ns.min(u64::MAX as u128) as u64
    }

    /// Index of the frame on screen at `position_ns`.
    fn index_at(&self, position_ns: u64) -> u64 {
        let index = (position_ns as u128).saturating_mul(self.fps_num as u128)
            / (self.fps_den as u128 * NANOS_PER_SEC);
        index.min(u64::MAX as u128) as u64
    }

    fn duration(&self) -> u64 {
        self.pts(self.frame_count)
    }
}

/// Planes of a 4:2:0 frame, or `None` when the size does not fit in 64 bits.
fn frame_size(width: u32, height: u32) -> Option<u64> {
    let luma = (width as u64).checked_mul(height as u64)?;
    let chroma = (width.div_ceil(2) as u64).checked_mul(height.div_ceil(2) as u64)?;
    luma.checked_add(chroma.checked_mul(2)?)
}

/// Y4M decoder over any byte source.
pub struct Y4mPipeline<S> {
    source: S,
    layout: Option<StreamLayout>,
    pending: VecDeque<PipelineEvent>,

    playing: bool,
    /// Wall-clock anchor: when playback (re)started and from which pts.
    clock: Option<(Instant, u64)>,
    next_index: u64,
    position_ns: u64,
    preroll_pending: bool,
    eos_sent: bool,

    /// Frame whose bytes are on the way.
    inflight: Option<u64>,
    /// Frame whose bytes have arrived but not been decoded.
    ready: Option<(u64, Vec<u8>)>,
}

impl<S: ByteSource> Y4mPipeline<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            layout: None,
            pending: VecDeque::new(),
            playing: false,
            clock: None,
            next_index: 0,
            position_ns: 0,
            preroll_pending: false,
            eos_sent: false,
            inflight: None,
            ready: None,
        }
    }

    fn read_header(&mut self) -> Result<StreamLayout, PipelineError> {
        let stream_len = self.source.stream_len();

        // Both header lines fit in the first two line limits
        let head_len = stream_len.min(2 * MAX_HEADER as u64 + 2) as usize;
        self.source.request(0, head_len)?;
        let head = self.source.wait_chunk()?.bytes;

        let (header, rest) = split_line(&head, MAX_HEADER)?;
        let header_len = header.len() as u64 + 1;
        let params = header
            .strip_prefix(MAGIC)
            .ok_or_else(|| PipelineError::Format("missing YUV4MPEG2 signature".into()))?;

        let mut width = None;
        let mut height = None;
        let mut rate = None;
        let mut colorspace = "420jpeg".to_string();

        for token in params.split(|&b| b == b' ').filter(|t| !t.is_empty()) {
            let value = String::from_utf8_lossy(&token[1..]).into_owned();
            match token[0] {
                b'W' => width = value.parse::<u32>().ok(),
                b'H' => height = value.parse::<u32>().ok(),
                b'F' => rate = parse_ratio(&value),
                b'C' => colorspace = value,
                // Interlacing, aspect and extensions do not affect the layout
                _ => {}
            }
        }

        let (width, height) = match (width, height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => return Err(PipelineError::Format("missing or zero frame size".into())),
        };
        let (fps_num, fps_den) =
            rate.ok_or_else(|| PipelineError::Format("missing or invalid frame rate".into()))?;
        if !matches!(colorspace.as_str(), "420" | "420jpeg" | "420paldv" | "420mpeg2") {
            return Err(PipelineError::Unsupported(format!("colorspace C{}", colorspace)));
        }

        let (frame_header, _) = split_line(rest, MAX_HEADER)?;
        if !frame_header.starts_with(FRAME_TAG) {
            return Err(PipelineError::Format("first frame has no FRAME marker".into()));
        }
        let frame_header_len = frame_header.len() as u64 + 1;

        let stride = frame_size(width, height)
            .and_then(|size| size.checked_add(frame_header_len))
            .ok_or_else(|| {
                PipelineError::Format(format!("{}x{} frame size overflows", width, height))
            })?;

        let frame_count = stream_len.saturating_sub(header_len) / stride;
        if frame_count == 0 {
            return Err(PipelineError::Format("stream holds no complete frame".into()));
        }

        Ok(StreamLayout {
            width,
            height,
            fps_num,
            fps_den,
            header_len,
            frame_header_len,
            stride,
            frame_count,
        })
    }

    /// Ask for frame `index` unless it is already on the way or here.
    fn fetch(&mut self, layout: &StreamLayout, index: u64) -> Result<(), PipelineError> {
        let arrived = matches!(self.ready, Some((i, _)) if i == index);
        if arrived || self.inflight == Some(index) {
            return Ok(());
        }

        self.source.request(layout.offset(index), layout.stride as usize)?;
        self.inflight = Some(index);
        trace!(index, "Requested frame");
        Ok(())
    }

    /// Pick up whatever the source has answered, dropping anything stale.
    fn collect(&mut self, layout: &StreamLayout) -> Result<(), PipelineError> {
        while let Some(chunk) = self.source.try_chunk() {
            let chunk = chunk?;
            match self.inflight {
                Some(index) if layout.offset(index) == chunk.offset => {
                    self.inflight = None;
                    self.ready = Some((index, chunk.bytes));
                }
                _ => trace!(offset = chunk.offset, "Dropping stale frame bytes"),
            }
        }
        Ok(())
    }

    fn take_ready(&mut self, index: u64) -> Option<Vec<u8>> {
        match self.ready.take() {
            Some((i, bytes)) if i == index => Some(bytes),
            other => {
                self.ready = other;
                None
            }
        }
    }

    fn restart_clock(&mut self) {
        self.clock = self.playing.then(|| (Instant::now(), self.position_ns));
    }

    fn emit(&mut self, layout: &StreamLayout, index: u64, bytes: &[u8]) -> PipelineEvent {
        match decode(layout, index, bytes) {
            Ok(sample) => {
                self.position_ns = sample.pts_ns;
                self.next_index = index + 1;
                PipelineEvent::Sample(sample)
            }
            Err(e) => PipelineEvent::Error(e),
        }
    }

    /// The frame to show next, or the event that replaces it.
    fn due_index(&mut self, layout: &StreamLayout) -> Result<u64, Option<PipelineEvent>> {
        if self.preroll_pending {
            return Ok(self.next_index);
        }
        if !self.playing || self.eos_sent {
            return Err(None);
        }

        if self.next_index >= layout.frame_count {
            self.eos_sent = true;
            self.source.release();
            info!("End of stream");
            return Err(Some(PipelineEvent::EndOfStream));
        }

        let Some((started, base_pts)) = self.clock else {
            return Err(None);
        };
        let due = base_pts.saturating_add(started.elapsed().as_nanos() as u64);
        if layout.pts(self.next_index) > due {
            // Not yet; have the bytes ready when it is
            return Err(self.fetch(layout, self.next_index).err().map(PipelineEvent::Error));
        }

        // Skip frames the clock has already passed
        let mut index = self.next_index;
        while index + 1 < layout.frame_count && layout.pts(index + 1) <= due {
            index += 1;
        }
        if index > self.next_index {
            debug!(skipped = index - self.next_index, "Behind the clock, dropping frames");
        }
        Ok(index)
    }
}

impl<S: ByteSource> Pipeline for Y4mPipeline<S> {
    fn preroll(&mut self) -> Result<MediaInfo, PipelineError> {
        let layout = self.read_header()?;
        info!(
            width = layout.width,
            height = layout.height,
            frames = layout.frame_count,
            "Y4M stream {}/{} fps",
            layout.fps_num,
            layout.fps_den
        );

        self.layout = Some(layout);
        self.next_index = 0;
        self.position_ns = 0;
        self.preroll_pending = true;

        Ok(MediaInfo {
            duration_ns: Some(layout.duration()),
            width: layout.width,
            height: layout.height,
        })
    }

    fn play(&mut self) {
        if !self.playing {
            self.playing = true;
            self.restart_clock();
        }
    }

    fn pause(&mut self) {
        self.playing = false;
        self.clock = None;
    }

    fn seek(&mut self, position_ns: u64) {
        let Some(layout) = self.layout else {
            return;
        };

        let index = layout.index_at(position_ns).min(layout.frame_count - 1);
        debug!(position_ns, index, "Seek");

        self.pending.clear();
        self.eos_sent = false;
        self.next_index = index;
        self.position_ns = layout.pts(index);
        self.preroll_pending = true;
        self.restart_clock();
    }

    fn set_volume(&mut self, volume: f64) {
        debug!(volume, "No audio track, volume has no effect");
    }

    fn poll(&mut self) -> Option<PipelineEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        let layout = self.layout?;

        let index = match self.due_index(&layout) {
            Ok(index) => index,
            Err(event) => return event,
        };

        if let Err(e) = self.fetch(&layout, index).and_then(|()| self.collect(&layout)) {
            return Some(PipelineEvent::Error(e));
        }
        let bytes = self.take_ready(index)?;

        let event = self.emit(&layout, index, &bytes);
        if self.preroll_pending {
            self.preroll_pending = false;
            if matches!(event, PipelineEvent::Sample(_)) {
                self.pending.push_back(PipelineEvent::Prerolled);
                self.restart_clock();
            }
        }
        Some(event)
    }
}

/// Repack frame `index` from its raw bytes as NV12 in a shareable buffer.
fn decode(layout: &StreamLayout, index: u64, bytes: &[u8]) -> Result<Sample, PipelineError> {
    if bytes.len() as u64 != layout.stride {
        return Err(PipelineError::Format(format!("frame {} is truncated", index)));
    }

    let (header, planes) = bytes.split_at(layout.frame_header_len as usize);
    if !header.starts_with(FRAME_TAG) || header.last() != Some(&b'\n') {
        return Err(PipelineError::Format(format!("frame {} has a bad header", index)));
    }

    let nv12 = i420_to_nv12(planes, layout);
    let buffer = SharedBuffer::from_bytes(&nv12)?;

    let pts_ns = layout.pts(index);
    trace!(index, pts_ns, "Decoded frame");

    Ok(Sample {
        pts_ns,
        width: layout.width,
        height: layout.height,
        buffer,
    })
}

/// Split off the first line (without its `\n`).
fn split_line(bytes: &[u8], limit: usize) -> Result<(&[u8], &[u8]), PipelineError> {
    let window = &bytes[..bytes.len().min(limit + 1)];
    match window.iter().position(|&b| b == b'\n') {
        Some(end) => Ok((&bytes[..end], &bytes[end + 1..])),
        None if window.len() > limit => Err(PipelineError::Format("header line too long".into())),
        None => Err(PipelineError::Format("unterminated header line".into())),
    }
}

fn parse_ratio(value: &str) -> Option<(u64, u64)> {
    let (num, den) = value.split_once(':')?;
    let num = num.parse::<u64>().ok()?;
    let den = den.parse::<u64>().ok()?;
    (num > 0 && den > 0).then_some((num, den))
}

/// Planar I420 (Y, U, V) to NV12 (Y, interleaved UV).
fn i420_to_nv12(planes: &[u8], layout: &StreamLayout) -> Vec<u8> {
    let luma = layout.width as usize * layout.height as usize;
    let (cw, ch) = layout.chroma_size();
    let chroma = cw * ch;

    let mut out = Vec::with_capacity(luma + 2 * chroma);
    out.extend_from_slice(&planes[..luma]);

    let u = &planes[luma..luma + chroma];
    let v = &planes[luma + chroma..luma + 2 * chroma];
    for (u, v) in u.iter().zip(v) {
        out.push(*u);
        out.push(*v);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use crate::source::MemorySource;
    use std::os::unix::fs::FileExt;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    /// `frames` frames of `w`x`h`; luma is the frame index, U = 100, V = 200.
    fn clip(w: u32, h: u32, frames: u8, rate: &str, colorspace: &str) -> Vec<u8> {
        let mut out =
            format!("YUV4MPEG2 W{} H{} F{} Ip A1:1 {}\n", w, h, rate, colorspace).into_bytes();
        let chroma = (w.div_ceil(2) * h.div_ceil(2)) as usize;
        for i in 0..frames {
            out.extend_from_slice(b"FRAME\n");
            out.extend(std::iter::repeat(i).take((w * h) as usize));
            out.extend(std::iter::repeat(100u8).take(chroma));
            out.extend(std::iter::repeat(200u8).take(chroma));
        }
        out
    }

    fn expect_sample(event: Option<PipelineEvent>) -> Sample {
        match event {
            Some(PipelineEvent::Sample(sample)) => sample,
            other => panic!("expected a sample, got {:?}", other),
        }
    }

    #[test]
    fn test_preroll_reports_shape_and_first_frame() {
        let mut pipeline = Y4mPipeline::new(MemorySource::new(clip(4, 2, 3, "25:1", "C420jpeg")));
        let info = pipeline.preroll().unwrap();

        assert_eq!(info.width, 4);
        assert_eq!(info.height, 2);
        assert_eq!(info.duration_ns, Some(120_000_000));

        let sample = expect_sample(pipeline.poll());
        assert_eq!(sample.pts_ns, 0);
        assert!(matches!(pipeline.poll(), Some(PipelineEvent::Prerolled)));

        // Paused: nothing more
        assert!(pipeline.poll().is_none());
    }

    #[test]
    fn test_frame_is_repacked_as_nv12() {
        let mut pipeline = Y4mPipeline::new(MemorySource::new(clip(3, 3, 2, "30:1", "")));
        pipeline.preroll().unwrap();
        pipeline.seek(40_000_000);

        let sample = expect_sample(pipeline.poll());
        assert_eq!(sample.pts_ns, 33_333_333);

        let file = File::from(sample.buffer);
        // 9 luma bytes, then 2x2 chroma pairs
        let mut bytes = vec![0u8; 9 + 8];
        file.read_exact_at(&mut bytes, 0).unwrap();
        assert!(bytes[..9].iter().all(|&b| b == 1));
        assert_eq!(&bytes[9..], &[100, 200, 100, 200, 100, 200, 100, 200]);
    }

    #[test]
    fn test_seek_clamps_to_last_frame() {
        let mut pipeline = Y4mPipeline::new(MemorySource::new(clip(2, 2, 4, "10:1", "C420")));
        pipeline.preroll().unwrap();
        let _ = pipeline.poll();
        let _ = pipeline.poll();

        pipeline.seek(10_000_000_000);
        assert_eq!(expect_sample(pipeline.poll()).pts_ns, 300_000_000);
    }

    #[test]
    fn test_play_runs_to_end_of_stream() {
        let mut pipeline = Y4mPipeline::new(MemorySource::new(clip(2, 2, 5, "200:1", "C420mpeg2")));
        pipeline.preroll().unwrap();
        pipeline.play();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut last_pts = None;
        loop {
            match pipeline.poll() {
                Some(PipelineEvent::Sample(sample)) => {
                    if let Some(prev) = last_pts {
                        assert!(sample.pts_ns > prev);
                    }
                    last_pts = Some(sample.pts_ns);
                }
                Some(PipelineEvent::EndOfStream) => break,
                Some(PipelineEvent::Prerolled) => {}
                Some(PipelineEvent::Error(e)) => panic!("pipeline error: {}", e),
                None => std::thread::sleep(Duration::from_millis(1)),
            }
            assert!(Instant::now() < deadline, "no end of stream");
        }

        assert_eq!(last_pts, Some(20_000_000));
        // End of stream is reported once and lets go of the data channel
        assert!(pipeline.poll().is_none());
        assert_eq!(pipeline.source.releases, 1);
    }

    #[test]
    fn test_rejects_unsupported_colorspace() {
        let mut pipeline = Y4mPipeline::new(MemorySource::new(clip(2, 2, 1, "25:1", "C444")));
        assert!(matches!(pipeline.preroll(), Err(PipelineError::Unsupported(_))));
    }

    #[test]
    fn test_rejects_garbage() {
        let mut pipeline = Y4mPipeline::new(MemorySource::new(b"RIFF....WAVEfmt \n".to_vec()));
        assert!(matches!(pipeline.preroll(), Err(PipelineError::Format(_))));
    }

    #[test]
    fn test_rejects_frame_size_beyond_u64() {
        let mut header = b"YUV4MPEG2 W4294967295 H4294967295 F25:1 C420jpeg\nFRAME\n".to_vec();
        header.extend_from_slice(&[0u8; 64]);

        let mut pipeline = Y4mPipeline::new(MemorySource::new(header));
        match pipeline.preroll() {
            Err(PipelineError::Format(message)) => assert!(message.contains("overflows")),
            other => panic!("expected a format error, got {:?}", other),
        }
    }

    #[test]
    fn test_poll_does_not_wait_for_frame_bytes() {
        let source = MemorySource::new(clip(2, 2, 3, "10:1", "C420"));
        let held = source.hold();
        let mut pipeline = Y4mPipeline::new(source);
        pipeline.preroll().unwrap();

        held.store(true, Ordering::SeqCst);
        assert!(pipeline.poll().is_none());
        assert!(pipeline.poll().is_none());

        held.store(false, Ordering::SeqCst);
        assert_eq!(expect_sample(pipeline.poll()).pts_ns, 0);
        assert!(matches!(pipeline.poll(), Some(PipelineEvent::Prerolled)));
    }

    #[test]
    fn test_bytes_for_a_superseded_seek_are_dropped() {
        let source = MemorySource::new(clip(2, 2, 4, "10:1", "C420"));
        let held = source.hold();
        let mut pipeline = Y4mPipeline::new(source);
        pipeline.preroll().unwrap();

        // Frame 0 is requested, then a seek asks for frame 2 instead
        held.store(true, Ordering::SeqCst);
        assert!(pipeline.poll().is_none());
        pipeline.seek(200_000_000);
        assert!(pipeline.poll().is_none());

        held.store(false, Ordering::SeqCst);
        let sample = expect_sample(pipeline.poll());
        assert_eq!(sample.pts_ns, 200_000_000);

        let mut luma = [0u8; 1];
        File::from(sample.buffer).read_exact_at(&mut luma, 0).unwrap();
        assert_eq!(luma[0], 2);
    }

    #[test]
    fn test_partial_trailing_frame_is_not_counted() {
        let mut bytes = clip(2, 2, 2, "10:1", "C420");
        // Second frame loses its last chroma byte; only one frame counts
        bytes.pop();

        let mut pipeline = Y4mPipeline::new(MemorySource::new(bytes));
        let info = pipeline.preroll().unwrap();
        assert_eq!(info.duration_ns, Some(100_000_000));
    }
}
