//! Host-side frame receipt and the render/import seam

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

/// Plane placement of an NV12 buffer as the decoder writes it.
///
/// The luma plane starts at offset 0 with one byte per pixel; the interleaved
/// chroma plane follows it directly, one `U,V` pair per 2x2 block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nv12Layout {
    pub luma_offset: u64,
    pub luma_pitch: u32,
    pub chroma_offset: u64,
    pub chroma_pitch: u32,
}

impl Nv12Layout {
    pub fn for_size(width: u32, height: u32) -> Self {
        Self {
            luma_offset: 0,
            luma_pitch: width,
            chroma_offset: width as u64 * height as u64,
            chroma_pitch: width.div_ceil(2) * 2,
        }
    }

    /// Total bytes covered by both planes.
    pub fn len(&self, height: u32) -> u64 {
        self.chroma_offset + self.chroma_pitch as u64 * height.div_ceil(2) as u64
    }
}

/// Everything a GPU import needs for one draw.
///
/// The descriptor is only borrowed: it stays valid for the duration of
/// [`FrameImporter::draw_frame`] and is closed by the player right after.
#[derive(Debug)]
pub struct FrameImport<'a> {
    pub fd: BorrowedFd<'a>,
    pub pts: Duration,
    pub width: u32,
    pub height: u32,
    pub layout: Nv12Layout,
}

/// Turns a received buffer into pixels on screen, once per render tick.
///
/// Implementations wrap the GPU import (EGL dma-buf images, Vulkan external
/// memory, a CPU mapping in tests). Any resource created from the descriptor
/// must not outlive the call.
pub trait FrameImporter {
    fn draw_frame(&mut self, frame: &FrameImport<'_>);

    /// Nothing to show: draw a flat fill instead.
    fn draw_fallback(&mut self);
}

/// The most recently received frame handle and its bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct CurrentFrame {
    handle: Option<OwnedFd>,
    pts: Option<u64>,
    last_rendered: Option<u64>,
    width: u32,
    height: u32,
}

/// A frame taken out of [`CurrentFrame`] for a single draw.
#[derive(Debug)]
pub(crate) struct PendingFrame {
    pub handle: OwnedFd,
    pub pts: u64,
    pub width: u32,
    pub height: u32,
}

impl PendingFrame {
    pub fn import(&self) -> FrameImport<'_> {
        FrameImport {
            fd: self.handle.as_fd(),
            pts: Duration::from_nanos(self.pts),
            width: self.width,
            height: self.height,
            layout: Nv12Layout::for_size(self.width, self.height),
        }
    }
}

impl CurrentFrame {
    /// Replace the held handle. The previous one, if never rendered, is closed here.
    pub fn receive(&mut self, handle: OwnedFd, pts: u64, width: u32, height: u32) {
        self.handle = Some(handle);
        self.pts = Some(pts);
        self.width = width;
        self.height = height;
    }

    pub fn has_new(&self) -> bool {
        self.handle.is_some() && self.pts != self.last_rendered
    }

    /// Hand out the held frame for one draw and mark it rendered.
    pub fn take_for_render(&mut self) -> Option<PendingFrame> {
        let handle = self.handle.take()?;
        let pts = self.pts?;
        self.last_rendered = Some(pts);

        Some(PendingFrame {
            handle,
            pts,
            width: self.width,
            height: self.height,
        })
    }

    /// Forget everything, closing any held handle.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
