//! Decode pipeline seam
//!
//! The control loop drives a [`Pipeline`] without knowing how it decodes:
//! it prerolls once, forwards play/pause/seek/volume and pumps
//! [`Pipeline::poll`] every iteration for produced samples and state changes.

mod buffer;
mod y4m;

use std::os::fd::OwnedFd;

use thiserror::Error;

use buffer::SharedBuffer;

pub use y4m::Y4mPipeline;

/// What preroll learned about the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaInfo {
    /// `None` when the length cannot be determined.
    pub duration_ns: Option<u64>,
    pub width: u32,
    pub height: u32,
}

/// One decoded frame, backed by a buffer the host can import.
#[derive(Debug)]
pub struct Sample {
    pub pts_ns: u64,
    pub width: u32,
    pub height: u32,
    pub buffer: OwnedFd,
}

#[derive(Debug)]
pub enum PipelineEvent {
    Sample(Sample),
    /// A seek or the initial preroll has produced its first sample.
    Prerolled,
    EndOfStream,
    Error(PipelineError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stream I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed stream: {0}")]
    Format(String),

    #[error("unsupported stream: {0}")]
    Unsupported(String),
}

/// A decoder the control loop can drive.
pub trait Pipeline {
    /// Read enough of the stream to know its shape, and queue the first sample.
    fn preroll(&mut self) -> Result<MediaInfo, PipelineError>;

    fn play(&mut self);

    fn pause(&mut self);

    /// Flushing, accurate seek. The sample at `position_ns` is produced even
    /// while paused.
    fn seek(&mut self, position_ns: u64);

    fn set_volume(&mut self, volume: f64);

    /// Next event, or `None` when nothing is due yet. Never waits on the
    /// data channel.
    fn poll(&mut self) -> Option<PipelineEvent>;
}
