//! Host side of the media bridge.
//!
//! Each opened media item gets its own decoder process. The host serves the
//! media bytes over the data channel, receives decoded frames as buffer
//! descriptors over the control channel and hands them to a
//! [`FrameImporter`] once per render tick.
//!
//! ```no_run
//! use mb_host::{FrameImport, FrameImporter, MediaPlayer, PlayerConfig};
//!
//! struct Gpu;
//!
//! impl FrameImporter for Gpu {
//!     fn draw_frame(&mut self, _frame: &FrameImport<'_>) {}
//!     fn draw_fallback(&mut self) {}
//! }
//!
//! # fn main() -> mb_host::Result<()> {
//! let file = std::fs::File::open("clip.y4m")?;
//! let mut player = MediaPlayer::open(PlayerConfig::default(), file, ())?;
//! player.play()?;
//!
//! loop {
//!     player.update()?;
//!     if player.has_new_frame() {
//!         player.render(&mut Gpu);
//!     }
//! #   break;
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod control;
mod data;
mod error;
mod frame;
mod namespace;
mod player;
mod process;
mod source;

pub use config::{PlayerConfig, DECODER_PATH_ENV};
pub use error::{PlayerError, Result};
pub use frame::{FrameImport, FrameImporter, Nv12Layout};
pub use player::{MediaPlayer, SessionState};
pub use source::{MediaSource, PlayerEvents};
