//! Collaborators supplied by the embedding application

use std::io::{self, Read, Seek, SeekFrom};

use crate::PlayerError;

/// The original media bytes, served to the decoder over the data channel.
///
/// Called only from the data worker thread. A read error is logged and
/// treated as end of stream.
pub trait MediaSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> MediaSource for T {}

/// Total length of `source`, leaving it positioned at the start.
pub(crate) fn stream_len(source: &mut dyn MediaSource) -> io::Result<u64> {
    let len = source.seek(SeekFrom::End(0))?;
    source.seek(SeekFrom::Start(0))?;
    Ok(len)
}

/// Lifecycle notifications, invoked synchronously on the thread that calls
/// [`crate::MediaPlayer::update`] (or `open`, for setup failures).
pub trait PlayerEvents {
    fn media_opened(&mut self) {}

    fn media_ended(&mut self) {}

    /// Reported at most once per session.
    fn media_failed(&mut self, _error: &PlayerError) {}
}

/// No callbacks.
impl PlayerEvents for () {}
