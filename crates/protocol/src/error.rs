use std::io;

use thiserror::Error;

/// Errors raised while encoding, decoding or transporting protocol records.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A record shorter than [`crate::Command::SIZE`]; there is no framing
    /// recovery, so the session is lost.
    #[error("truncated command record: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    /// An opcode this build does not know. Receivers skip these.
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u32),

    /// A `NewFrame` arrived without its buffer descriptor.
    #[error("frame message carried no buffer handle")]
    MissingHandle,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// True for a non-blocking receive that found nothing to read.
    pub fn is_would_block(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    /// True for a receive that ran into its read timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut
        )
    }
}
