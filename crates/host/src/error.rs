use std::io;
use std::path::PathBuf;

use mb_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by a [`crate::MediaPlayer`] session.
#[derive(Debug, Error)]
pub enum PlayerError {
    /// Namespace or endpoint creation failed; the session never started.
    #[error("session setup failed: {context}: {source}")]
    Setup {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to launch decoder {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("decoder did not register within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("decoder process exited ({0})")]
    DecoderExited(String),

    /// Malformed or unexpected traffic; the session cannot resynchronize.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("control channel error: {0}")]
    Io(#[from] io::Error),

    /// The decoder reported `MediaFailed`.
    #[error("decoder reported media failure")]
    MediaFailed,

    /// A state-changing command could not be delivered in time. The session stays usable.
    #[error("decoder did not accept {0} within {1:?}")]
    CommandTimeout(&'static str, std::time::Duration),

    /// The session was closed or has failed.
    #[error("session is closed")]
    Closed,
}

impl PlayerError {
    pub(crate) fn setup(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| PlayerError::Setup { context, source }
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
