//! Endpoint names inside a session's private directory

use std::path::{Path, PathBuf};

const HOST_CONTROL: &str = "host.sock";
const DECODER_CONTROL: &str = "decoder.sock";
const DATA: &str = "data.sock";

/// Where each endpoint of one session lives.
///
/// Both processes derive the same paths from the directory the host passes
/// on the decoder's command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceLayout {
    dir: PathBuf,
}

impl NamespaceLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Datagram socket the host binds and receives events on.
    pub fn host_control(&self) -> PathBuf {
        self.dir.join(HOST_CONTROL)
    }

    /// Datagram socket the decoder binds and receives commands on.
    pub fn decoder_control(&self) -> PathBuf {
        self.dir.join(DECODER_CONTROL)
    }

    /// Stream socket the host listens on for data-channel connections.
    pub fn data(&self) -> PathBuf {
        self.dir.join(DATA)
    }

    /// Every socket path, in creation order.
    pub fn endpoints(&self) -> [PathBuf; 3] {
        [self.host_control(), self.data(), self.decoder_control()]
    }
}
