//! Private per-session directory holding the IPC endpoints

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use mb_protocol::NamespaceLayout;
use tracing::{debug, warn};

/// A freshly created, owner-only directory for one session's sockets.
///
/// Removed (with every endpoint inside) by [`Namespace::cleanup`] or on drop.
#[derive(Debug)]
pub struct Namespace {
    layout: NamespaceLayout,
    removed: bool,
}

impl Namespace {
    /// Create `<root>/mb-<uuid>` with mode 0700.
    pub fn create(root: &Path) -> io::Result<Self> {
        let dir = root.join(format!("mb-{}", uuid::Uuid::new_v4().simple()));

        fs::DirBuilder::new().mode(0o700).create(&dir)?;
        debug!("Created session namespace {}", dir.display());

        Ok(Self {
            layout: NamespaceLayout::new(dir),
            removed: false,
        })
    }

    pub fn layout(&self) -> &NamespaceLayout {
        &self.layout
    }

    pub fn dir(&self) -> &Path {
        self.layout.dir()
    }

    /// Unlink every endpoint and remove the directory. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;

        for endpoint in self.layout.endpoints() {
            remove_quietly(&endpoint);
        }

        // Anything else the decoder may have left behind goes too
        if let Err(e) = fs::remove_dir_all(self.layout.dir()) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove session namespace {}: {}",
                    self.layout.dir().display(),
                    e
                );
            }
        } else {
            debug!("Removed session namespace {}", self.layout.dir().display());
        }
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to unlink {}: {}", path.display(), e),
    }
}
