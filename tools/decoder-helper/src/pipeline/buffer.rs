//! Shareable frame buffers backed by sealed anonymous memory files

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

const NAME: &[u8] = b"mb-frame\0";

/// An anonymous memory file holding one frame.
///
/// Once [`SharedBuffer::seal`] ran the contents can no longer change or
/// resize, so the host may map it without trusting the decoder.
#[derive(Debug)]
pub struct SharedBuffer {
    file: File,
}

impl SharedBuffer {
    pub fn create() -> io::Result<Self> {
        // SAFETY: NAME is NUL-terminated; a valid descriptor is owned by
        // exactly one File from here on.
        let file = unsafe {
            let fd = libc::memfd_create(
                NAME.as_ptr().cast(),
                libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
            );
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            File::from_raw_fd(fd)
        };

        Ok(Self { file })
    }

    /// Build and seal a buffer from `bytes` in one go.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<OwnedFd> {
        let mut buffer = Self::create()?;
        buffer.write_all(bytes)?;
        buffer.seal()
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }

    /// Forbid further writes and size changes, and hand out the descriptor.
    pub fn seal(self) -> io::Result<OwnedFd> {
        let seals =
            libc::F_SEAL_SEAL | libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE;

        // SAFETY: plain fcntl on a descriptor we own.
        let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_ADD_SEALS, seals) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(OwnedFd::from(self.file))
    }
}
