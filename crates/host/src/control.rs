//! Host end of the control channel

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use mb_protocol::{fdpass, Command, Opcode, ProtocolError};
use tracing::{debug, trace, warn};

use crate::{PlayerError, Result};

/// How often a blocking wait wakes up to check on the decoder process.
pub(crate) const POLL_SLICE: Duration = Duration::from_millis(50);

/// A zero socket timeout means "forever" to the kernel.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

pub(crate) type Message = (Command, Option<OwnedFd>);

/// Bound datagram endpoint, connected to the decoder once it registers.
#[derive(Debug)]
pub(crate) struct ControlChannel {
    socket: UnixDatagram,
    peer: Option<PathBuf>,
}

impl ControlChannel {
    pub fn bind(path: &Path) -> io::Result<Self> {
        let socket = UnixDatagram::bind(path)?;
        debug!("Control endpoint bound at {}", path.display());
        Ok(Self { socket, peer: None })
    }

    /// Block until the decoder's first datagram arrives, then connect to its sender.
    ///
    /// `check_alive` runs between wait slices so a decoder that dies before
    /// registering fails the handshake instead of running out the timeout.
    pub fn handshake<F>(&mut self, timeout: Duration, mut check_alive: F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; Command::SIZE];

        self.socket.set_nonblocking(false)?;
        let (len, addr) = loop {
            check_alive()?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PlayerError::HandshakeTimeout(timeout));
            }
            self.socket.set_read_timeout(Some(remaining.min(POLL_SLICE)))?;

            match self.socket.recv_from(&mut buf) {
                Ok(received) => break received,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        };

        match Command::from_bytes(&buf[..len]) {
            Ok(cmd) if cmd.opcode == Opcode::Hello => {}
            Ok(cmd) => warn!("Decoder registered with {:?} instead of Hello", cmd.opcode),
            Err(e) => warn!("Decoder registered with an unreadable datagram: {}", e),
        }

        let peer = addr
            .as_pathname()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "decoder registered from an unnamed socket",
                )
            })?;
        self.socket.connect(&peer)?;
        self.socket.set_read_timeout(None)?;
        self.socket.set_nonblocking(true)?;

        self.peer = Some(peer);
        Ok(())
    }

    /// The decoder's endpoint, once registered.
    pub fn peer(&self) -> Option<&Path> {
        self.peer.as_deref()
    }

    /// Send without waiting. A full peer queue shows up as `WouldBlock`.
    pub fn send(&self, command: &Command) -> io::Result<()> {
        trace!(opcode = ?command.opcode, arg0 = command.arg0, "-> decoder");
        fdpass::send_command(&self.socket, command, None::<BorrowedFd<'_>>)
    }

    /// Send in blocking mode, for the state-changing commands.
    ///
    /// Gives up with `WouldBlock` once `timeout` passes with the decoder's
    /// queue still full.
    pub fn send_blocking(&self, command: &Command, timeout: Duration) -> io::Result<()> {
        let _guard = BlockingGuard::new(&self.socket, None, Some(timeout.max(MIN_TIMEOUT)))?;
        debug!(opcode = ?command.opcode, arg0 = command.arg0, "-> decoder");
        fdpass::send_command(&self.socket, command, None::<BorrowedFd<'_>>)
    }

    /// Next queued message, or `None` when nothing is pending.
    pub fn try_recv(&self) -> std::result::Result<Option<Message>, ProtocolError> {
        match fdpass::recv_command(&self.socket) {
            Ok(message) => Ok(Some(message)),
            Err(e) if e.is_would_block() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Wait up to `timeout` for the next message.
    #[cfg(test)]
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<Option<Message>, ProtocolError> {
        let _guard = BlockingGuard::new(&self.socket, Some(timeout.max(MIN_TIMEOUT)), None)?;

        match fdpass::recv_command(&self.socket) {
            Ok(message) => Ok(Some(message)),
            Err(e) if e.is_timeout() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Switches the socket to blocking mode and back to non-blocking on drop.
struct BlockingGuard<'a> {
    socket: &'a UnixDatagram,
}

impl<'a> BlockingGuard<'a> {
    fn new(
        socket: &'a UnixDatagram,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        socket.set_read_timeout(read_timeout)?;
        socket.set_write_timeout(write_timeout)?;
        socket.set_nonblocking(false)?;
        Ok(Self { socket })
    }
}

impl Drop for BlockingGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.socket.set_nonblocking(true) {
            warn!("Failed to restore non-blocking control socket: {}", e);
        }
        let _ = self.socket.set_read_timeout(None);
        let _ = self.socket.set_write_timeout(None);
    }
}
