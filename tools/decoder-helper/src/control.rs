//! Decoder end of the control channel

use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mb_protocol::{fdpass, Command, NamespaceLayout, ProtocolError};
use tracing::{debug, info, trace, warn};

/// Outcome of one receive attempt.
#[derive(Debug)]
pub enum Incoming {
    Command(Command),
    Idle,
}

#[derive(Debug)]
pub struct DecoderControl {
    socket: UnixDatagram,
    host: PathBuf,
}

impl DecoderControl {
    /// Bind our endpoint, connect to the host's and announce ourselves.
    pub fn register(layout: &NamespaceLayout) -> io::Result<Self> {
        let own = layout.decoder_control();
        match std::fs::remove_file(&own) {
            Ok(()) => debug!("Removed stale endpoint {}", own.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let socket = UnixDatagram::bind(&own)?;
        let control = Self::connect(socket, &layout.host_control())?;
        control.send(&Command::hello(), None)?;

        info!("Registered with host at {}", control.host.display());
        Ok(control)
    }

    fn connect(socket: UnixDatagram, host: &Path) -> io::Result<Self> {
        socket.connect(host)?;
        Ok(Self {
            socket,
            host: host.to_path_buf(),
        })
    }

    /// Send `command`, attaching `handle` when given. The host receives its own
    /// duplicate; ours stays open.
    pub fn send(&self, command: &Command, handle: Option<BorrowedFd<'_>>) -> io::Result<()> {
        trace!(opcode = ?command.opcode, arg0 = command.arg0, "-> host");
        fdpass::send_command(&self.socket, command, handle)
    }

    /// Wait up to `timeout` for the next host command.
    ///
    /// Unknown opcodes and stray descriptors are dropped here.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Incoming, ProtocolError> {
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        match fdpass::recv_command(&self.socket) {
            Ok((command, handle)) => {
                if handle.is_some() {
                    warn!("Host attached a descriptor to {:?}; closing it", command.opcode);
                }
                Ok(Incoming::Command(command))
            }
            Err(ProtocolError::UnknownOpcode(op)) => {
                debug!("Ignoring unknown opcode {:#x} from host", op);
                Ok(Incoming::Idle)
            }
            Err(e) if e.is_timeout() => Ok(Incoming::Idle),
            Err(e) => Err(e),
        }
    }

    /// The host's endpoint still exists.
    pub fn host_present(&self) -> bool {
        self.host.exists()
    }
}

/// True when a send failed because nobody is listening any more.
pub fn is_host_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
impl DecoderControl {
    /// Wrap one end of a connected pair.
    pub fn from_socket(socket: UnixDatagram, host: &Path) -> Self {
        Self {
            socket,
            host: host.to_path_buf(),
        }
    }
}
