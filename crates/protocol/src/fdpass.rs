//! Control-channel send/receive with an optional attached descriptor.
//!
//! `NewFrame` datagrams carry the frame's buffer handle as `SCM_RIGHTS`
//! ancillary data. The kernel installs a fresh descriptor in the receiving
//! process, so the sender keeps its own reference and the receiver gets an
//! independent one that it owns from the moment `recv_command` returns.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::ptr;

use tracing::warn;

use crate::{Command, ProtocolError};

/// Ancillary buffer, u64-backed so the cmsghdr inside is suitably aligned.
/// Room for several descriptors so a misbehaving peer cannot make us drop
/// (and leak) the surplus ones through `MSG_CTRUNC`.
type ControlBuf = [u64; 8];

const FD_SIZE: u32 = mem::size_of::<RawFd>() as u32;

/// Send one command, attaching `handle` if given.
///
/// The caller keeps ownership of `handle`; the peer receives a duplicate.
pub fn send_command(
    socket: &UnixDatagram,
    command: &Command,
    handle: Option<BorrowedFd<'_>>,
) -> io::Result<()> {
    let bytes = command.to_bytes();
    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };
    let mut control: ControlBuf = [0; 8];

    // SAFETY: msghdr is plain data; zeroed is a valid "no name, no control" header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = handle {
        // SAFETY: CMSG_* only compute offsets; the header written below lies
        // within `control`, which outlives the sendmsg call.
        unsafe {
            let space = libc::CMSG_SPACE(FD_SIZE) as usize;
            debug_assert!(space <= mem::size_of::<ControlBuf>());
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = space as _;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(FD_SIZE) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd.as_raw_fd());
        }
    }

    loop {
        // SAFETY: msg points at live iov/control buffers for the duration of the call.
        let sent = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, 0) };
        if sent >= 0 {
            if sent as usize != Command::SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short datagram: {} of {} bytes", sent, Command::SIZE),
                ));
            }
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Receive one command and the descriptor attached to it, if any.
///
/// Honors the socket's blocking mode and read timeout: with nothing queued a
/// non-blocking socket yields an `Io` error of kind `WouldBlock`. Any
/// descriptors that arrive are owned by the returned value (or closed when an
/// error is returned), so nothing leaks on a malformed message.
pub fn recv_command(socket: &UnixDatagram) -> Result<(Command, Option<OwnedFd>), ProtocolError> {
    let mut bytes = [0u8; Command::SIZE];
    let mut iov = libc::iovec {
        iov_base: bytes.as_mut_ptr().cast(),
        iov_len: bytes.len(),
    };
    let mut control: ControlBuf = [0; 8];

    // SAFETY: see send_command.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of::<ControlBuf>() as _;

    #[cfg(target_os = "linux")]
    let flags = libc::MSG_CMSG_CLOEXEC;
    #[cfg(not(target_os = "linux"))]
    let flags = 0;

    let received = loop {
        // SAFETY: msg points at live buffers sized as declared above.
        let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, flags) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(ProtocolError::Io(err));
        }
    };

    // SAFETY: the kernel filled `control` with well-formed cmsg headers up to
    // msg_controllen; every SCM_RIGHTS descriptor is ours and is wrapped
    // exactly once.
    let mut handles = unsafe { take_descriptors(&msg) };

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        warn!("Control message truncated; some descriptors were dropped by the kernel");
    }

    let command = Command::from_bytes(&bytes[..received.min(Command::SIZE)])?;

    if handles.len() > 1 {
        warn!(
            "Received {} descriptors with {:?}, keeping the first",
            handles.len(),
            command.opcode
        );
        handles.truncate(1);
    }

    Ok((command, handles.pop()))
}

unsafe fn take_descriptors(msg: &libc::msghdr) -> Vec<OwnedFd> {
    let mut handles = Vec::new();
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);

    while !cmsg.is_null() {
        if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
            let data = libc::CMSG_DATA(cmsg);
            let header = data as usize - cmsg as usize;
            let payload = ((*cmsg).cmsg_len as usize).saturating_sub(header);
            for i in 0..payload / FD_SIZE as usize {
                let fd = ptr::read_unaligned(data.cast::<RawFd>().add(i));
                if fd >= 0 {
                    handles.push(OwnedFd::from_raw_fd(fd));
                }
            }
        }
        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }

    handles
}
