//! Wire protocol shared by the media bridge host and its decoder process.
//!
//! Every message on both channels is the same 24-byte [`Command`] record.
//! The control channel is a pair of Unix datagram sockets; `NewFrame`
//! datagrams carry the frame's buffer descriptor as `SCM_RIGHTS` ancillary
//! data (see [`fdpass`]). The data channel is a Unix stream socket on which
//! the decoder writes `Play{size}` / `Seek{offset}` records and the host
//! answers read requests with raw stream bytes.

mod command;
mod error;
pub mod fdpass;
mod namespace;
pub mod stream;

pub use command::{pack_dimensions, unpack_dimensions, Command, Opcode};
pub use error::ProtocolError;
pub use namespace::NamespaceLayout;
