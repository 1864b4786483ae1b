//! Data-channel record helpers

use std::io::{self, Read, Write};

use crate::{Command, ProtocolError};

/// Write one command record to a byte stream.
pub fn write_command<W: Write>(stream: &mut W, command: &Command) -> io::Result<()> {
    stream.write_all(&command.to_bytes())
}

/// Read one command record from a byte stream.
///
/// Returns `Ok(None)` when the peer closed the stream on a record boundary,
/// and `Truncated` when it closed mid-record.
pub fn read_command<R: Read>(stream: &mut R) -> Result<Option<Command>, ProtocolError> {
    let mut buf = [0u8; Command::SIZE];
    let mut filled = 0;

    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    if filled == 0 {
        return Ok(None);
    }

    Command::from_bytes(&buf[..filled]).map(Some)
}
