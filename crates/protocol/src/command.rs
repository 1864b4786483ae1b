//! Fixed-size command record

use crate::ProtocolError;

/// Command opcodes
///
/// Values match the decoder's historical wire tags, so `MediaFailed` is the
/// all-ones pattern rather than the next free integer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    MediaLoaded = 0,
    MediaEnded = 1,
    NewFrame = 2,
    Play = 3,
    Pause = 4,
    Stop = 5,
    Seek = 6,
    SetVolume = 7,
    FrameAck = 8,
    /// Decoder registration on the control channel.
    Hello = 9,
    /// Decoder has dropped every frame from before a `Stop` or `Seek`.
    Flushed = 10,
    MediaFailed = 0xffff_ffff,
}

impl TryFrom<u32> for Opcode {
    type Error = ProtocolError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Opcode::MediaLoaded),
            1 => Ok(Opcode::MediaEnded),
            2 => Ok(Opcode::NewFrame),
            3 => Ok(Opcode::Play),
            4 => Ok(Opcode::Pause),
            5 => Ok(Opcode::Stop),
            6 => Ok(Opcode::Seek),
            7 => Ok(Opcode::SetVolume),
            8 => Ok(Opcode::FrameAck),
            9 => Ok(Opcode::Hello),
            10 => Ok(Opcode::Flushed),
            0xffff_ffff => Ok(Opcode::MediaFailed),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Pack a frame size into one operand: width in the high 32 bits, height in the low.
pub fn pack_dimensions(width: u32, height: u32) -> u64 {
    ((width as u64) << 32) | height as u64
}

/// Inverse of [`pack_dimensions`].
pub fn unpack_dimensions(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, (packed & 0xffff_ffff) as u32)
}

/// One protocol message (24 bytes on the wire)
///
/// The same record travels on the control channel (commands and lifecycle
/// events) and on the data channel (`Play{size}` read requests and
/// `Seek{offset}` repositioning).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub arg0: u64,
    pub arg1: u64,
}

impl Command {
    pub const SIZE: usize = 24;

    pub fn new(opcode: Opcode, arg0: u64, arg1: u64) -> Self {
        Self { opcode, arg0, arg1 }
    }

    pub fn bare(opcode: Opcode) -> Self {
        Self::new(opcode, 0, 0)
    }

    pub fn hello() -> Self {
        Self::bare(Opcode::Hello)
    }

    pub fn media_loaded(duration_ns: u64, width: u32, height: u32) -> Self {
        Self::new(Opcode::MediaLoaded, duration_ns, pack_dimensions(width, height))
    }

    pub fn media_failed() -> Self {
        Self::bare(Opcode::MediaFailed)
    }

    pub fn media_ended() -> Self {
        Self::bare(Opcode::MediaEnded)
    }

    pub fn new_frame(pts_ns: u64, width: u32, height: u32) -> Self {
        Self::new(Opcode::NewFrame, pts_ns, pack_dimensions(width, height))
    }

    pub fn seek(position_ns: u64) -> Self {
        Self::new(Opcode::Seek, position_ns, 0)
    }

    pub fn set_volume(volume: f32) -> Self {
        Self::new(Opcode::SetVolume, volume.to_bits() as u64, 0)
    }

    pub fn frame_ack(pts_ns: u64) -> Self {
        Self::new(Opcode::FrameAck, pts_ns, 0)
    }

    /// Everything published before this was discarded; `position_ns` is the new start.
    pub fn flushed(position_ns: u64) -> Self {
        Self::new(Opcode::Flushed, position_ns, 0)
    }

    /// Data channel: the decoder needs `size` more bytes.
    pub fn read_request(size: u32) -> Self {
        Self::new(Opcode::Play, size as u64, 0)
    }

    /// Data channel: reposition the source to `offset`.
    pub fn stream_seek(offset: u64) -> Self {
        Self::new(Opcode::Seek, offset, 0)
    }

    /// Width/height carried by `NewFrame` and `MediaLoaded`.
    pub fn dimensions(&self) -> (u32, u32) {
        unpack_dimensions(self.arg1)
    }

    /// Volume carried by `SetVolume`.
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.arg0 as u32)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        // Opcode (4 bytes) + 4 bytes of zero padding keeps the operands 8-aligned
        buf[0..4].copy_from_slice(&(self.opcode as u32).to_le_bytes());
        buf[8..16].copy_from_slice(&self.arg0.to_le_bytes());
        buf[16..24].copy_from_slice(&self.arg1.to_le_bytes());

        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                expected: Self::SIZE,
                got: buf.len(),
            });
        }

        let raw = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let opcode = Opcode::try_from(raw)?;

        let mut arg0 = [0u8; 8];
        arg0.copy_from_slice(&buf[8..16]);
        let mut arg1 = [0u8; 8];
        arg1.copy_from_slice(&buf[16..24]);

        Ok(Self {
            opcode,
            arg0: u64::from_le_bytes(arg0),
            arg1: u64::from_le_bytes(arg1),
        })
    }
}
