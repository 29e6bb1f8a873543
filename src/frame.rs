//! Binary frame envelope and the window-update frame
//!
//! Every frame carries a fixed 9-byte preamble in front of its payload:
//!
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+-------------------------------+
//! |R|                 Stream Identifier (31)                      |
//! +=+=============================================================+
//! |                   Frame Payload (0...)                      ...
//! +---------------------------------------------------------------+
//! ```
//!
//! [`Frame`] is a typed view over a raw buffer. Incoming frames wrap the
//! bytes read off the wire without copying; outgoing frames own a freshly
//! zeroed [`BytesMut`] and are mutated in place until sent. Concrete frame
//! variants such as [`WindowUpdateFrame`] are thin wrappers that interpret
//! the payload of an envelope.

use std::fmt;
use std::ops::Deref;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::{FRAME_PREAMBLE_SIZE, MAX_PAYLOAD_LENGTH};

const LENGTH_OFFSET: usize = 0;
const TYPE_OFFSET: usize = 3;
const FLAGS_OFFSET: usize = 4;
const STREAM_ID_OFFSET: usize = 5;

/// Mask for 31-bit fields whose most-significant bit is reserved
pub const U31_MASK: u32 = 0x7FFF_FFFF;

/// Payload size of a window-update frame
pub const WINDOW_UPDATE_PAYLOAD_SIZE: usize = 4;

/// Frame type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    /// Parse a frame type from its wire code
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::GoAway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }
}

/// Frame flags
pub mod flags {
    /// DATA/HEADERS: last frame of the stream
    pub const END_STREAM: u8 = 0x1;
    /// SETTINGS/PING: acknowledgment
    pub const ACK: u8 = 0x1;
    /// HEADERS: last header block
    pub const END_HEADERS: u8 = 0x4;
    /// DATA/HEADERS: padding present
    pub const PADDED: u8 = 0x8;
    /// HEADERS: priority information present
    pub const PRIORITY: u8 = 0x20;
}

/// Stream identifier (31 bits, high bit reserved)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamId(u32);

impl StreamId {
    /// Connection-level stream
    pub const CONNECTION: StreamId = StreamId(0);

    /// Create a stream id, dropping the reserved bit
    #[inline]
    pub fn new(id: u32) -> Self {
        StreamId(id & U31_MASK)
    }

    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_connection_level(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        StreamId::new(id)
    }
}

#[inline]
pub(crate) fn get_u24_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([0, buf[offset], buf[offset + 1], buf[offset + 2]])
}

#[inline]
pub(crate) fn set_u24_at(buf: &mut [u8], offset: usize, value: u32) {
    let bytes = value.to_be_bytes();
    buf[offset..offset + 3].copy_from_slice(&bytes[1..]);
}

/// Read a big-endian 31-bit value, ignoring the reserved bit
#[inline]
pub(crate) fn get_u31_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]) & U31_MASK
}

/// Write a big-endian 31-bit value with the reserved bit cleared
#[inline]
pub(crate) fn set_u31_at(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&(value & U31_MASK).to_be_bytes());
}

/// A frame envelope over a raw byte buffer
///
/// The preamble fields are always read from and written to the buffer
/// itself, so `length` can never drift from the payload actually encoded.
#[derive(Clone)]
pub struct Frame<B = BytesMut> {
    buf: B,
}

impl<B: AsRef<[u8]>> Frame<B> {
    /// Wrap bytes read off the wire without copying
    ///
    /// The buffer may be longer than the frame; anything past
    /// `preamble + length` is ignored.
    pub fn from_wire(buf: B) -> Result<Self> {
        let bytes = buf.as_ref();
        if bytes.len() < FRAME_PREAMBLE_SIZE {
            return Err(Error::InvalidFrame("buffer shorter than frame preamble"));
        }

        let length = get_u24_at(bytes, LENGTH_OFFSET) as usize;
        if bytes.len() - FRAME_PREAMBLE_SIZE < length {
            return Err(Error::InvalidFrame("buffer shorter than payload length"));
        }

        Ok(Self { buf })
    }

    /// Payload length from the preamble (24 bits)
    #[inline]
    pub fn length(&self) -> u32 {
        get_u24_at(self.buf.as_ref(), LENGTH_OFFSET)
    }

    /// Raw type byte, including codes this crate does not know
    #[inline]
    pub fn raw_type(&self) -> u8 {
        self.buf.as_ref()[TYPE_OFFSET]
    }

    #[inline]
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.raw_type())
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.buf.as_ref()[FLAGS_OFFSET]
    }

    #[inline]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags() & flag != 0
    }

    /// Stream identifier with the reserved bit ignored
    #[inline]
    pub fn stream_id(&self) -> StreamId {
        StreamId(get_u31_at(self.buf.as_ref(), STREAM_ID_OFFSET))
    }

    /// Size of preamble plus payload
    #[inline]
    pub fn encoded_len(&self) -> usize {
        FRAME_PREAMBLE_SIZE + self.length() as usize
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf.as_ref()[FRAME_PREAMBLE_SIZE..self.encoded_len()]
    }

    /// The encoded frame, ready to hand to a transport
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf.as_ref()[..self.encoded_len()]
    }

    pub fn into_inner(self) -> B {
        self.buf
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Frame<B> {
    #[inline]
    pub fn set_frame_type(&mut self, frame_type: FrameType) {
        self.buf.as_mut()[TYPE_OFFSET] = frame_type as u8;
    }

    #[inline]
    pub fn set_flags(&mut self, flags: u8) {
        self.buf.as_mut()[FLAGS_OFFSET] = flags;
    }

    /// Set the stream identifier; the reserved bit is always written as zero
    #[inline]
    pub fn set_stream_id(&mut self, stream_id: u32) {
        set_u31_at(self.buf.as_mut(), STREAM_ID_OFFSET, stream_id);
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = self.encoded_len();
        &mut self.buf.as_mut()[FRAME_PREAMBLE_SIZE..end]
    }
}

impl Frame<BytesMut> {
    /// Allocate a zeroed outgoing frame with room for `payload_size` bytes
    pub fn new_outgoing(
        stream_id: u32,
        frame_type: FrameType,
        payload_size: usize,
    ) -> Result<Self> {
        if payload_size > MAX_PAYLOAD_LENGTH {
            return Err(Error::InvalidFrame("payload exceeds 24-bit length"));
        }
        Ok(Self::alloc(StreamId::new(stream_id), frame_type, payload_size))
    }

    fn alloc(stream_id: StreamId, frame_type: FrameType, payload_size: usize) -> Self {
        debug_assert!(payload_size <= MAX_PAYLOAD_LENGTH);

        let mut buf = BytesMut::zeroed(FRAME_PREAMBLE_SIZE + payload_size);
        set_u24_at(&mut buf, LENGTH_OFFSET, payload_size as u32);
        buf[TYPE_OFFSET] = frame_type as u8;
        set_u31_at(&mut buf, STREAM_ID_OFFSET, stream_id.value());
        Self { buf }
    }

    /// Convert into an immutable, cheaply cloneable frame
    pub fn freeze(self) -> Frame<Bytes> {
        Frame {
            buf: self.buf.freeze(),
        }
    }
}

impl<B: AsRef<[u8]>> fmt::Debug for Frame<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("length", &self.length())
            .field("frame_type", &self.raw_type())
            .field("flags", &self.flags())
            .field("stream_id", &self.stream_id().value())
            .finish()
    }
}

/// WINDOW_UPDATE frame (type=0x8)
///
/// The payload is a single big-endian 31-bit flow-control delta; the top
/// bit is reserved and never observable through [`delta`](Self::delta).
#[derive(Clone)]
pub struct WindowUpdateFrame<B = BytesMut> {
    frame: Frame<B>,
}

impl WindowUpdateFrame<BytesMut> {
    /// Build an outgoing window update
    ///
    /// Deltas wider than 31 bits are truncated by masking, matching the
    /// wire format where the reserved bit is not part of the value.
    pub fn new(stream_id: u32, delta: u32) -> Self {
        let mut frame = Frame::alloc(
            StreamId::new(stream_id),
            FrameType::WindowUpdate,
            WINDOW_UPDATE_PAYLOAD_SIZE,
        );
        set_u31_at(frame.payload_mut(), 0, delta);
        Self { frame }
    }

    pub fn freeze(self) -> WindowUpdateFrame<Bytes> {
        WindowUpdateFrame {
            frame: self.frame.freeze(),
        }
    }
}

impl<B: AsRef<[u8]>> WindowUpdateFrame<B> {
    /// Interpret an incoming envelope as a window update
    pub fn from_frame(frame: Frame<B>) -> Result<Self> {
        if frame.frame_type() != Some(FrameType::WindowUpdate) {
            return Err(Error::InvalidFrame("not a WINDOW_UPDATE frame"));
        }
        if frame.length() as usize != WINDOW_UPDATE_PAYLOAD_SIZE {
            return Err(Error::InvalidFrame("WINDOW_UPDATE payload must be 4 bytes"));
        }
        Ok(Self { frame })
    }

    /// Flow-control delta (31 bits)
    #[inline]
    pub fn delta(&self) -> u32 {
        get_u31_at(self.frame.payload(), 0)
    }

    pub fn into_frame(self) -> Frame<B> {
        self.frame
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> WindowUpdateFrame<B> {
    #[inline]
    pub fn set_delta(&mut self, delta: u32) {
        set_u31_at(self.frame.payload_mut(), 0, delta);
    }
}

impl<B> Deref for WindowUpdateFrame<B> {
    type Target = Frame<B>;

    fn deref(&self) -> &Frame<B> {
        &self.frame
    }
}

impl<B: AsRef<[u8]>> fmt::Debug for WindowUpdateFrame<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowUpdateFrame")
            .field("stream_id", &self.stream_id().value())
            .field("delta", &self.delta())
            .finish()
    }
}
