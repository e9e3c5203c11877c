//! Frame - The wire delimitation unit
//!
//! Layout (big-endian):
//!
//! ```text
//! byte 0:          head marker (0x55)
//! bytes 1-2:       type tag
//! bytes 3-4:       payload length L (L <= 60000)
//! bytes 5..5+L-1:  payload
//! byte 5+L:        tail marker (0xAA)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Marker byte opening every frame
pub const FRAME_HEAD: u8 = 0x55;

/// Marker byte closing every frame
pub const FRAME_TAIL: u8 = 0xAA;

/// Maximum payload carried by one frame
pub const MAX_PAYLOAD_SIZE: usize = 60000;

/// Head marker, tag and length
pub const HEADER_SIZE: usize = 5;

/// Bytes a frame adds around its payload
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + 1;

/// Framing errors
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Invalid head marker: 0x{0:02x}")]
    InvalidHead(u8),

    #[error("Invalid tail marker: 0x{0:02x}")]
    InvalidTail(u8),

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Stream ended inside a frame")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single frame on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Type tag identifying the message kind
    pub tag: u16,

    /// Payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame, rejecting payloads over the size limit
    pub fn new(tag: u16, payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        let payload = payload.into();
        check_size(payload.len())?;
        Ok(Self { tag, payload })
    }

    /// Payload length as written in the header
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serialize to one contiguous buffer of `len + 6` bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        check_size(self.payload.len())?;

        let mut buf = BytesMut::with_capacity(self.payload.len() + FRAME_OVERHEAD);
        buf.put_u8(FRAME_HEAD);
        buf.put_u16(self.tag);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.put_u8(FRAME_TAIL);
        Ok(buf.freeze())
    }
}

fn check_size(size: usize) -> Result<(), FrameError> {
    if size > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::Truncated
    } else {
        FrameError::Io(e)
    }
}

/// Read exactly one frame from the stream.
///
/// Never retries and never reads past the tail marker of the frame it returns.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await.map_err(map_eof)?;

    if header[0] != FRAME_HEAD {
        return Err(FrameError::InvalidHead(header[0]));
    }

    let tag = u16::from_be_bytes([header[1], header[2]]);
    let length = u16::from_be_bytes([header[3], header[4]]) as usize;
    check_size(length)?;

    // payload and tail marker in one read
    let mut body = vec![0u8; length + 1];
    reader.read_exact(&mut body).await.map_err(map_eof)?;

    let tail = body[length];
    if tail != FRAME_TAIL {
        return Err(FrameError::InvalidTail(tail));
    }
    body.truncate(length);

    trace!("Read frame: tag {} ({} bytes)", tag, length);

    Ok(Frame {
        tag,
        payload: Bytes::from(body),
    })
}

/// Write one frame as a single contiguous write
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let encoded = frame.encode()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;

    trace!("Wrote frame: tag {} ({} bytes)", frame.tag, frame.len());

    Ok(())
}
