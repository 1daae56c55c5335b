//! Wire framing
//!
//! Reliable packets travel as length-prefixed frames on a stream, unreliable
//! packets as datagrams with a small fixed header. [`FrameBuilder`] and
//! [`FrameReader`] are the little-endian cursor pair used by every payload
//! encoder in the crate.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest reliable frame accepted on a stream (channel byte + compressed payload)
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// Size of the unreliable datagram header: `[channel][flags][seq u16]`
pub const DATAGRAM_HEADER_SIZE: usize = 4;

/// Errors that can occur during message framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    #[error("Truncated frame: {0} bytes")]
    Truncated(usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Read one `[len u32][bytes]` frame
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, FramingError> {
    let closed = |e: io::Error| match e.kind() {
        io::ErrorKind::UnexpectedEof => FramingError::ConnectionClosed,
        _ => FramingError::Io(e),
    };

    let len = stream.read_u32_le().await.map_err(closed)? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FramingError::MessageTooLarge(len, MAX_FRAME_SIZE));
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await.map_err(closed)?;
    Ok(frame)
}

/// Write one `[len u32][bytes]` frame and flush
pub async fn write_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
) -> Result<(), FramingError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(FramingError::MessageTooLarge(data.len(), MAX_FRAME_SIZE));
    }
    stream.write_u32_le(data.len() as u32).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one reliable packet: `[channel][payload]` inside a length-prefixed frame
///
/// Empty frames carry no packet (stream openers, keepalives) and yield `None`.
pub async fn read_packet<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<(u8, Vec<u8>)>, FramingError> {
    let mut frame = read_message(stream).await?;
    if frame.is_empty() {
        return Ok(None);
    }
    let channel = frame.remove(0);
    Ok(Some((channel, frame)))
}

/// Write one reliable packet: `[channel][payload]` inside a length-prefixed frame
pub async fn write_packet<W: AsyncWrite + Unpin>(
    stream: &mut W,
    channel: u8,
    payload: &[u8],
) -> Result<(), FramingError> {
    let frame = FrameBuilder::with_capacity(payload.len() + 1)
        .write_u8(channel)
        .write(payload)
        .build();
    write_message(stream, &frame).await
}

/// Header of an unreliable datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub channel: u8,
    /// Raw `SendFlags` bits (low byte)
    pub flags: u8,
    pub sequence: u16,
}

impl DatagramHeader {
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        FrameBuilder::with_capacity(DATAGRAM_HEADER_SIZE + payload.len())
            .write_u8(self.channel)
            .write_u8(self.flags)
            .write_u16(self.sequence)
            .write(payload)
            .build()
    }

    /// Split a datagram into header and payload
    pub fn decode(datagram: &[u8]) -> Result<(Self, &[u8]), FramingError> {
        let mut reader = FrameReader::new(datagram);
        let (Some(channel), Some(flags), Some(sequence)) =
            (reader.read_u8(), reader.read_u8(), reader.read_u16())
        else {
            return Err(FramingError::Truncated(datagram.len()));
        };
        Ok((
            Self {
                channel,
                flags,
                sequence,
            },
            reader.remaining(),
        ))
    }
}

macro_rules! le_writers {
    ($($name:ident: $ty:ty),*) => {
        $(
            pub fn $name(self, value: $ty) -> Self {
                self.write(&value.to_le_bytes())
            }
        )*
    };
}

macro_rules! le_readers {
    ($($name:ident: $ty:ty),*) => {
        $(
            pub fn $name(&mut self) -> Option<$ty> {
                const N: usize = std::mem::size_of::<$ty>();
                let bytes: [u8; N] = self.read(N)?.try_into().ok()?;
                Some(<$ty>::from_le_bytes(bytes))
            }
        )*
    };
}

/// Chained little-endian encoder
#[derive(Debug, Default)]
pub struct FrameBuilder {
    buffer: Vec<u8>,
}

impl FrameBuilder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write(mut self, data: &[u8]) -> Self {
        self.buffer.extend_from_slice(data);
        self
    }

    le_writers!(write_u8: u8, write_u16: u16, write_u32: u32, write_u64: u64, write_f32: f32);

    pub fn build(self) -> Vec<u8> {
        self.buffer
    }
}

/// Little-endian decoder; every read is `None` once the input runs short
#[derive(Debug)]
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn read(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.position.checked_add(n)?;
        let slice = self.data.get(self.position..end)?;
        self.position = end;
        Some(slice)
    }

    le_readers!(read_u8: u8, read_u16: u16, read_u32: u32, read_u64: u64, read_f32: f32);

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.position
    }
}
