//! Wire format for the file push protocol.
//!
//! The stream is a flat, ordered sequence of frames. Every frame starts with a
//! one-byte message type; there is no outer length prefix, so a reader has to
//! decode a frame completely before it can locate the next one. Directory
//! structure is carried by the `destination` field of each frame, not by nesting.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Strings are length-prefixed (u16 len + UTF-8).

use crate::error::{PushError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest content length the signed 32-bit length field can carry.
pub const MAX_FILE_LENGTH: u64 = i32::MAX as u64;

/// Largest string the u16 length prefix can carry.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// The CRC-32 is widened into an 8-byte field on the wire.
pub const CRC_FIELD_LEN: usize = 8;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    File = 0x01,
    Directory = 0x02,
    Stop = 0x03,
    KeepAlive = 0x04,
    FileAck = 0x05,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::File),
            0x02 => Some(Self::Directory),
            0x03 => Some(Self::Stop),
            0x04 => Some(Self::KeepAlive),
            0x05 => Some(Self::FileAck),
            _ => None,
        }
    }

    /// Control frames are a bare type byte.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Stop | Self::KeepAlive | Self::FileAck)
    }
}

// =============================================================================
// Compression
// =============================================================================

/// Only "none" is defined; the field is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    #[default]
    None = 0x00,
}

impl Compression {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::None),
            _ => None,
        }
    }
}

// =============================================================================
// Virtual paths
// =============================================================================

/// A destination path relative to the receiver's virtual root `/`.
///
/// The root itself encodes as a zero-length string. Components are joined
/// with `/` regardless of the sending platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VirtualPath(String);

impl VirtualPath {
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Parse a wire value. Leading and trailing separators are dropped, so `/`
    /// and the empty string both mean the root.
    pub fn parse(raw: &str) -> Self {
        let parts: Vec<&str> = raw.split('/').filter(|p| !p.is_empty()).collect();
        Self(parts.join("/"))
    }

    pub fn join(&self, name: &str) -> Self {
        if self.0.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{}/{}", self.0, name))
        }
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The value written on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

// =============================================================================
// Field helpers
// =============================================================================

fn put_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > MAX_STRING_LEN {
        return Err(PushError::InvalidName(format!(
            "{} bytes exceeds the {} byte string limit",
            bytes.len(),
            MAX_STRING_LEN
        )));
    }
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
    Ok(())
}

async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let len = r.read_u16().await? as usize;
    let mut raw = vec![0u8; len];
    r.read_exact(&mut raw).await?;
    String::from_utf8(raw).map_err(|_| PushError::protocol("Invalid UTF-8 in string field"))
}

/// CRC-32 (IEEE) of a complete buffer.
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

// =============================================================================
// FILE (0x01)
// =============================================================================

/// Everything in a FILE frame before the content bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub destination: VirtualPath,
    pub compression: Compression,
    pub length: u32,
}

impl FileHeader {
    pub fn new(name: impl Into<String>, destination: VirtualPath, length: u32) -> Self {
        Self {
            name: name.into(),
            destination,
            compression: Compression::None,
            length,
        }
    }

    /// Encode type byte through the length field.
    pub fn encode(&self) -> Result<Bytes> {
        let length = i32::try_from(self.length).map_err(|_| {
            PushError::protocol(format!("File length {} exceeds i32", self.length))
        })?;

        let mut buf = BytesMut::with_capacity(
            1 + 2 + self.name.len() + 2 + self.destination.as_str().len() + 1 + 4,
        );
        buf.put_u8(MessageType::File as u8);
        put_string(&mut buf, &self.name)?;
        put_string(&mut buf, self.destination.as_str())?;
        buf.put_u8(self.compression as u8);
        buf.put_i32(length);
        Ok(buf.freeze())
    }

    /// Read the header fields. The type byte must already be consumed.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let name = read_string(r).await?;
        let destination = VirtualPath::parse(&read_string(r).await?);
        let raw_compression = r.read_u8().await?;
        let compression = Compression::from_u8(raw_compression).ok_or_else(|| {
            PushError::protocol(format!("Unsupported compression: {raw_compression}"))
        })?;
        let length = r.read_i32().await?;
        let length = u32::try_from(length)
            .map_err(|_| PushError::protocol(format!("Negative file length: {length}")))?;

        Ok(Self {
            name,
            destination,
            compression,
            length,
        })
    }
}

/// A complete FILE frame held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFrame {
    pub header: FileHeader,
    pub content: Bytes,
    /// The 8-byte checksum field exactly as carried on the wire.
    pub crc: u64,
}

impl FileFrame {
    pub fn new(
        name: impl Into<String>,
        destination: VirtualPath,
        content: impl Into<Bytes>,
    ) -> Result<Self> {
        let content = content.into();
        let length = u32::try_from(content.len())
            .ok()
            .filter(|len| u64::from(*len) <= MAX_FILE_LENGTH)
            .ok_or_else(|| PushError::protocol("File content exceeds the 2 GiB limit"))?;
        Ok(Self {
            header: FileHeader::new(name, destination, length),
            crc: u64::from(checksum(&content)),
            content,
        })
    }

    pub fn checksum_matches(&self) -> bool {
        self.crc == u64::from(checksum(&self.content))
    }
}

// =============================================================================
// DIRECTORY (0x02)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryHeader {
    pub destination: VirtualPath,
    /// Informational; children follow as independent frames.
    pub child_count: u16,
}

impl DirectoryHeader {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(1 + 2 + self.destination.as_str().len() + 2);
        buf.put_u8(MessageType::Directory as u8);
        put_string(&mut buf, self.destination.as_str())?;
        buf.put_u16(self.child_count);
        Ok(buf.freeze())
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let destination = VirtualPath::parse(&read_string(r).await?);
        let child_count = r.read_u16().await?;
        Ok(Self {
            destination,
            child_count,
        })
    }
}

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    File(FileFrame),
    Directory(DirectoryHeader),
    Stop,
    KeepAlive,
    FileAck,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::File(_) => MessageType::File,
            Message::Directory(_) => MessageType::Directory,
            Message::Stop => MessageType::Stop,
            Message::KeepAlive => MessageType::KeepAlive,
            Message::FileAck => MessageType::FileAck,
        }
    }

    /// Encode the whole frame into one buffer.
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Message::File(frame) => {
                let header = frame.header.encode()?;
                let mut buf =
                    BytesMut::with_capacity(header.len() + frame.content.len() + CRC_FIELD_LEN);
                buf.put_slice(&header);
                buf.put_slice(&frame.content);
                buf.put_u64(frame.crc);
                Ok(buf.freeze())
            }
            Message::Directory(dir) => dir.encode(),
            other => Ok(Bytes::copy_from_slice(&[other.message_type() as u8])),
        }
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read the type byte that starts every frame.
pub async fn read_message_type<R: AsyncRead + Unpin>(r: &mut R) -> Result<MessageType> {
    let raw = r.read_u8().await?;
    MessageType::from_u8(raw).ok_or(PushError::UnknownMessageType(raw))
}

/// Read one complete frame, buffering FILE content in memory.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message> {
    let msg = match read_message_type(r).await? {
        MessageType::File => {
            let header = FileHeader::read(r).await?;
            let mut content = Vec::with_capacity((header.length as usize).min(64 * 1024));
            let read = (&mut *r)
                .take(u64::from(header.length))
                .read_to_end(&mut content)
                .await?;
            if read != header.length as usize {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("FILE content truncated: {} of {} bytes", read, header.length),
                )
                .into());
            }
            let crc = r.read_u64().await?;
            Message::File(FileFrame {
                header,
                content: Bytes::from(content),
                crc,
            })
        }
        MessageType::Directory => Message::Directory(DirectoryHeader::read(r).await?),
        MessageType::Stop => Message::Stop,
        MessageType::KeepAlive => Message::KeepAlive,
        MessageType::FileAck => Message::FileAck,
    };
    Ok(msg)
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    Ok(())
}

/// Write a body-less control frame.
pub async fn write_control<W: AsyncWrite + Unpin>(w: &mut W, msg_type: MessageType) -> Result<()> {
    debug_assert!(msg_type.is_control());
    w.write_u8(msg_type as u8).await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
