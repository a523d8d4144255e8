//! Nowhile wire protocol.
//!
//! Peers exchange discrete frames over a reliable, ordered channel. Each
//! frame is a small JSON header describing the message plus, for file
//! chunks only, a raw binary payload.
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           Nowhile Frame                              │
//! ├──────────┬──────────┬────────┬──────────────────┬────────────────────┤
//! │  Magic   │ Version  │  Type  │  Header length   │  Payload length    │
//! │ 4 bytes  │ 2 bytes  │ 1 byte │  4 bytes (BE)    │  4 bytes (BE)      │
//! ├──────────┴──────────┴────────┴──────────────────┴────────────────────┤
//! │                     JSON header (camelCase)                          │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                 Binary payload (CHUNK frames only)                   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Magic: `0x4E 0x57 0x48 0x4C` ("NWHL")
//! - Version: `0x01 0x00` (1.0)
//!
//! Frames carry no sequence numbers; ordering is the channel's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::{LocalIdentity, PeerId};

/// Protocol magic bytes: "NWHL"
pub const MAGIC: [u8; 4] = [0x4E, 0x57, 0x48, 0x4C];

/// Fixed prefix size in bytes
pub const PREFIX_SIZE: usize = 15;

/// Maximum JSON header size (64 KB)
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Maximum binary payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Peer introduction
    Handshake = 0x01,
    /// File descriptor opening a transfer
    Metadata = 0x02,
    /// File bytes
    Chunk = 0x03,
    /// Transfer terminator
    End = 0x04,
    /// Chat message
    Chat = 0x05,
}

impl FrameType {
    /// Parse a frame type from a byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::Metadata),
            0x03 => Some(Self::Chunk),
            0x04 => Some(Self::End),
            0x05 => Some(Self::Chat),
            _ => None,
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshake => write!(f, "HANDSHAKE"),
            Self::Metadata => write!(f, "METADATA"),
            Self::Chunk => write!(f, "CHUNK"),
            Self::End => write!(f, "END"),
            Self::Chat => write!(f, "CHAT"),
        }
    }
}

/// Information a peer advertises about itself in a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Peer id
    pub id: PeerId,
    /// Display name
    pub name: String,
    /// Operating system
    pub os: String,
    /// Client software
    #[serde(rename = "browser")]
    pub client: String,
    /// When the sender saw the link open
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub connected_at: DateTime<Utc>,
    /// Whether the sender's transport is secure
    #[serde(default)]
    pub is_secure: bool,
}

impl PeerInfo {
    /// Describe the local endpoint.
    #[must_use]
    pub fn local(identity: &LocalIdentity, is_secure: bool) -> Self {
        Self {
            id: identity.id.clone(),
            name: identity.name.clone(),
            os: std::env::consts::OS.to_string(),
            client: format!("nowhile/{}", crate::VERSION),
            connected_at: Utc::now(),
            is_secure,
        }
    }
}

/// File description sent before any chunk of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    /// Transfer id
    pub transfer_id: Uuid,
    /// File name
    pub file_name: String,
    /// File size in bytes
    pub file_size: u64,
    /// MIME type
    pub file_type: String,
}

/// A chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message id
    pub id: Uuid,
    /// Message text
    pub text: String,
    /// When the message was written
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Display name of the author
    pub sender_name: String,
}

impl ChatMessage {
    /// Create a new message stamped with the current time.
    #[must_use]
    pub fn new(text: impl Into<String>, sender_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            timestamp: Utc::now(),
            sender_name: sender_name.into(),
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Peer introduction, sent when a link opens
    Handshake(PeerInfo),
    /// Opens a transfer
    Metadata(FileDescriptor),
    /// A slice of file bytes
    Chunk {
        /// Transfer the bytes belong to
        transfer_id: Uuid,
        /// Raw bytes
        data: Vec<u8>,
    },
    /// Closes a transfer
    End {
        /// Transfer being closed
        transfer_id: Uuid,
    },
    /// Chat message
    Chat(ChatMessage),
}

impl Frame {
    /// Returns the type tag of this frame.
    #[must_use]
    pub const fn frame_type(&self) -> FrameType {
        match self {
            Self::Handshake(_) => FrameType::Handshake,
            Self::Metadata(_) => FrameType::Metadata,
            Self::Chunk { .. } => FrameType::Chunk,
            Self::End { .. } => FrameType::End,
            Self::Chat(_) => FrameType::Chat,
        }
    }

    /// Returns the transfer this frame belongs to, if any.
    #[must_use]
    pub const fn transfer_id(&self) -> Option<Uuid> {
        match self {
            Self::Metadata(descriptor) => Some(descriptor.transfer_id),
            Self::Chunk { transfer_id, .. } | Self::End { transfer_id } => Some(*transfer_id),
            Self::Handshake(_) | Self::Chat(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeHeader {
    peer_info: PeerInfo,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferRef {
    transfer_id: Uuid,
}

/// Decoded fixed prefix of a frame.
#[derive(Debug, Clone)]
pub struct FramePrefix {
    /// Protocol version (major, minor)
    pub version: (u8, u8),
    /// Frame type
    pub frame_type: FrameType,
    /// JSON header length
    pub header_length: u32,
    /// Binary payload length
    pub payload_length: u32,
}

impl FramePrefix {
    /// Encode the prefix to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; PREFIX_SIZE] {
        let mut buf = [0u8; PREFIX_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.version.0;
        buf[5] = self.version.1;
        buf[6] = self.frame_type as u8;
        buf[7..11].copy_from_slice(&self.header_length.to_be_bytes());
        buf[11..15].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode a prefix from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error on bad magic, an unknown major version, an unknown
    /// frame type, or oversized sections.
    pub fn decode(buf: &[u8; PREFIX_SIZE]) -> Result<Self> {
        if buf[0..4] != MAGIC {
            return Err(Error::ProtocolError("invalid magic bytes".to_string()));
        }

        let version = (buf[4], buf[5]);
        if version.0 != crate::PROTOCOL_VERSION.0 {
            return Err(Error::UnsupportedVersion {
                major: version.0,
                minor: version.1,
            });
        }

        let frame_type = FrameType::from_byte(buf[6])
            .ok_or_else(|| Error::ProtocolError(format!("unknown frame type: {:#x}", buf[6])))?;

        let header_length = u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);
        let payload_length = u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]);

        if header_length as usize > MAX_HEADER_SIZE {
            return Err(Error::ProtocolError(format!(
                "header too large: {header_length} bytes"
            )));
        }
        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::ProtocolError(format!(
                "payload too large: {payload_length} bytes"
            )));
        }
        if payload_length > 0 && frame_type != FrameType::Chunk {
            return Err(Error::ProtocolError(format!(
                "{frame_type} frame cannot carry a binary payload"
            )));
        }

        Ok(Self {
            version,
            frame_type,
            header_length,
            payload_length,
        })
    }
}

fn encode_header<T: Serialize>(header: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(header).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode_header<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
}

fn split_frame(frame: &Frame) -> Result<(Vec<u8>, &[u8])> {
    let header = match frame {
        Frame::Handshake(info) => encode_header(&HandshakeHeader {
            peer_info: info.clone(),
        })?,
        Frame::Metadata(descriptor) => encode_header(descriptor)?,
        Frame::Chunk { transfer_id, .. } | Frame::End { transfer_id } => {
            encode_header(&TransferRef {
                transfer_id: *transfer_id,
            })?
        }
        Frame::Chat(message) => encode_header(message)?,
    };

    let payload: &[u8] = match frame {
        Frame::Chunk { data, .. } => data,
        _ => &[],
    };

    if header.len() > MAX_HEADER_SIZE {
        return Err(Error::ProtocolError(format!(
            "header too large: {} bytes",
            header.len()
        )));
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::ProtocolError(format!(
            "payload too large: {} bytes",
            payload.len()
        )));
    }

    Ok((header, payload))
}

fn assemble_frame(frame_type: FrameType, header: &[u8], payload: Vec<u8>) -> Result<Frame> {
    let frame = match frame_type {
        FrameType::Handshake => {
            let h: HandshakeHeader = decode_header(header)?;
            Frame::Handshake(h.peer_info)
        }
        FrameType::Metadata => Frame::Metadata(decode_header(header)?),
        FrameType::Chunk => {
            let h: TransferRef = decode_header(header)?;
            Frame::Chunk {
                transfer_id: h.transfer_id,
                data: payload,
            }
        }
        FrameType::End => {
            let h: TransferRef = decode_header(header)?;
            Frame::End {
                transfer_id: h.transfer_id,
            }
        }
        FrameType::Chat => Frame::Chat(decode_header(header)?),
    };
    Ok(frame)
}

#[allow(clippy::cast_possible_truncation)]
fn prefix_for(frame: &Frame, header: &[u8], payload: &[u8]) -> FramePrefix {
    FramePrefix {
        version: crate::PROTOCOL_VERSION,
        frame_type: frame.frame_type(),
        header_length: header.len() as u32,
        payload_length: payload.len() as u32,
    }
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the header cannot be serialized or a section is
/// too large.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let (header, payload) = split_frame(frame)?;
    let prefix = prefix_for(frame, &header, payload);

    let mut buf = Vec::with_capacity(PREFIX_SIZE + header.len() + payload.len());
    buf.extend_from_slice(&prefix.encode());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a frame from a complete byte buffer.
///
/// # Errors
///
/// Returns an error if the buffer is truncated, has trailing bytes, or
/// holds an invalid frame.
pub fn decode_frame(data: &[u8]) -> Result<Frame> {
    let prefix_bytes: &[u8; PREFIX_SIZE] = data
        .get(..PREFIX_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::ProtocolError("frame shorter than prefix".to_string()))?;
    let prefix = FramePrefix::decode(prefix_bytes)?;

    let header_end = PREFIX_SIZE + prefix.header_length as usize;
    let payload_end = header_end + prefix.payload_length as usize;
    if data.len() != payload_end {
        return Err(Error::ProtocolError(format!(
            "frame length mismatch: expected {payload_end} bytes, got {}",
            data.len()
        )));
    }

    assemble_frame(
        prefix.frame_type,
        &data[PREFIX_SIZE..header_end],
        data[header_end..payload_end].to_vec(),
    )
}

/// Read a complete frame from a stream.
///
/// # Errors
///
/// Returns an error if reading fails or the frame is invalid.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: tokio::io::AsyncReadExt + Unpin,
{
    let mut prefix_buf = [0u8; PREFIX_SIZE];
    reader.read_exact(&mut prefix_buf).await?;

    let prefix = FramePrefix::decode(&prefix_buf)?;

    let mut header = vec![0u8; prefix.header_length as usize];
    reader.read_exact(&mut header).await?;

    let mut payload = vec![0u8; prefix.payload_length as usize];
    if prefix.payload_length > 0 {
        reader.read_exact(&mut payload).await?;
    }

    assemble_frame(prefix.frame_type, &header, payload)
}

/// Write a complete frame to a stream.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
{
    let (header, payload) = split_frame(frame)?;
    let prefix = prefix_for(frame, &header, payload);

    writer.write_all(&prefix.encode()).await?;
    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> PeerInfo {
        PeerInfo {
            id: PeerId::parse("ABC123").unwrap(),
            name: "Laptop".to_string(),
            os: "linux".to_string(),
            client: "nowhile/0.1.0".to_string(),
            connected_at: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
            is_secure: true,
        }
    }

    #[test]
    fn test_prefix_encode_decode() {
        let prefix = FramePrefix {
            version: (1, 0),
            frame_type: FrameType::Chunk,
            header_length: 52,
            payload_length: 65_536,
        };

        let decoded = FramePrefix::decode(&prefix.encode()).expect("decode");

        assert_eq!(decoded.version, (1, 0));
        assert_eq!(decoded.frame_type, FrameType::Chunk);
        assert_eq!(decoded.header_length, 52);
        assert_eq!(decoded.payload_length, 65_536);
    }

    #[test]
    fn test_prefix_rejects_bad_magic() {
        let mut bytes = FramePrefix {
            version: (1, 0),
            frame_type: FrameType::End,
            header_length: 10,
            payload_length: 0,
        }
        .encode();
        bytes[0] = b'X';

        assert!(matches!(
            FramePrefix::decode(&bytes),
            Err(Error::ProtocolError(_))
        ));
    }

    #[test]
    fn test_prefix_rejects_unknown_major_version() {
        let bytes = FramePrefix {
            version: (9, 0),
            frame_type: FrameType::End,
            header_length: 10,
            payload_length: 0,
        }
        .encode();

        assert!(matches!(
            FramePrefix::decode(&bytes),
            Err(Error::UnsupportedVersion { major: 9, minor: 0 })
        ));
    }

    #[test]
    fn test_prefix_rejects_payload_on_non_chunk() {
        let bytes = FramePrefix {
            version: (1, 0),
            frame_type: FrameType::Metadata,
            header_length: 10,
            payload_length: 4,
        }
        .encode();

        assert!(FramePrefix::decode(&bytes).is_err());
    }

    #[test]
    fn test_handshake_wire_fields() {
        let bytes = encode_frame(&Frame::Handshake(sample_info())).expect("encode");
        let header_len = u32::from_be_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]) as usize;
        let json: serde_json::Value =
            serde_json::from_slice(&bytes[PREFIX_SIZE..PREFIX_SIZE + header_len]).unwrap();

        let info = &json["peerInfo"];
        assert_eq!(info["id"], "ABC123");
        assert_eq!(info["browser"], "nowhile/0.1.0");
        assert_eq!(info["connectedAt"], 1_700_000_000_123_i64);
        assert_eq!(info["isSecure"], true);
    }

    #[test]
    fn test_chunk_frame_carries_raw_bytes() {
        let transfer_id = Uuid::new_v4();
        let data: Vec<u8> = (0..=255).collect();
        let frame = Frame::Chunk {
            transfer_id,
            data: data.clone(),
        };

        let bytes = encode_frame(&frame).expect("encode");
        assert!(bytes.ends_with(&data));
        assert_eq!(decode_frame(&bytes).expect("decode"), frame);
    }

    #[test]
    fn test_all_frame_kinds_decode() {
        let transfer_id = Uuid::new_v4();
        let frames = vec![
            Frame::Handshake(sample_info()),
            Frame::Metadata(FileDescriptor {
                transfer_id,
                file_name: "report.pdf".to_string(),
                file_size: 10_485_760,
                file_type: "application/pdf".to_string(),
            }),
            Frame::Chunk {
                transfer_id,
                data: Vec::new(),
            },
            Frame::End { transfer_id },
            Frame::Chat(ChatMessage {
                id: Uuid::new_v4(),
                text: "hello".to_string(),
                timestamp: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
                sender_name: "Desk".to_string(),
            }),
        ];

        for frame in frames {
            let decoded = decode_frame(&encode_frame(&frame).expect("encode")).expect("decode");
            assert_eq!(decoded.frame_type(), frame.frame_type());
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let bytes = encode_frame(&Frame::End {
            transfer_id: Uuid::new_v4(),
        })
        .expect("encode");

        assert!(decode_frame(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode_frame(&bytes[..4]).is_err());
    }

    #[test]
    fn test_transfer_id_accessor() {
        let transfer_id = Uuid::new_v4();
        assert_eq!(Frame::End { transfer_id }.transfer_id(), Some(transfer_id));
        assert_eq!(Frame::Handshake(sample_info()).transfer_id(), None);
    }

    #[tokio::test]
    async fn test_read_write_frame_stream() {
        let mut buffer = Vec::new();
        let transfer_id = Uuid::new_v4();

        write_frame(
            &mut buffer,
            &Frame::Chunk {
                transfer_id,
                data: vec![7; 1024],
            },
        )
        .await
        .expect("write chunk");
        write_frame(&mut buffer, &Frame::End { transfer_id })
            .await
            .expect("write end");

        let mut cursor = std::io::Cursor::new(buffer);
        let first = read_frame(&mut cursor).await.expect("read chunk");
        let second = read_frame(&mut cursor).await.expect("read end");

        assert!(matches!(first, Frame::Chunk { ref data, .. } if data.len() == 1024));
        assert_eq!(second, Frame::End { transfer_id });
    }
}
