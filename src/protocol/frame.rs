//! Wire framing
//!
//! Every frame is an 8 byte header (little-endian length and CRC32 of the
//! body) followed by a bincode-encoded [`WireFrame`].

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::message::{Destination, Envelope};
use crate::error::{Error, Result};

/// Largest accepted frame body (files travel inline)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024 * 1024;

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

/// What travels between processes: an envelope and where to deliver it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub destination: Destination,
    pub envelope: Envelope,
}

/// Read a framed message from a reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<WireFrame> {
    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_SIZE {
        return Err(Error::Transport(format!(
            "Frame of {} bytes exceeds the {} byte limit",
            header.length, MAX_FRAME_SIZE
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Transport("Message checksum mismatch".into()));
    }

    Ok(bincode::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &WireFrame) -> Result<()> {
    let body = bincode::serialize(frame)?;
    if body.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(Error::Transport(format!(
            "Message of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Heartbeat, Message};

    fn heartbeat_frame() -> WireFrame {
        WireFrame {
            destination: Destination::Monitor,
            envelope: Envelope::new(
                "ONE",
                Message::Heartbeat(Heartbeat {
                    replica_id: "ONE".into(),
                    timestamp: chrono::Utc::now(),
                }),
            ),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }

    #[tokio::test]
    async fn test_frame_over_stream() {
        let frame = heartbeat_frame();
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let mut reader = buf.as_slice();
        let restored = read_frame(&mut reader).await.unwrap();
        assert_eq!(restored.destination, Destination::Monitor);
        assert_eq!(restored.envelope.header, frame.envelope.header);
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &heartbeat_frame()).await.unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let mut reader = buf.as_slice();
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }
}
