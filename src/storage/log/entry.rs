use anyhow::{Result, anyhow};
use tracing::warn;

use crate::message::LogEntry;

pub const ENTRY_MAGIC_NUM: u32 = 0x4B45_4C47;
pub const FRAME_VERSION_V1: u32 = 1;
pub const FRAME_HEADER_SIZE: usize = 16; // 4 + 4 + 4 + 4

/// Header in front of every entry body inside a segment blob.
///
/// ```text
/// | magic u32 | version u32 | body_len u32 | crc32(body) u32 | body ... |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic_num: u32,
    pub version: u32,
    pub body_len: u32,
    pub crc: u32,
}

impl FrameHeader {
    pub fn new(body: &[u8]) -> Result<Self> {
        let body_len = u32::try_from(body.len())
            .map_err(|_| anyhow!("entry body of {} bytes is too large", body.len()))?;
        Ok(Self {
            magic_num: ENTRY_MAGIC_NUM,
            version: FRAME_VERSION_V1,
            body_len,
            crc: crc32fast::hash(body),
        })
    }

    pub fn serialize(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic_num.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.body_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(anyhow!("Invalid length"));
        }
        let read_u32 = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(bytes)
        };

        let header = Self {
            magic_num: read_u32(0),
            version: read_u32(4),
            body_len: read_u32(8),
            crc: read_u32(12),
        };
        if header.magic_num != ENTRY_MAGIC_NUM {
            return Err(anyhow!("Invalid magic number {:#x}", header.magic_num));
        }
        if header.version != FRAME_VERSION_V1 {
            return Err(anyhow!("Unsupported frame version {}", header.version));
        }
        Ok(header)
    }
}

pub fn serialize_entry(entry: &LogEntry) -> Result<Vec<u8>> {
    let config = bincode::config::standard();
    Ok(bincode::encode_to_vec(entry, config)?)
}

pub fn deserialize_entry(data: &[u8]) -> Result<LogEntry> {
    let config = bincode::config::standard();
    let (entry, _) = bincode::decode_from_slice(data, config).map_err(|e| {
        warn!("Failed to deserialize log entry: {}", e);
        e
    })?;
    Ok(entry)
}

/// Header plus body, ready to be appended to a segment.
pub fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
    let body = serialize_entry(entry)?;
    let header = FrameHeader::new(&body)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&header.serialize());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Outcome of reading one frame at the start of a buffer.
#[derive(Debug)]
pub enum FrameRead {
    /// A complete, verified entry and the number of bytes it occupied.
    Entry(LogEntry, usize),
    /// The buffer ends inside a frame.
    Torn,
    Corrupt(String),
}

pub fn decode_frame(data: &[u8]) -> FrameRead {
    if data.len() < FRAME_HEADER_SIZE {
        return FrameRead::Torn;
    }
    let header = match FrameHeader::deserialize(data) {
        Ok(header) => header,
        Err(e) => return FrameRead::Corrupt(e.to_string()),
    };

    let end = FRAME_HEADER_SIZE + header.body_len as usize;
    if data.len() < end {
        return FrameRead::Torn;
    }
    let body = &data[FRAME_HEADER_SIZE..end];
    let crc = crc32fast::hash(body);
    if crc != header.crc {
        return FrameRead::Corrupt(format!(
            "crc mismatch: stored {:#010x}, computed {:#010x}",
            header.crc, crc
        ));
    }

    match deserialize_entry(body) {
        Ok(entry) => FrameRead::Entry(entry, end),
        Err(e) => FrameRead::Corrupt(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let entry = LogEntry::new(7, 2, b"hello".to_vec());
        let frame = encode_frame(&entry).unwrap();
        let header = FrameHeader::deserialize(&frame).unwrap();

        assert_eq!(header.magic_num, ENTRY_MAGIC_NUM);
        assert_eq!(header.version, FRAME_VERSION_V1);
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + header.body_len as usize);
        assert_eq!(header.crc, crc32fast::hash(&frame[FRAME_HEADER_SIZE..]));

        match decode_frame(&frame) {
            FrameRead::Entry(decoded, consumed) => {
                assert_eq!(decoded, entry);
                assert_eq!(consumed, frame.len());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_short_buffer_is_torn() {
        let frame = encode_frame(&LogEntry::new(1, 1, vec![0u8; 64])).unwrap();
        assert!(matches!(decode_frame(&frame[..10]), FrameRead::Torn));
        assert!(matches!(decode_frame(&frame[..frame.len() - 1]), FrameRead::Torn));
    }

    #[test]
    fn test_flipped_body_bit_is_corrupt() {
        let mut frame = encode_frame(&LogEntry::new(1, 1, b"payload".to_vec())).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(decode_frame(&frame), FrameRead::Corrupt(_)));
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let mut frame = encode_frame(&LogEntry::new(1, 1, b"x".to_vec())).unwrap();
        frame[0] = 0;
        assert!(matches!(decode_frame(&frame), FrameRead::Corrupt(_)));
    }
}
