//! Explicit length-prefixed binary framing.
//!
//! Frame layout: 4-byte magic `SDB1`, u32 big-endian payload length, then
//! the payload bytes (JSON-encoded row). Batches prepend a u32 element
//! count and concatenate frames. There is no foreign-reference or dynamic
//! code-loading mechanism anywhere in this format.
//!
//! The binary format MUST NOT be used for data from untrusted sources.
//! Both [`encode_frame`] and [`decode_frame`] emit a warning on every use;
//! this is part of the format's contract, not incidental logging.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use tracing::warn;

pub const MAGIC: &[u8; 4] = b"SDB1";

/// Upper bound on a single frame payload; larger lengths are rejected
/// before any allocation happens.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("bad magic: expected SDB1")]
    BadMagic,
    #[error("truncated frame: {0}")]
    Truncated(String),
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    TooLarge(u32),
}

fn untrusted_source_warning(direction: &str) {
    warn!(
        direction,
        "binary wire format in use; never feed it data from untrusted sources"
    );
}

/// Encode one payload as a framed binary message.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    untrusted_source_warning("encode");
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(MAGIC);
    // Writing to a Vec cannot fail.
    out.write_u32::<BigEndian>(payload.len() as u32).unwrap();
    out.extend_from_slice(payload);
    out
}

/// Decode one framed binary message, returning the payload bytes.
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<u8>, FrameError> {
    untrusted_source_warning("decode");
    let mut cursor = Cursor::new(bytes);
    read_one(&mut cursor)
}

/// Encode a homogeneous batch: u32 count followed by one frame per element.
pub fn encode_batch(payloads: &[Vec<u8>]) -> Vec<u8> {
    untrusted_source_warning("encode");
    let mut out = Vec::new();
    out.write_u32::<BigEndian>(payloads.len() as u32).unwrap();
    for payload in payloads {
        out.extend_from_slice(MAGIC);
        out.write_u32::<BigEndian>(payload.len() as u32).unwrap();
        out.extend_from_slice(payload);
    }
    out
}

/// Decode a batch produced by [`encode_batch`].
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
    untrusted_source_warning("decode");
    let mut cursor = Cursor::new(bytes);
    let count = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| FrameError::Truncated(e.to_string()))?;
    let mut out = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        out.push(read_one(&mut cursor)?);
    }
    Ok(out)
}

fn read_one(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, FrameError> {
    let mut magic = [0u8; 4];
    cursor
        .read_exact(&mut magic)
        .map_err(|e| FrameError::Truncated(e.to_string()))?;
    if &magic != MAGIC {
        return Err(FrameError::BadMagic);
    }
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| FrameError::Truncated(e.to_string()))?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    cursor
        .read_exact(&mut payload)
        .map_err(|e| FrameError::Truncated(e.to_string()))?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let payload = br#"{"entity_id":1}"#.to_vec();
        let framed = encode_frame(&payload);
        assert_eq!(&framed[..4], MAGIC);
        assert_eq!(decode_frame(&framed).unwrap(), payload);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut framed = encode_frame(b"x");
        framed[0] = b'X';
        assert_eq!(decode_frame(&framed).unwrap_err(), FrameError::BadMagic);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let framed = encode_frame(b"hello");
        let err = decode_frame(&framed[..framed.len() - 2]).unwrap_err();
        assert!(matches!(err, FrameError::Truncated(_)));
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let mut framed = Vec::new();
        framed.extend_from_slice(MAGIC);
        framed.extend_from_slice(&u32::MAX.to_be_bytes());
        assert_eq!(
            decode_frame(&framed).unwrap_err(),
            FrameError::TooLarge(u32::MAX)
        );
    }

    #[test]
    fn empty_batch_round_trips() {
        let encoded = encode_batch(&[]);
        assert_eq!(decode_batch(&encoded).unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn batch_round_trip_preserves_order() {
        let payloads = vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()];
        let encoded = encode_batch(&payloads);
        assert_eq!(decode_batch(&encoded).unwrap(), payloads);
    }
}
