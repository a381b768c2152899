//! Message framing for talon connections.
//!
//! A frame on the wire is a fixed-size header followed by a payload. The
//! header must be parsable to the total frame length, which is all the
//! server needs to delimit messages; everything inside the payload belongs
//! to the application.
//!
//! # Example
//!
//! ```
//! use talon_framing::{FramingProtocol, LengthPrefix};
//!
//! let proto = LengthPrefix::default();
//! let header = proto.build_package_header(5);
//! assert_eq!(proto.check_package_length(&header), (header.len() + 5) as i64);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Framing contract attached to every server connection.
///
/// Headers are fixed-size: the read path buffers `max_header_size()` bytes
/// before consulting the protocol, so implementations never see a short
/// header slice.
pub trait FramingProtocol: Send + Sync {
    /// Size of the frame header in bytes.
    fn max_header_size(&self) -> usize;

    /// Inspect a header and return the total frame length, header included.
    ///
    /// A return value of zero or less is a fatal framing error for the
    /// connection that produced the header.
    fn check_package_length(&self, header: &[u8]) -> i64;

    /// Build the header for a payload of `payload_len` bytes.
    fn build_package_header(&self, payload_len: usize) -> Bytes;
}

/// Length-prefix framing: a 4-byte big-endian payload length.
#[derive(Debug, Clone)]
pub struct LengthPrefix {
    max_payload: usize,
}

/// Size of the length-prefix header.
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size (16MB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

impl LengthPrefix {
    /// Create a codec that rejects payloads larger than `max_payload`.
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Encode a complete frame (header + payload) for a payload.
    ///
    /// Convenience for clients and tests; the server builds headers and
    /// payloads separately.
    pub fn encode_frame(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf.freeze()
    }
}

impl Default for LengthPrefix {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FramingProtocol for LengthPrefix {
    fn max_header_size(&self) -> usize {
        HEADER_SIZE
    }

    fn check_package_length(&self, header: &[u8]) -> i64 {
        if header.len() < HEADER_SIZE {
            return 0;
        }
        let payload = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if payload > self.max_payload {
            return -1;
        }
        (HEADER_SIZE + payload) as i64
    }

    fn build_package_header(&self, payload_len: usize) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u32(payload_len as u32);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let proto = LengthPrefix::default();
        let header = proto.build_package_header(1234);
        assert_eq!(header.len(), HEADER_SIZE);
        assert_eq!(proto.check_package_length(&header), (HEADER_SIZE + 1234) as i64);
    }

    #[test]
    fn empty_payload_is_a_valid_frame() {
        let proto = LengthPrefix::default();
        let header = proto.build_package_header(0);
        assert_eq!(proto.check_package_length(&header), HEADER_SIZE as i64);
    }

    #[test]
    fn oversized_payload_is_fatal() {
        let proto = LengthPrefix::new(1024);
        let header = proto.build_package_header(1025);
        assert!(proto.check_package_length(&header) <= 0);
    }

    #[test]
    fn short_header_is_rejected() {
        let proto = LengthPrefix::default();
        assert!(proto.check_package_length(&[0, 0]) <= 0);
    }

    #[test]
    fn encode_frame_matches_header_plus_payload() {
        let proto = LengthPrefix::default();
        let frame = proto.encode_frame(b"hello");
        assert_eq!(frame.len(), HEADER_SIZE + 5);
        assert_eq!(proto.check_package_length(&frame[..HEADER_SIZE]), frame.len() as i64);
        assert_eq!(&frame[HEADER_SIZE..], b"hello");
    }
}
