use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::kind::FrameKind;

/// Fixed header bytes: kind (4) + uri length (2) + tid (4) + what (4) + length (4).
pub const FIXED_HEADER_SIZE: usize = 18;

/// Bytes needed before the URI length is known: kind (4) + uri length (2).
const PREFIX_SIZE: usize = 6;

/// Bytes after the URI: tid (4) + what (4) + length (4).
const TRAILER_SIZE: usize = 12;

/// Default maximum payload size: 64 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Longest target URI the 16-bit length prefix can carry.
pub const MAX_URI_LEN: usize = u16::MAX as usize;

/// One binder transaction or reply on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// URI of the binder the transaction is addressed to. Replies echo it.
    pub target_uri: String,
    /// Correlates a reply with its request. Zero marks a oneway call.
    pub transaction_id: u32,
    /// Operation code within the target interface.
    pub what: i32,
    pub payload: Bytes,
}

impl Frame {
    /// A request, or a successful reply.
    pub fn transaction(
        target_uri: impl Into<String>,
        transaction_id: u32,
        what: i32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            kind: FrameKind::Transaction,
            target_uri: target_uri.into(),
            transaction_id,
            what,
            payload: payload.into(),
        }
    }

    /// A failed reply.
    pub fn exception(
        target_uri: impl Into<String>,
        transaction_id: u32,
        what: i32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            kind: FrameKind::Exception,
            ..Self::transaction(target_uri, transaction_id, what, payload)
        }
    }

    pub fn is_oneway(&self) -> bool {
        self.transaction_id == 0
    }

    /// The total wire size of this frame (header + uri + payload).
    pub fn wire_size(&self) -> usize {
        FIXED_HEADER_SIZE + self.target_uri.len() + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format (big-endian):
/// ```text
/// ┌───────────┬──────────┬───────────┬───────────┬───────────┬───────────┬──────────┐
/// │ Kind (4B) │ UriLen   │ Uri       │ Tid (4B)  │ What (4B) │ Length    │ Payload  │
/// │ 1 or 2    │ (2B)     │ (UTF-8)   │           │           │ (4B)      │          │
/// └───────────┴──────────┴───────────┴───────────┴───────────┴───────────┴──────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    let uri = frame.target_uri.as_bytes();
    if uri.len() > MAX_URI_LEN {
        return Err(FrameError::UriTooLong {
            len: uri.len(),
            max: MAX_URI_LEN,
        });
    }
    if frame.payload.len() > i32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: frame.payload.len(),
            max: i32::MAX as usize,
        });
    }

    dst.reserve(frame.wire_size());
    dst.put_i32(frame.kind.as_i32());
    dst.put_u16(uri.len() as u16);
    dst.put_slice(uri);
    dst.put_u32(frame.transaction_id);
    dst.put_i32(frame.what);
    dst.put_i32(frame.payload.len() as i32);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. Header fields are
/// validated as soon as they are available, so a corrupt stream fails before
/// its claimed payload arrives.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < PREFIX_SIZE {
        return Ok(None);
    }

    let mut header = &src[..];
    let kind = FrameKind::try_from(header.get_i32())?;
    let uri_len = header.get_u16() as usize;

    if header.remaining() < uri_len + TRAILER_SIZE {
        return Ok(None);
    }
    header.advance(uri_len);
    let transaction_id = header.get_u32();
    let what = header.get_i32();
    let length = header.get_i32();

    if length < 0 {
        return Err(FrameError::NegativeLength(length));
    }
    let payload_len = length as usize;
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = PREFIX_SIZE + uri_len + TRAILER_SIZE + payload_len;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(PREFIX_SIZE);
    let uri = src.split_to(uri_len);
    let target_uri = std::str::from_utf8(&uri)
        .map_err(|_| FrameError::InvalidUri)?
        .to_string();
    src.advance(TRAILER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        kind,
        target_uri,
        transaction_id,
        what,
        payload,
    }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 64 MiB.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frame = Frame::transaction("rpc://2.1", 7, 2, Bytes::from_static(b"\"Hello\""));
        let mut buf = encoded(&frame);
        assert_eq!(buf.len(), frame.wire_size());

        let decoded = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_wire_layout_is_big_endian() {
        let frame = Frame::exception("ab", 0x0102_0304, -1, Bytes::from_static(b"xy"));
        let buf = encoded(&frame);
        assert_eq!(
            buf.as_ref(),
            &[
                0, 0, 0, 2, // kind
                0, 2, b'a', b'b', // uri
                1, 2, 3, 4, // tid
                0xFF, 0xFF, 0xFF, 0xFF, // what
                0, 0, 0, 2, // length
                b'x', b'y',
            ]
        );
    }

    #[test]
    fn test_decode_incomplete_prefix() {
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00][..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_incomplete_uri_and_payload() {
        let full = encoded(&Frame::transaction("rpc://1.9", 3, 1, Bytes::from_static(b"hello")));
        for cut in [PREFIX_SIZE + 2, FIXED_HEADER_SIZE, full.len() - 1] {
            let mut buf = BytesMut::from(&full[..cut]);
            assert!(
                decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none(),
                "cut at {cut}"
            );
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut buf = BytesMut::new();
        buf.put_i32(9);
        buf.put_u16(0);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::UnknownKind(9))));
    }

    #[test]
    fn test_decode_payload_too_large() {
        let mut buf = BytesMut::new();
        buf.put_i32(1);
        buf.put_u16(0);
        buf.put_u32(1);
        buf.put_i32(0);
        buf.put_i32(128 * 1024 * 1024);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_decode_negative_length() {
        let mut buf = BytesMut::new();
        buf.put_i32(1);
        buf.put_u16(0);
        buf.put_u32(1);
        buf.put_i32(0);
        buf.put_i32(-5);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::NegativeLength(-5))));
    }

    #[test]
    fn test_decode_invalid_utf8_uri() {
        let mut buf = BytesMut::new();
        buf.put_i32(1);
        buf.put_u16(2);
        buf.put_slice(&[0xC3, 0x28]);
        buf.put_u32(1);
        buf.put_i32(0);
        buf.put_i32(0);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::InvalidUri)));
    }

    #[test]
    fn test_encode_uri_too_long() {
        let frame = Frame::transaction("u".repeat(MAX_URI_LEN + 1), 1, 0, Bytes::new());
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_frame(&frame, &mut buf),
            Err(FrameError::UriTooLong { .. })
        ));
    }

    #[test]
    fn test_multiple_frames() {
        let first = Frame::transaction("rpc://2.1", 1, 1, Bytes::from_static(b"first"));
        let second = Frame::exception("rpc://2.1", 2, 1, Bytes::from_static(b"second"));
        let mut buf = encoded(&first);
        encode_frame(&second, &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        let f2 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(f1, first);
        assert_eq!(f2, second);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_payload_and_uri() {
        let frame = Frame::transaction("", 0, 0, Bytes::new());
        assert!(frame.is_oneway());
        let mut buf = encoded(&frame);
        assert_eq!(buf.len(), FIXED_HEADER_SIZE);

        let decoded = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert!(decoded.target_uri.is_empty());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_large_payload() {
        let payload = Bytes::from(vec![0x5A; 1024 * 1024]);
        let frame = Frame::transaction("rpc://3.4", u32::MAX, i32::MIN, payload);
        let mut buf = encoded(&frame);
        let decoded = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, frame);
    }
}
