//! Binder transaction framing for node-to-node streams.
//!
//! Every message on a node connection is one frame, all integers big-endian:
//! - A 4-byte kind (1 = TRANSACTION, 2 = EXCEPTION)
//! - The target binder URI as a 2-byte length plus UTF-8 bytes
//! - A 4-byte transaction id and a 4-byte operation code (`what`)
//! - A 4-byte payload length followed by the payload
//!
//! There is no magic, version or checksum. Callers always get complete frames.

pub mod codec;
pub mod error;
pub mod kind;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, FIXED_HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use kind::FrameKind;
pub use reader::FrameReader;
pub use writer::FrameWriter;

pub(crate) fn transport_to_frame_error(err: nodebind_transport::TransportError) -> FrameError {
    use nodebind_transport::TransportError;

    match err {
        TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
        TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
            FrameError::Io(source)
        }
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
