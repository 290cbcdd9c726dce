/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The kind field is neither TRANSACTION nor EXCEPTION.
    #[error("unknown frame kind {0}")]
    UnknownKind(i32),

    /// The target URI bytes are not valid UTF-8.
    #[error("target uri is not valid utf-8")]
    InvalidUri,

    /// The target URI does not fit its 16-bit length prefix.
    #[error("target uri too long ({len} bytes, max {max})")]
    UriTooLong { len: usize, max: usize },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The length field is negative.
    #[error("negative payload length {0}")]
    NegativeLength(i32),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
