//! Argument and result encoding for typed proxies and stubs.
//!
//! Payloads are opaque bytes on the wire; this is the encoding the bundled
//! glue uses (JSON via serde), kept in one place so both ends agree.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BinderError, Result};

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| BinderError::Marshal(format!("encode failed: {err}")))
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|err| BinderError::Marshal(format!("decode failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_encode_as_json() {
        let payload = encode("Hello").unwrap();
        assert_eq!(payload.as_ref(), b"\"Hello\"");
        let back: String = decode(&payload).unwrap();
        assert_eq!(back, "Hello");
    }

    #[test]
    fn decode_failure_is_marshal_error() {
        let err = decode::<u32>(b"\"not a number\"").unwrap_err();
        assert!(matches!(err, BinderError::Marshal(msg) if msg.starts_with("decode failed")));
    }

    #[test]
    fn unit_round_trips_through_null() {
        let payload = encode(&()).unwrap();
        assert_eq!(payload.as_ref(), b"null");
        decode::<()>(&payload).unwrap();
    }
}
