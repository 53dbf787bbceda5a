// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encoding of persisted values in [CBOR].
//!
//! Events and processing contexts are stored as CBOR. The format is self-describing, so the same
//! bytes can be read back by every storage backend without knowing a schema up-front.
//!
//! Every stored blob holds exactly one value. Decoding fails on bytes left over after it, as these
//! can only stem from a corrupted or mixed up column.
//!
//! [CBOR]: https://cbor.io/
use ciborium::de::Error as DeserializeError;
use ciborium::ser::Error as SerializeError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Encode a value into a standalone CBOR blob.
pub fn encode_cbor<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)?;
    Ok(bytes)
}

/// Decode a CBOR blob holding exactly one value.
pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut remaining = bytes;
    let value = ciborium::from_reader(&mut remaining)?;
    if !remaining.is_empty() {
        return Err(DecodeError::TrailingBytes(remaining.len()));
    }
    Ok(value)
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed writing cbor: {0}")]
    Io(std::io::Error),

    /// Serde refused the value, for example a map with non-string keys in a context.
    #[error("value can not be represented as cbor: {0}")]
    Unsupported(String),
}

impl From<SerializeError<std::io::Error>> for EncodeError {
    fn from(value: SerializeError<std::io::Error>) -> Self {
        match value {
            SerializeError::Io(err) => Self::Io(err),
            SerializeError::Value(reason) => Self::Unsupported(reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Input ended in the middle of a value.
    #[error("cbor input ended unexpectedly")]
    Truncated,

    #[error("malformed cbor at byte {0}")]
    Malformed(usize),

    /// Well-formed cbor which does not have the expected shape.
    #[error("unexpected cbor value (offset {0:?}): {1}")]
    Unexpected(Option<usize>, String),

    #[error("cbor value is nested too deeply")]
    TooDeep,

    #[error("{0} bytes left after cbor value")]
    TrailingBytes(usize),
}

impl From<DeserializeError<std::io::Error>> for DecodeError {
    fn from(value: DeserializeError<std::io::Error>) -> Self {
        match value {
            // Reading from a slice only fails when it ran out of bytes.
            DeserializeError::Io(_) => Self::Truncated,
            DeserializeError::Syntax(offset) => Self::Malformed(offset),
            DeserializeError::Semantic(offset, reason) => Self::Unexpected(offset, reason),
            DeserializeError::RecursionLimitExceeded => Self::TooDeep,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::Event;

    use super::{DecodeError, decode_cbor, encode_cbor};

    #[test]
    fn encode_decode() {
        let event = Event::new("evt-1", "transfer")
            .with_domain("payments")
            .with_payload(vec![1, 2, 3])
            .with_metadata("region", "eu");

        let bytes = encode_cbor(&event).unwrap();
        let event_again: Event = decode_cbor(&bytes).unwrap();
        assert_eq!(event, event_again);
    }

    #[test]
    fn nested_maps() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), vec![1u64, 2, 3]);
        map.insert("b".to_string(), vec![]);

        let bytes = encode_cbor(&map).unwrap();
        let map_again: BTreeMap<String, Vec<u64>> = decode_cbor(&bytes).unwrap();
        assert_eq!(map, map_again);
    }

    #[test]
    fn truncated_input() {
        let bytes = encode_cbor("a rather long string value").unwrap();
        let result: Result<String, DecodeError> = decode_cbor(&bytes[..4]);
        assert!(matches!(result, Err(DecodeError::Truncated)));
    }

    #[test]
    fn trailing_bytes() {
        let mut bytes = encode_cbor(&7u32).unwrap();
        bytes.extend(encode_cbor(&8u32).unwrap());

        let result: Result<u32, DecodeError> = decode_cbor(&bytes);
        assert!(matches!(result, Err(DecodeError::TrailingBytes(1))));
    }

    #[test]
    fn wrong_shape() {
        let bytes = encode_cbor(&vec![1u8, 2]).unwrap();
        let result: Result<String, DecodeError> = decode_cbor(&bytes);
        assert!(matches!(result, Err(DecodeError::Unexpected(_, _))));
    }
}
