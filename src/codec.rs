//! Weft runtime: payload encoding for the binding layer.
//!
//! The core treats arguments and return values as opaque bytes; this module
//! is the one place that fixes the encoding (postcard). Argument tuples and
//! return values round-trip through these two functions on both sides of a
//! call.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a value (typically an argument tuple or return value) to bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(value)
}

/// Decode a payload produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, postcard::Error> {
    postcard::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_round_trip() {
        let bytes = encode(&(7u64, "seven".to_string())).unwrap();
        let (n, s): (u64, String) = decode(&bytes).unwrap();
        assert_eq!(n, 7);
        assert_eq!(s, "seven");
    }

    #[test]
    fn unit_encodes_empty() {
        assert!(encode(&()).unwrap().is_empty());
        let () = decode(&[]).unwrap();
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        let bytes = encode(&42u8).unwrap();
        assert!(decode::<String>(&bytes).is_err());
    }
}
