//! CBOR encoding for protocol values.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value to CBOR bytes.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ProtocolError::Encoding(e.to_string()))?;
    Ok(buf)
}

/// Decodes a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decoding(e.to_string()))
}

/// Types that travel over the wire as CBOR.
pub trait CborCodec: Serialize + DeserializeOwned {
    /// Encodes to CBOR.
    fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_key_order_does_not_change_bytes() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(to_cbor(&a).unwrap(), to_cbor(&b).unwrap());
    }

    #[test]
    fn truncated_input_is_a_decoding_error() {
        let bytes = to_cbor(&json!({"name": "Espresso", "price": 350})).unwrap();
        let err = from_cbor::<serde_json::Value>(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decoding(_)));
    }
}
