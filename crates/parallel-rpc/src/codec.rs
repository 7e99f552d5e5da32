use serde::{Serialize, de::DeserializeOwned};

use crate::RpcTransportError;

/// Serializes a value to CBOR bytes for wire transmission.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RpcTransportError> {
    serde_cbor::to_vec(value).map_err(|err| RpcTransportError::Encode(err.to_string()))
}

/// Deserializes a CBOR frame payload into a typed value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RpcTransportError> {
    serde_cbor::from_slice(bytes).map_err(|err| RpcTransportError::Decode(err.to_string()))
}
