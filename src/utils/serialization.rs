// src/utils/serialization.rs
//! Serialization utilities: JSON and base64url helpers used by the
//! content store and the message packer.

use serde::{de::DeserializeOwned, Serialize};

/// Serializes a value to a JSON string.
pub fn serialize<T: Serialize>(data: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(data)
}

/// Deserializes a value from a JSON string.
pub fn deserialize<T: DeserializeOwned>(data: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(data)
}

/// Unpadded base64url, as used in JOSE headers.
pub fn b64url_encode(bytes: &[u8]) -> String {
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

pub fn b64url_decode(data: &str) -> Result<Vec<u8>, String> {
    base64::decode_config(data, base64::URL_SAFE_NO_PAD)
        .map_err(|e| format!("Base64 decoding failed: {}", e))
}

/// Decodes a hex string with or without `0x` prefix into exactly 32 bytes.
pub fn decode_key_hex(data: &str) -> Result<[u8; 32], String> {
    let bytes = ethers_core::utils::hex::decode(data.trim_start_matches("0x"))
        .map_err(|e| format!("Hex decoding failed: {}", e))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("Expected 32 bytes, got {}", b.len()))
}
