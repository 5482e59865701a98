// src/models/message.rs
//! DIDComm-style message envelopes exchanged between agents.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const BASIC_MESSAGE_TYPE: &str = "https://didcomm.org/basicmessage/2.0/message";

/// Plaintext application message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DidCommMessage {
    pub id: String,

    #[serde(rename = "type")]
    pub message_type: String,

    pub to: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    pub body: Value,
}

impl DidCommMessage {
    /// A basic message from `from` to a single recipient with a fresh `urn:uuid` id.
    pub fn basic(from: &str, to: &str, body: Value) -> Self {
        Self {
            id: format!("urn:uuid:{}", Uuid::new_v4()),
            message_type: BASIC_MESSAGE_TYPE.to_string(),
            to: vec![to.to_string()],
            from: Some(from.to_string()),
            body,
        }
    }
}

/// How an envelope is protected on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    /// Plain JSON, no protection
    None,
    /// Encrypted and bound to the sender's key agreement key
    Authcrypt,
    /// Encrypted without revealing the sender
    Anoncrypt,
}

/// Wire form of a message: the serialized (possibly encrypted) envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PackedMessage {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnpackedMessage {
    pub message: DidCommMessage,
    pub packing: EncryptionMode,
    /// Key id of the authenticated sender, only set for authcrypt
    pub sender_kid: Option<String>,
}
