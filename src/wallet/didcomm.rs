// src/wallet/didcomm.rs
//! Encrypted envelope format for agent-to-agent messages.
//!
//! Envelopes are JSON objects in the shape of a JWE: a base64url protected
//! header, the recipient key id, an IV and the ciphertext. The content key is
//! derived with BLAKE3 from X25519 agreements:
//!
//! - anoncrypt: `ECDH(ephemeral, recipient)`
//! - authcrypt: `ECDH(ephemeral, recipient) || ECDH(sender, recipient)`, with
//!   the sender's key id carried in the protected header as `skid`
//!
//! The protected header is bound as associated data, so a forged `skid`
//! fails authentication.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::AgentError;
use crate::utils::serialization::{b64url_decode, b64url_encode};

pub const ENCRYPTED_TYP: &str = "application/didcomm-encrypted+json";
pub const ANONCRYPT_ALG: &str = "ECDH-ES+C20P";
pub const AUTHCRYPT_ALG: &str = "ECDH-1PU+C20P";
pub const CONTENT_ENC: &str = "C20P";

const CONTENT_KEY_CONTEXT: &str = "vc-trust-engine didcomm content key v1";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProtectedHeader {
    pub typ: String,
    pub alg: String,
    pub enc: String,
    /// Ephemeral X25519 public key, base64url
    pub epk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecipientHeader {
    pub kid: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EncryptedEnvelope {
    pub protected: String,
    pub recipients: Vec<RecipientHeader>,
    pub iv: String,
    pub ciphertext: String,
}

/// Static key of an authenticated sender.
pub struct SenderKey<'a> {
    pub kid: &'a str,
    pub secret: &'a StaticSecret,
}

impl EncryptedEnvelope {
    /// Parses `raw` as an envelope. Plaintext messages yield `None`.
    pub fn detect(raw: &str) -> Option<Self> {
        serde_json::from_str::<Self>(raw).ok()
    }

    pub fn header(&self) -> Result<ProtectedHeader, AgentError> {
        let bytes = b64url_decode(&self.protected).map_err(AgentError::Unpacking)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::Unpacking(format!("bad protected header: {}", e)))
    }
}

fn content_key(
    ephemeral_agreement: &[u8; 32],
    static_agreement: Option<&[u8; 32]>,
    epk: &[u8; 32],
    recipient: &[u8; 32],
) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(ephemeral_agreement);
    if let Some(shared) = static_agreement {
        ikm.extend_from_slice(shared);
    }
    ikm.extend_from_slice(epk);
    ikm.extend_from_slice(recipient);
    blake3::derive_key(CONTENT_KEY_CONTEXT, &ikm)
}

/// Encrypts `plaintext` for one recipient key, optionally authenticating the sender.
pub fn encrypt(
    plaintext: &[u8],
    recipient_kid: &str,
    recipient_public: &[u8; 32],
    sender: Option<SenderKey<'_>>,
) -> Result<EncryptedEnvelope, AgentError> {
    let mut ephemeral_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut ephemeral_bytes);
    let ephemeral = StaticSecret::from(ephemeral_bytes);
    let epk = PublicKey::from(&ephemeral).to_bytes();

    let recipient_key = PublicKey::from(*recipient_public);
    let ephemeral_shared = ephemeral.diffie_hellman(&recipient_key).to_bytes();
    let static_shared = sender
        .as_ref()
        .map(|s| s.secret.diffie_hellman(&recipient_key).to_bytes());

    let header = ProtectedHeader {
        typ: ENCRYPTED_TYP.to_string(),
        alg: if sender.is_some() { AUTHCRYPT_ALG } else { ANONCRYPT_ALG }.to_string(),
        enc: CONTENT_ENC.to_string(),
        epk: b64url_encode(&epk),
        skid: sender.as_ref().map(|s| s.kid.to_string()),
    };
    let protected = b64url_encode(
        &serde_json::to_vec(&header).map_err(|e| AgentError::Packing(e.to_string()))?,
    );

    let key = content_key(&ephemeral_shared, static_shared.as_ref(), &epk, recipient_public);
    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| AgentError::Packing(format!("cipher init failed: {}", e)))?;
    let mut iv = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload { msg: plaintext, aad: protected.as_bytes() },
        )
        .map_err(|e| AgentError::Packing(format!("encryption failed: {}", e)))?;

    Ok(EncryptedEnvelope {
        protected,
        recipients: vec![RecipientHeader { kid: recipient_kid.to_string() }],
        iv: b64url_encode(&iv),
        ciphertext: b64url_encode(&ciphertext),
    })
}

/// Decrypts an envelope with the recipient's static key. `sender_public`
/// must be supplied exactly when the header carries an `skid`.
pub fn decrypt(
    envelope: &EncryptedEnvelope,
    header: &ProtectedHeader,
    recipient_secret: &StaticSecret,
    sender_public: Option<&[u8; 32]>,
) -> Result<Vec<u8>, AgentError> {
    if header.skid.is_some() != sender_public.is_some() {
        return Err(AgentError::Unpacking("sender key does not match packing mode".into()));
    }

    let epk = fixed::<32>(&b64url_decode(&header.epk).map_err(AgentError::Unpacking)?, "epk")?;
    let recipient_public = PublicKey::from(recipient_secret).to_bytes();
    let ephemeral_shared = recipient_secret.diffie_hellman(&PublicKey::from(epk)).to_bytes();
    let static_shared =
        sender_public.map(|pk| recipient_secret.diffie_hellman(&PublicKey::from(*pk)).to_bytes());

    let key = content_key(&ephemeral_shared, static_shared.as_ref(), &epk, &recipient_public);
    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| AgentError::Unpacking(format!("cipher init failed: {}", e)))?;
    let iv = fixed::<12>(&b64url_decode(&envelope.iv).map_err(AgentError::Unpacking)?, "iv")?;
    let ciphertext = b64url_decode(&envelope.ciphertext).map_err(AgentError::Unpacking)?;

    cipher
        .decrypt(
            Nonce::from_slice(&iv),
            Payload { msg: &ciphertext, aad: envelope.protected.as_bytes() },
        )
        .map_err(|_| AgentError::Unpacking("decryption failed".into()))
}

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], AgentError> {
    bytes
        .try_into()
        .map_err(|_| AgentError::Unpacking(format!("{} must be {} bytes", what, N)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(byte: u8) -> (StaticSecret, [u8; 32]) {
        let secret = StaticSecret::from([byte; 32]);
        let public = PublicKey::from(&secret).to_bytes();
        (secret, public)
    }

    #[test]
    fn test_anoncrypt_round_trip() {
        let (recipient_secret, recipient_public) = keypair(7);
        let envelope = encrypt(b"hello", "did:x:bob#key-1", &recipient_public, None).unwrap();

        let header = envelope.header().unwrap();
        assert_eq!(header.alg, ANONCRYPT_ALG);
        assert!(header.skid.is_none());
        assert_eq!(decrypt(&envelope, &header, &recipient_secret, None).unwrap(), b"hello");
    }

    #[test]
    fn test_authcrypt_requires_sender_key() {
        let (recipient_secret, recipient_public) = keypair(7);
        let (sender_secret, sender_public) = keypair(9);
        let (_, impostor_public) = keypair(11);
        let sender = SenderKey { kid: "did:x:alice#key-1", secret: &sender_secret };
        let envelope = encrypt(b"hello", "did:x:bob#key-1", &recipient_public, Some(sender)).unwrap();

        let header = envelope.header().unwrap();
        assert_eq!(header.alg, AUTHCRYPT_ALG);
        assert_eq!(header.skid.as_deref(), Some("did:x:alice#key-1"));

        assert_eq!(
            decrypt(&envelope, &header, &recipient_secret, Some(&sender_public)).unwrap(),
            b"hello"
        );
        assert!(decrypt(&envelope, &header, &recipient_secret, Some(&impostor_public)).is_err());
        assert!(decrypt(&envelope, &header, &recipient_secret, None).is_err());
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let (_, recipient_public) = keypair(7);
        let (other_secret, _) = keypair(8);
        let envelope = encrypt(b"hello", "did:x:bob#key-1", &recipient_public, None).unwrap();
        let header = envelope.header().unwrap();
        assert!(decrypt(&envelope, &header, &other_secret, None).is_err());
    }

    #[test]
    fn test_tampered_header_fails() {
        let (recipient_secret, recipient_public) = keypair(7);
        let mut envelope = encrypt(b"hello", "did:x:bob#key-1", &recipient_public, None).unwrap();
        let mut header = envelope.header().unwrap();
        header.typ = "application/json".into();
        envelope.protected = b64url_encode(&serde_json::to_vec(&header).unwrap());
        assert!(decrypt(&envelope, &header, &recipient_secret, None).is_err());
    }

    #[test]
    fn test_detect_plaintext() {
        assert!(EncryptedEnvelope::detect(r#"{"id":"1","type":"t","to":[],"body":{}}"#).is_none());
        let (_, recipient_public) = keypair(7);
        let envelope = encrypt(b"x", "did:x:bob#key-1", &recipient_public, None).unwrap();
        let raw = serde_json::to_string(&envelope).unwrap();
        assert_eq!(EncryptedEnvelope::detect(&raw), Some(envelope));
    }
}
