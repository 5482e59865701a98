// src/models/credential.rs
//! Verifiable Credential data model.
//!
//! Follows the shape of the [W3C Verifiable Credentials Data Model](https://www.w3.org/TR/vc-data-model/)
//! closely enough for wallets to consume it, plus the `ttl` member the
//! revocation registry records on chain.

use chrono::{DateTime, Utc};
use ethers_core::types::{Address, TransactionReceipt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const VC_CONTEXT: &str = "https://www.w3.org/2018/credentials/v1";
pub const VC_TYPE: &str = "VerifiableCredential";

/// A Verifiable Credential issued by the verifier's default identity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerifiableCredential {
    #[serde(rename = "@context")]
    pub context: Vec<String>,

    /// `urn:uuid:` identifier, also the registry key
    pub id: String,

    /// `VerifiableCredential` plus the schema name when one was requested
    #[serde(rename = "type")]
    pub types: Vec<String>,

    pub issuer: CredentialIssuer,

    pub issuance_date: DateTime<Utc>,

    pub expiration_date: DateTime<Utc>,

    /// Time to live in seconds, as requested at issuance
    pub ttl: u64,

    pub credential_subject: CredentialSubject,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_schema: Option<CredentialSchema>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<CredentialProof>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CredentialIssuer {
    pub id: String,
}

/// The holder DID plus arbitrary claims flattened next to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CredentialSubject {
    pub id: String,

    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CredentialSchema {
    pub id: String,

    #[serde(rename = "type")]
    pub schema_type: String,
}

/// Issuer signature over the credential without its proof.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialProof {
    #[serde(rename = "type")]
    pub proof_type: String,

    pub created: DateTime<Utc>,

    pub proof_purpose: String,

    pub verification_method: String,

    /// 0x-prefixed 65-byte recoverable signature
    pub proof_value: String,
}

impl VerifiableCredential {
    /// Bytes the issuer signs: the credential with `proof` stripped, keys sorted.
    pub fn signing_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut unsigned = self.clone();
        unsigned.proof = None;
        // Going through `Value` orders object keys deterministically
        let value = serde_json::to_value(&unsigned)?;
        serde_json::to_vec(&value)
    }

    pub fn holder(&self) -> &str {
        &self.credential_subject.id
    }

    pub fn expiration_timestamp(&self) -> i64 {
        self.expiration_date.timestamp()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date <= now
    }
}

/// On-chain counterpart of a credential, as returned by `getCredentialsForHolder`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RevocationRecord {
    #[serde(rename = "vcID")]
    pub vc_id: String,
    pub issuer: Address,
    pub holder: Address,
    pub ttl: u64,
    pub revoked: bool,
}

/// A signed credential together with the receipt of its registry entry.
///
/// The credential only becomes binding once `receipt` is confirmed.
#[derive(Serialize, Debug, Clone)]
pub struct IssuedCredential {
    pub credential: VerifiableCredential,
    pub receipt: TransactionReceipt,
}

/// Result of checking a presented credential.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    pub id: String,
    pub signature_valid: bool,
    pub expired: bool,
    pub revoked: bool,
}

impl CredentialStatus {
    pub fn is_valid(&self) -> bool {
        self.signature_valid && !self.expired && !self.revoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn sample() -> VerifiableCredential {
        let now = Utc::now();
        let mut claims = Map::new();
        claims.insert("degree".into(), json!("Bachelor"));
        VerifiableCredential {
            context: vec![VC_CONTEXT.into()],
            id: "urn:uuid:1".into(),
            types: vec![VC_TYPE.into()],
            issuer: CredentialIssuer { id: "did:ethr:sepolia:0xissuer".into() },
            issuance_date: now,
            expiration_date: now + Duration::seconds(60),
            ttl: 60,
            credential_subject: CredentialSubject { id: "did:ethr:sepolia:0xholder".into(), claims },
            credential_schema: None,
            proof: None,
        }
    }

    #[test]
    fn test_claims_flatten_next_to_subject_id() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["credentialSubject"]["id"], "did:ethr:sepolia:0xholder");
        assert_eq!(value["credentialSubject"]["degree"], "Bachelor");
        assert_eq!(value["type"][0], "VerifiableCredential");
        assert!(value.get("proof").is_none());
    }

    #[test]
    fn test_signing_payload_ignores_proof() {
        let unsigned = sample();
        let mut signed = unsigned.clone();
        signed.proof = Some(CredentialProof {
            proof_type: "EcdsaSecp256k1RecoverySignature2020".into(),
            created: Utc::now(),
            proof_purpose: "assertionMethod".into(),
            verification_method: "did:ethr:sepolia:0xissuer#controller".into(),
            proof_value: "0x00".into(),
        });
        assert_eq!(unsigned.signing_payload().unwrap(), signed.signing_payload().unwrap());
    }

    #[test]
    fn test_expiry() {
        let credential = sample();
        assert!(!credential.is_expired_at(credential.issuance_date));
        assert!(credential.is_expired_at(credential.expiration_date));
    }
}
