// src/models/did.rs
//! Decentralized Identifier (DID) data model.
//!
//! Only the parts of a [DID Core](https://www.w3.org/TR/did-core/) document the
//! engine reads are modelled: verification methods (to derive a chain address
//! and key agreement material), key agreement references and service entries.
//! Unknown members are ignored on deserialization.

use std::collections::HashMap;

use ethers_core::types::Address;
use serde::{Deserialize, Serialize};

use crate::error::ResolutionError;

/// Verification method type carrying a recoverable secp256k1 chain account.
pub const RECOVERY_METHOD_TYPE: &str = "EcdsaSecp256k1RecoveryMethod2020";
/// Verification method type for plain secp256k1 public keys.
pub const SECP256K1_KEY_TYPE: &str = "EcdsaSecp256k1VerificationKey2019";
/// Verification method type for X25519 key agreement keys.
pub const X25519_KEY_TYPE: &str = "X25519KeyAgreementKey2019";

/// A resolved DID Document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,

    /// The DID this document describes
    pub id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification_method: Vec<VerificationMethod>,

    /// References to (or embedded) key agreement methods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_agreement: Vec<KeyAgreementEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service: Vec<Service>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub id: String,

    #[serde(rename = "type")]
    pub method_type: String,

    pub controller: String,

    /// CAIP-10 account, e.g. `eip155:11155111:0xabc...`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockchain_account_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_hex: Option<String>,
}

/// A `keyAgreement` entry is either a reference to a verification method or the method itself.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum KeyAgreementEntry {
    Reference(String),
    Embedded(VerificationMethod),
}

/// A typed service endpoint record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,

    #[serde(rename = "type")]
    pub service_type: String,

    /// Usually a URL string; DID Core also allows maps and sets
    pub service_endpoint: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Service {
    /// The endpoint as a URL, when it is a plain string.
    pub fn endpoint_url(&self) -> Option<&str> {
        self.service_endpoint.as_str()
    }
}

impl DidDocument {
    /// Creates an empty document for `did`.
    pub fn new(did: impl Into<String>) -> Self {
        Self {
            context: None,
            id: did.into(),
            verification_method: Vec::new(),
            key_agreement: Vec::new(),
            service: Vec::new(),
        }
    }

    /// Extracts the chain address of the first recovery-capable verification method.
    pub fn recovery_address(&self) -> Option<Address> {
        self.verification_method
            .iter()
            .filter(|vm| vm.method_type == RECOVERY_METHOD_TYPE)
            .filter_map(|vm| vm.blockchain_account_id.as_deref())
            .find_map(account_address)
    }

    /// Finds the first service entry of the given type.
    pub fn service_of_type(&self, service_type: &str) -> Option<&Service> {
        self.service.iter().find(|s| s.service_type == service_type)
    }

    /// Looks up a verification method by absolute or fragment-relative id.
    pub fn verification_method(&self, id: &str) -> Option<&VerificationMethod> {
        self.verification_method.iter().find(|vm| {
            vm.id == id || (id.starts_with('#') && vm.id == format!("{}{}", self.id, id))
        })
    }

    /// All X25519 key agreement methods, following `keyAgreement` references
    /// first and then any X25519 method listed directly.
    pub fn key_agreement_methods(&self) -> Vec<&VerificationMethod> {
        let mut methods: Vec<&VerificationMethod> = self
            .key_agreement
            .iter()
            .filter_map(|entry| match entry {
                KeyAgreementEntry::Reference(id) => self.verification_method(id),
                KeyAgreementEntry::Embedded(vm) => Some(vm),
            })
            .filter(|vm| vm.method_type == X25519_KEY_TYPE)
            .collect();

        for vm in &self.verification_method {
            if vm.method_type == X25519_KEY_TYPE && !methods.iter().any(|m| m.id == vm.id) {
                methods.push(vm);
            }
        }
        methods
    }
}

/// Parses the address out of a CAIP-10 (`eip155:1:0xabc`) or legacy (`0xabc@eip155:1`) account id.
fn account_address(account_id: &str) -> Option<Address> {
    let raw = match account_id.split_once('@') {
        Some((address, _)) => address,
        None => account_id.split(':').nth(2)?,
    };
    raw.parse().ok()
}

/// A DID URL split into its DID, parameters and fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DidUrl {
    pub did: String,
    pub params: HashMap<String, String>,
    pub fragment: Option<String>,
}

impl DidUrl {
    pub fn parse(input: &str) -> Result<Self, ResolutionError> {
        let (rest, fragment) = match input.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment.to_string())),
            None => (input, None),
        };
        let (did_part, query) = match rest.split_once('?') {
            Some((did, query)) => (did, Some(query)),
            None => (rest, None),
        };

        // Matrix parameters (`did:x:y;no-cache=true`) are folded into the query params
        let mut segments = did_part.split(';');
        let did = segments.next().unwrap_or_default().to_string();

        let mut parts = did.splitn(3, ':');
        let valid = parts.next() == Some("did")
            && parts.next().is_some_and(|method| !method.is_empty())
            && parts.next().is_some_and(|id| !id.is_empty());
        if !valid {
            return Err(ResolutionError::InvalidDid(input.to_string()));
        }

        let params = segments
            .chain(query.into_iter().flat_map(|q| q.split('&')))
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();

        Ok(Self { did, params, fragment })
    }

    /// Resolution parameters asked to bypass any cache.
    pub fn no_cache(&self) -> bool {
        self.params.get("no-cache").map(String::as_str) == Some("true")
    }
}
