// src/contracts/schema_registry.rs
//! Schema Registry contract reference.
//!
//! Schema validation is owned by an external schema provider; the engine only
//! needs the registry's address and ABI shape to point schema-typed
//! credentials at their schema.

use ethers_core::types::Address;

use super::ContractRef;
use crate::error::ConfigError;
use crate::models::credential::CredentialSchema;

pub const SCHEMA_REFERENCE_TYPE: &str = "SchemaRegistryEntry";

pub fn schema_registry(address: Address) -> Result<ContractRef, ConfigError> {
    ContractRef::from_json("SchemaRegistry", address, include_bytes!("abi/SchemaRegistry.json"))
}

/// `credentialSchema` entry for a schema registered by `issuer` under `schema_name`.
pub fn schema_reference(
    registry: &ContractRef,
    chain_id: u64,
    issuer: Address,
    schema_name: &str,
) -> CredentialSchema {
    CredentialSchema {
        id: format!(
            "eip155:{}:{:?}#{}/{}",
            chain_id, registry.address, issuer, schema_name
        ),
        schema_type: SCHEMA_REFERENCE_TYPE.to_string(),
    }
}
