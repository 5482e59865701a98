// src/contracts/mod.rs
//! Smart contract references.
//!
//! A [`ContractRef`] pairs a deployed address with its ABI so that the
//! orchestrator can encode calls and decode view results by function name.

pub mod credential_registry;
pub mod schema_registry;

use std::sync::Arc;

use ethers_core::abi::{Abi, Function, Token};
use ethers_core::types::{Address, Bytes};

use crate::error::{ConfigError, TransactionError};

#[derive(Clone, Debug)]
pub struct ContractRef {
    /// Human readable contract name, used in logs
    pub name: &'static str,
    pub address: Address,
    abi: Arc<Abi>,
}

impl ContractRef {
    /// Loads a JSON ABI for a contract deployed at `address`.
    pub fn from_json(name: &'static str, address: Address, abi_json: &[u8]) -> Result<Self, ConfigError> {
        let abi = Abi::load(abi_json).map_err(|e| ConfigError::Invalid {
            key: format!("{} ABI", name),
            reason: e.to_string(),
        })?;
        Ok(Self { name, address, abi: Arc::new(abi) })
    }

    pub fn abi(&self) -> &Abi {
        &self.abi
    }

    pub fn function(&self, name: &str) -> Result<&Function, TransactionError> {
        self.abi
            .function(name)
            .map_err(|_| TransactionError::UnknownFunction(format!("{}.{}", self.name, name)))
    }

    /// ABI-encodes a call (selector + arguments).
    pub fn encode_call(&self, function: &str, args: &[Token]) -> Result<Bytes, TransactionError> {
        self.function(function)?
            .encode_input(args)
            .map(Bytes::from)
            .map_err(|e| TransactionError::Encoding(format!("{}.{}: {}", self.name, function, e)))
    }

    /// Decodes view output. Empty or malformed data is reported as [`TransactionError::BadData`].
    pub fn decode_output(&self, function: &str, data: &[u8]) -> Result<Vec<Token>, TransactionError> {
        let f = self.function(function)?;
        if data.is_empty() && !f.outputs.is_empty() {
            return Err(TransactionError::BadData(format!("{}.{} returned 0x", self.name, function)));
        }
        f.decode_output(data)
            .map_err(|e| TransactionError::BadData(format!("{}.{}: {}", self.name, function, e)))
    }
}
