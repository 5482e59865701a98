// src/blockchain/ledger.rs
//! Ledger client.
//!
//! [`LedgerClient`] is the JSON-RPC surface every on-chain component consumes.
//! [`EthersLedger`] implements it over an `ethers` HTTP provider, serialising
//! requests through a rate limiter so public RPC quotas are respected.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{Address, Bytes, TransactionReceipt, H256, U256};
use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{ConfigError, LedgerError};

/// Fallback when the node cannot estimate EIP-1559 fees.
pub const DEFAULT_MAX_FEE_PER_GAS: u64 = 20_000_000_000;
pub const DEFAULT_MAX_PRIORITY_FEE_PER_GAS: u64 = 1_500_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeData {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl Default for FeeData {
    fn default() -> Self {
        Self {
            max_fee_per_gas: U256::from(DEFAULT_MAX_FEE_PER_GAS),
            max_priority_fee_per_gas: U256::from(DEFAULT_MAX_PRIORITY_FEE_PER_GAS),
        }
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Executes a view call without creating a transaction.
    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, LedgerError>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, LedgerError>;

    async fn fee_data(&self) -> Result<FeeData, LedgerError>;

    async fn balance(&self, address: Address) -> Result<U256, LedgerError>;

    /// Account nonce for the next transaction.
    async fn transaction_count(&self, address: Address) -> Result<U256, LedgerError>;

    /// Submits a signed, RLP-encoded transaction and returns its hash.
    async fn broadcast(&self, signed: Bytes) -> Result<H256, LedgerError>;

    /// Waits until `tx_hash` is mined with `confirmations` blocks, or `timeout` elapses.
    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<TransactionReceipt, LedgerError>;
}

/// One request in flight at a time, starts spaced by at least `min_interval`.
pub struct RateLimiter {
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last_start: Mutex::new(None) }
    }

    pub async fn schedule<F: Future>(&self, job: F) -> F::Output {
        let mut last_start = self.last_start.lock().await;
        if let Some(previous) = *last_start {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last_start = Some(Instant::now());
        job.await
    }
}

/// `ethers` JSON-RPC provider behind a [`RateLimiter`].
pub struct EthersLedger {
    provider: Provider<Http>,
    limiter: RateLimiter,
    poll_interval: Duration,
}

impl EthersLedger {
    /// Creates a client for `rpc_url`. Only the URL is validated here; the
    /// connection is established lazily.
    pub fn new(rpc_url: &str, min_interval: Duration) -> Result<Self, ConfigError> {
        let provider = Provider::<Http>::try_from(rpc_url).map_err(|e| ConfigError::Invalid {
            key: "RPC_URL".into(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            provider,
            limiter: RateLimiter::new(min_interval),
            poll_interval: Duration::from_secs(4),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Chain id reported by the node, used to sanity-check configuration at startup.
    pub async fn chain_id(&self) -> Result<u64, LedgerError> {
        let id = self.limiter.schedule(self.provider.get_chainid()).await.map_err(rpc_error)?;
        Ok(id.as_u64())
    }
}

fn rpc_error(err: ProviderError) -> LedgerError {
    LedgerError::Rpc(err.to_string())
}

#[async_trait]
impl LedgerClient for EthersLedger {
    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, LedgerError> {
        self.limiter.schedule(self.provider.call(tx, None)).await.map_err(rpc_error)
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, LedgerError> {
        self.limiter.schedule(self.provider.estimate_gas(tx, None)).await.map_err(rpc_error)
    }

    async fn fee_data(&self) -> Result<FeeData, LedgerError> {
        match self.limiter.schedule(self.provider.estimate_eip1559_fees(None)).await {
            Ok((max_fee_per_gas, max_priority_fee_per_gas)) => Ok(FeeData {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }),
            Err(e) => {
                warn!("EIP-1559 fee estimation unavailable ({}), using default fees", e);
                Ok(FeeData::default())
            }
        }
    }

    async fn balance(&self, address: Address) -> Result<U256, LedgerError> {
        self.limiter.schedule(self.provider.get_balance(address, None)).await.map_err(rpc_error)
    }

    async fn transaction_count(&self, address: Address) -> Result<U256, LedgerError> {
        self.limiter
            .schedule(self.provider.get_transaction_count(address, None))
            .await
            .map_err(rpc_error)
    }

    async fn broadcast(&self, signed: Bytes) -> Result<H256, LedgerError> {
        self.limiter
            .schedule(async {
                self.provider
                    .send_raw_transaction(signed)
                    .await
                    .map(|pending| pending.tx_hash())
            })
            .await
            .map_err(rpc_error)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<TransactionReceipt, LedgerError> {
        let confirmations = confirmations.max(1);
        let poll = async {
            loop {
                // Node errors while polling are transient; only the timeout ends the wait
                match self.poll_receipt(tx_hash, confirmations).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {}
                    Err(e) => warn!("Polling receipt of {:?} failed, retrying: {}", tx_hash, e),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| LedgerError::Timeout { tx_hash })
    }
}

impl EthersLedger {
    /// The receipt of `tx_hash` once it has `confirmations` blocks on top, counting its own.
    async fn poll_receipt(
        &self,
        tx_hash: H256,
        confirmations: u64,
    ) -> Result<Option<TransactionReceipt>, LedgerError> {
        let receipt = self
            .limiter
            .schedule(self.provider.get_transaction_receipt(tx_hash))
            .await
            .map_err(rpc_error)?;
        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(mined_at) = receipt.block_number else {
            return Ok(None);
        };

        let head = self
            .limiter
            .schedule(self.provider.get_block_number())
            .await
            .map_err(rpc_error)?;
        let depth = head.as_u64().saturating_sub(mined_at.as_u64()) + 1;
        debug!("{:?} mined in block {} ({} confirmations)", tx_hash, mined_at, depth);
        Ok((depth >= confirmations).then_some(receipt))
    }
}
