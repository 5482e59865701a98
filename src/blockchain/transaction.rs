// src/blockchain/transaction.rs
//! Transaction orchestration.
//!
//! Turns a logical contract call into a signed, priced, broadcast and
//! confirmed EIP-1559 transaction, classifying every failure so callers can
//! tell "definitely failed" from "outcome unknown" from "retry with a fresh
//! nonce".

use std::sync::Arc;
use std::time::Duration;

use ethers_core::abi::Token;
use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{Address, Eip1559TransactionRequest, TransactionReceipt, U256, U64};
use ethers_core::utils::format_ether;
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::blockchain::ledger::{FeeData, LedgerClient};
use crate::contracts::ContractRef;
use crate::error::{AgentError, LedgerError, TransactionError};
use crate::services::did_resolver::CachedDidResolver;
use crate::wallet::capabilities::{KeyStore, KeyType, TransactionSigner};

/// Gas limit = estimate × 120 / 100.
pub const GAS_BUFFER_PERCENT: u64 = 120;

/// Gas of a plain value transfer.
pub const TRANSFER_GAS: u64 = 21_000;

/// Node error fragments meaning another transaction already used the account nonce.
const NONCE_CONFLICT_MARKERS: [&str; 3] =
    ["nonce too low", "already known", "replacement transaction underpriced"];

pub struct TransactionOrchestrator {
    ledger: Arc<dyn LedgerClient>,
    keys: Arc<dyn KeyStore>,
    signer: Arc<dyn TransactionSigner>,
    resolver: Arc<CachedDidResolver>,
    confirmations: u64,
    timeout: Duration,
}

impl TransactionOrchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        keys: Arc<dyn KeyStore>,
        signer: Arc<dyn TransactionSigner>,
        resolver: Arc<CachedDidResolver>,
        confirmations: u64,
        timeout: Duration,
    ) -> Self {
        Self { ledger, keys, signer, resolver, confirmations, timeout }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    /// Executes `function` on `contract` as `sender_did` and waits for confirmation.
    ///
    /// # Errors
    /// - `SenderNotManaged` / `NoSigningKeyFound` before anything touches the chain
    /// - `EstimationFailed`, `InsufficientBalance`, `BroadcastRejected`: nothing was sent
    /// - `NonceConflict`: the account or signature nonce was consumed concurrently
    /// - `TransactionReverted`: mined with status 0
    /// - `Timeout` / `ConfirmationUnknown`: outcome unknown, the transaction may still confirm
    pub async fn execute(
        &self,
        sender_did: &str,
        contract: &ContractRef,
        function: &str,
        args: &[Token],
        value: U256,
        chain_id: u64,
    ) -> Result<TransactionReceipt, TransactionError> {
        // 1. Sender must be ours and hold a secp256k1 key
        let kid = self.signing_key(sender_did).await?;

        // 2. Chain address of the sender
        let from = self.resolver.derive_address(sender_did).await?;

        // 3. Call data
        let data = contract.encode_call(function, args)?;
        let request = Eip1559TransactionRequest::new()
            .from(from)
            .to(contract.address)
            .data(data)
            .value(value)
            .chain_id(chain_id);

        // 4. Fees and gas limit
        let fees = self.ledger.fee_data().await.map_err(ledger_error)?;
        let estimate_tx: TypedTransaction = request.clone().into();
        let estimated_gas = self
            .ledger
            .estimate_gas(&estimate_tx)
            .await
            .map_err(classify_estimation)?;
        let gas_limit = estimated_gas.saturating_mul(U256::from(GAS_BUFFER_PERCENT)) / U256::from(100u64);

        // 5. Balance must cover the worst case
        let gas_cost = gas_limit.saturating_mul(fees.max_fee_per_gas);
        let total_cost = value.saturating_add(gas_cost);
        let balance = self.ledger.balance(from).await.map_err(ledger_error)?;
        info!("Sender {:?} balance: {} ETH", from, format_ether(balance));
        info!(
            "{}.{}: estimated gas {} (limit {}), max cost {} ETH",
            contract.name,
            function,
            estimated_gas,
            gas_limit,
            format_ether(gas_cost)
        );
        if balance < total_cost {
            return Err(TransactionError::InsufficientBalance { required: total_cost, available: balance });
        }

        self.sign_and_confirm(&kid, from, request.gas(gas_limit), &fees, gas_cost).await
    }

    /// Sends the whole balance of `sender_did` minus the worst-case fee of a
    /// plain transfer to `recipient`, and waits for confirmation.
    ///
    /// # Errors
    /// - `InsufficientBalance` when the balance does not exceed the fee
    /// - otherwise as [`execute`](Self::execute)
    pub async fn transfer_all(
        &self,
        sender_did: &str,
        recipient: Address,
        chain_id: u64,
    ) -> Result<TransactionReceipt, TransactionError> {
        let kid = self.signing_key(sender_did).await?;
        let from = self.resolver.derive_address(sender_did).await?;

        let fees = self.ledger.fee_data().await.map_err(ledger_error)?;
        let gas_limit = U256::from(TRANSFER_GAS);
        let gas_cost = gas_limit.saturating_mul(fees.max_fee_per_gas);
        let balance = self.ledger.balance(from).await.map_err(ledger_error)?;
        info!("Sender {:?} balance: {} ETH", from, format_ether(balance));
        if balance <= gas_cost {
            return Err(TransactionError::InsufficientBalance {
                required: gas_cost.saturating_add(U256::one()),
                available: balance,
            });
        }

        let amount = balance - gas_cost;
        info!(
            "Transferring {} ETH from {:?} to {:?} (max fee {} ETH)",
            format_ether(amount),
            from,
            recipient,
            format_ether(gas_cost)
        );
        let request = Eip1559TransactionRequest::new()
            .from(from)
            .to(recipient)
            .value(amount)
            .chain_id(chain_id)
            .gas(gas_limit);
        self.sign_and_confirm(&kid, from, request, &fees, gas_cost).await
    }

    /// Steps shared by every write: nonce, signature, broadcast, confirmation.
    async fn sign_and_confirm(
        &self,
        kid: &str,
        from: Address,
        request: Eip1559TransactionRequest,
        fees: &FeeData,
        gas_cost: U256,
    ) -> Result<TransactionReceipt, TransactionError> {
        let gas_limit = request.gas.unwrap_or_default();

        // 6. Fresh account nonce, right before signing
        let nonce = self.ledger.transaction_count(from).await.map_err(ledger_error)?;
        let tx: TypedTransaction = request
            .max_fee_per_gas(fees.max_fee_per_gas)
            .max_priority_fee_per_gas(fees.max_priority_fee_per_gas)
            .nonce(nonce)
            .into();

        // 7. Sign through the agent
        let signed = self
            .signer
            .sign_transaction(kid, &tx)
            .await
            .map_err(|e| TransactionError::Signing(e.to_string()))?;

        // 8. Broadcast
        let tx_hash = self.ledger.broadcast(signed).await.map_err(classify_broadcast)?;
        info!("Transaction sent: {:?} (nonce {})", tx_hash, nonce);

        // 9. Confirmation
        let started = Instant::now();
        let receipt = self
            .ledger
            .wait_for_receipt(tx_hash, self.confirmations, self.timeout)
            .await
            .map_err(|e| match e {
                LedgerError::Timeout { tx_hash } => {
                    warn!("No confirmation for {:?} within {:?}; outcome unknown", tx_hash, self.timeout);
                    TransactionError::Timeout { tx_hash }
                }
                // Broadcast was accepted, so the transaction may still be mined
                LedgerError::Rpc(reason) => {
                    warn!("Lost track of {:?} after broadcast: {}; outcome unknown", tx_hash, reason);
                    TransactionError::ConfirmationUnknown { tx_hash, reason }
                }
            })?;

        if receipt.status != Some(U64::one()) {
            warn!("Transaction {:?} reverted", tx_hash);
            return Err(TransactionError::TransactionReverted { tx_hash });
        }

        log_receipt(&receipt, gas_limit, gas_cost, started.elapsed());
        Ok(receipt)
    }

    /// Calls a view function without signing or fees.
    pub async fn read(
        &self,
        contract: &ContractRef,
        function: &str,
        args: &[Token],
    ) -> Result<Vec<Token>, TransactionError> {
        self.read_as(None, contract, function, args).await
    }

    /// [`read`](Self::read) with an explicit `from`, for functions gated on the caller.
    pub async fn read_as(
        &self,
        from: Option<Address>,
        contract: &ContractRef,
        function: &str,
        args: &[Token],
    ) -> Result<Vec<Token>, TransactionError> {
        let data = contract.encode_call(function, args)?;
        let mut request = Eip1559TransactionRequest::new().to(contract.address).data(data);
        if let Some(from) = from {
            request = request.from(from);
        }
        let tx: TypedTransaction = request.into();

        let output = self.ledger.call(&tx).await.map_err(ledger_error)?;
        debug!("{}.{} returned {} bytes", contract.name, function, output.len());
        contract.decode_output(function, &output)
    }

    async fn signing_key(&self, sender_did: &str) -> Result<String, TransactionError> {
        let keys = self.keys.list_keys(sender_did).await.map_err(|e| match e {
            AgentError::NotManaged(did) => TransactionError::SenderNotManaged(did),
            other => TransactionError::Signing(other.to_string()),
        })?;
        keys.into_iter()
            .find(|key| key.key_type == KeyType::Secp256k1)
            .map(|key| key.kid)
            .ok_or_else(|| TransactionError::NoSigningKeyFound(sender_did.to_string()))
    }
}

fn ledger_error(err: LedgerError) -> TransactionError {
    TransactionError::Ledger(err.to_string())
}

fn classify_estimation(err: LedgerError) -> TransactionError {
    let reason = err.to_string();
    // The registry reverts with a nonce message when a signed authorization is stale
    if reason.to_lowercase().contains("nonce") {
        TransactionError::NonceConflict(reason)
    } else {
        TransactionError::EstimationFailed(reason)
    }
}

fn classify_broadcast(err: LedgerError) -> TransactionError {
    let reason = err.to_string();
    let lowered = reason.to_lowercase();
    if NONCE_CONFLICT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        TransactionError::NonceConflict(reason)
    } else {
        TransactionError::BroadcastRejected(reason)
    }
}

fn log_receipt(receipt: &TransactionReceipt, gas_limit: U256, estimated_cost: U256, elapsed: Duration) {
    info!(
        "Transaction {:?} confirmed in block {:?} after {:.1}s",
        receipt.transaction_hash,
        receipt.block_number,
        elapsed.as_secs_f64()
    );
    if let Some(gas_used) = receipt.gas_used {
        let percent = if gas_limit.is_zero() {
            0
        } else {
            (gas_used.saturating_mul(U256::from(100u64)) / gas_limit).low_u64()
        };
        info!("Gas used: {} of {} ({}%)", gas_used, gas_limit, percent);
        if let Some(price) = receipt.effective_gas_price {
            info!(
                "Actual cost: {} ETH (estimated max {} ETH)",
                format_ether(gas_used.saturating_mul(price)),
                format_ether(estimated_cost)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::credential_registry::{self, IS_REVOKED, ISSUE_CREDENTIAL};
    use crate::test_support::TestEnv;

    #[test]
    fn test_broadcast_classification() {
        let conflict = classify_broadcast(LedgerError::Rpc("(code: -32000, message: nonce too low)".into()));
        assert!(conflict.is_recoverable());
        let known = classify_broadcast(LedgerError::Rpc("already known".into()));
        assert!(matches!(known, TransactionError::NonceConflict(_)));
        let other = classify_broadcast(LedgerError::Rpc("intrinsic gas too low".into()));
        assert!(matches!(other, TransactionError::BroadcastRejected(_)));
    }

    #[test]
    fn test_estimation_classification() {
        let stale = classify_estimation(LedgerError::Rpc("execution reverted: Invalid nonce".into()));
        assert!(stale.is_recoverable());
        let revert = classify_estimation(LedgerError::Rpc("execution reverted: Not issuer".into()));
        assert!(matches!(revert, TransactionError::EstimationFailed(_)));
    }

    #[tokio::test]
    async fn test_execute_records_credential() {
        let env = TestEnv::new().await;
        let holder = Address::repeat_byte(0x42);
        let receipt = env
            .orchestrator
            .execute(
                &env.issuer_did(),
                &env.registry,
                ISSUE_CREDENTIAL,
                &credential_registry::issue_args(holder, "urn:uuid:1", 1_900_000_000),
                U256::zero(),
                env.chain_id,
            )
            .await
            .unwrap();
        assert_eq!(receipt.status, Some(U64::one()));

        let sent = env.ledger.last_transaction().unwrap();
        // 50_000 estimated, 20% buffer
        assert_eq!(sent.gas().copied(), Some(U256::from(60_000u64)));
        assert_eq!(sent.chain_id(), Some(U64::from(env.chain_id)));

        let tokens = env
            .orchestrator
            .read(&env.registry, IS_REVOKED, &[Token::String("urn:uuid:1".into())])
            .await
            .unwrap();
        assert_eq!(tokens, vec![Token::Bool(false)]);
    }

    #[tokio::test]
    async fn test_foreign_sender_rejected() {
        let env = TestEnv::new().await;
        let err = env
            .orchestrator
            .execute(
                "did:ethr:sepolia:0x1111111111111111111111111111111111111111",
                &env.registry,
                ISSUE_CREDENTIAL,
                &credential_registry::issue_args(Address::zero(), "urn:uuid:1", 1),
                U256::zero(),
                env.chain_id,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::SenderNotManaged(_)));
        assert_eq!(env.ledger.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails_before_broadcast() {
        let env = TestEnv::new().await;
        env.ledger.set_balance(env.agent.address(), U256::from(1_000u64));
        let err = env
            .orchestrator
            .execute(
                &env.issuer_did(),
                &env.registry,
                ISSUE_CREDENTIAL,
                &credential_registry::issue_args(Address::repeat_byte(1), "urn:uuid:1", 1),
                U256::zero(),
                env.chain_id,
            )
            .await
            .unwrap_err();
        match err {
            TransactionError::InsufficientBalance { required, available } => {
                assert_eq!(available, U256::from(1_000u64));
                assert!(required > available);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(env.ledger.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_reverted_transaction_reported() {
        let env = TestEnv::new().await;
        env.ledger.revert_on_chain(true);
        let err = env
            .orchestrator
            .execute(
                &env.issuer_did(),
                &env.registry,
                ISSUE_CREDENTIAL,
                &credential_registry::issue_args(Address::repeat_byte(1), "urn:uuid:1", 1),
                U256::zero(),
                env.chain_id,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::TransactionReverted { .. }));
        assert!(!err.is_outcome_unknown());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_unknown_outcome() {
        let env = TestEnv::new().await;
        env.ledger.withhold_receipts(true);
        let err = env
            .orchestrator
            .execute(
                &env.issuer_did(),
                &env.registry,
                ISSUE_CREDENTIAL,
                &credential_registry::issue_args(Address::repeat_byte(1), "urn:uuid:1", 1),
                U256::zero(),
                env.chain_id,
            )
            .await
            .unwrap_err();
        assert!(err.is_outcome_unknown());
        // The transaction did land
        assert!(env.ledger.has_credential("urn:uuid:1"));
    }

    #[tokio::test]
    async fn test_node_error_after_broadcast_is_unknown_outcome() {
        let env = TestEnv::new().await;
        env.ledger.fail_receipt_queries(true);
        let err = env
            .orchestrator
            .execute(
                &env.issuer_did(),
                &env.registry,
                ISSUE_CREDENTIAL,
                &credential_registry::issue_args(Address::repeat_byte(1), "urn:uuid:1", 1),
                U256::zero(),
                env.chain_id,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::ConfirmationUnknown { .. }), "{:?}", err);
        assert!(err.is_outcome_unknown());
        assert!(!err.is_recoverable());
        assert!(err.pending_hash().is_some());
        assert_eq!(env.ledger.broadcast_count(), 1);
        // Mined regardless
        assert!(env.ledger.has_credential("urn:uuid:1"));
    }

    #[tokio::test]
    async fn test_read_empty_output_is_bad_data() {
        let env = TestEnv::new().await;
        env.ledger.empty_view_results(true);
        let err = env
            .orchestrator
            .read(&env.registry, IS_REVOKED, &[Token::String("urn:uuid:1".into())])
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::BadData(_)));
    }

    #[tokio::test]
    async fn test_transfer_all_sweeps_balance_minus_fee() {
        let env = TestEnv::new().await;
        let recipient = Address::repeat_byte(0x77);
        let receipt = env
            .orchestrator
            .transfer_all(&env.issuer_did(), recipient, env.chain_id)
            .await
            .unwrap();
        assert_eq!(receipt.to, Some(recipient));

        let fee = U256::from(TRANSFER_GAS) * U256::from(crate::test_support::MAX_FEE);
        assert_eq!(env.ledger.balance_of(recipient), U256::exp10(19) - fee);
        assert_eq!(env.ledger.balance_of(env.agent.address()), U256::zero());

        let tx = env.ledger.last_transaction().unwrap();
        assert_eq!(tx.gas(), Some(&U256::from(TRANSFER_GAS)));
        assert!(tx.data().map_or(true, |data| data.is_empty()));
    }

    #[tokio::test]
    async fn test_transfer_all_needs_more_than_the_fee() {
        let env = TestEnv::new().await;
        let fee = U256::from(TRANSFER_GAS) * U256::from(crate::test_support::MAX_FEE);
        env.ledger.set_balance(env.agent.address(), fee);

        let err = env
            .orchestrator
            .transfer_all(&env.issuer_did(), Address::repeat_byte(0x77), env.chain_id)
            .await
            .unwrap_err();
        match err {
            TransactionError::InsufficientBalance { available, .. } => assert_eq!(available, fee),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(env.ledger.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_transfer_all_from_foreign_did() {
        let env = TestEnv::new().await;
        let holder = env.add_holder(0x42);
        let err = env
            .orchestrator
            .transfer_all(&holder, Address::repeat_byte(0x77), env.chain_id)
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::SenderNotManaged(_)));
    }
}
