// src/test_support.rs
//! In-memory collaborators for unit tests.
//!
//! [`RegistryLedger`] behaves like a node with the revocation registry
//! deployed: it decodes signed RLP transactions, recovers their sender,
//! enforces account nonces and the registry's signature nonces, and answers
//! view calls from its own state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ethers_core::abi::{encode, Token};
use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{Address, Bytes, Signature, TransactionReceipt, H256, U256, U64};
use ethers_core::utils::rlp::Rlp;
use serde_json::Value;

use crate::blockchain::ledger::{FeeData, LedgerClient};
use crate::blockchain::transaction::{TransactionOrchestrator, TRANSFER_GAS};
use crate::contracts::credential_registry::revocation_registry;
use crate::contracts::schema_registry::schema_registry;
use crate::contracts::ContractRef;
use crate::error::{LedgerError, ResolutionError, StorageError, TransportError};
use crate::models::credential::RevocationRecord;
use crate::models::did::{DidDocument, DidUrl, Service, VerificationMethod, RECOVERY_METHOD_TYPE};
use crate::models::message::PackedMessage;
use crate::services::credential_issuer::CredentialService;
use crate::services::did_resolver::{CachedDidResolver, DidResolver, LayeredResolver};
use crate::services::messaging::{
    MessageChannel, DIDCOMM_SERVICE, RECEIVE_CREDENTIAL_SERVICE, VERIFY_OWNERSHIP_SERVICE,
};
use crate::storage::ContentStore;
use crate::utils::crypto::revocation_hash;
use crate::wallet::capabilities::{AgentCapabilities, DidManager, KeyStore};
use crate::wallet::key_management::KeyManager;

pub(crate) const CHAIN_ID: u64 = 11155111;
pub(crate) const ESTIMATED_GAS: u64 = 50_000;
pub(crate) const GAS_USED: u64 = 45_000;
pub(crate) const MAX_FEE: u64 = 2_000_000_000;
pub(crate) const PRIORITY_FEE: u64 = 1_000_000_000;

pub(crate) fn registry_address() -> Address {
    "0x5EA76d697A19237e75329EFe6d23769eABa7f02a".parse().unwrap()
}

#[derive(Clone, Default)]
struct ChainState {
    balances: HashMap<Address, U256>,
    account_nonces: HashMap<Address, U256>,
    signature_nonces: HashMap<Address, U256>,
    credentials: HashMap<String, RevocationRecord>,
    receipts: HashMap<H256, TransactionReceipt>,
    sent: Vec<TypedTransaction>,
    block: u64,
}

impl ChainState {
    /// Runs a registry call from `from`. State only changes on success.
    fn execute(&mut self, registry: Address, from: Address, name: &str, args: &[Token]) -> Result<(), String> {
        match (name, args) {
            ("issueCredential", [Token::Address(holder), Token::String(id), Token::Uint(ttl)]) => {
                if self.credentials.contains_key(id) {
                    return Err("Credential already exists".into());
                }
                self.credentials.insert(
                    id.clone(),
                    RevocationRecord {
                        vc_id: id.clone(),
                        issuer: from,
                        holder: *holder,
                        ttl: ttl.low_u64(),
                        revoked: false,
                    },
                );
                Ok(())
            }
            ("revokeCredential", [Token::Address(holder), Token::String(id)]) => self.revoke(from, *holder, id),
            (
                "revokeCredentialWithSignature",
                [Token::Address(holder), Token::String(id), Token::Uint(nonce), Token::Uint(v), Token::FixedBytes(r), Token::FixedBytes(s)],
            ) => {
                let digest = revocation_hash(registry, *nonce, *holder, id).map_err(|e| e.to_string())?;
                let signer = recover(digest, *v, r, s)?;
                let expected = self.signature_nonces.get(&signer).copied().unwrap_or_default();
                if *nonce != expected {
                    return Err("Invalid nonce".into());
                }
                self.revoke(signer, *holder, id)?;
                self.signature_nonces.insert(signer, expected + 1);
                Ok(())
            }
            _ => Err(format!("unsupported call {}", name)),
        }
    }

    /// Plain value transfer; the sender pays `fee` on top of `value`.
    fn transfer(&mut self, from: Address, to: Address, value: U256, fee: U256) -> Result<(), String> {
        let balance = self.balances.get(&from).copied().unwrap_or_default();
        let remaining = balance
            .checked_sub(value)
            .and_then(|rest| rest.checked_sub(fee))
            .ok_or("insufficient funds for gas * price + value")?;
        self.balances.insert(from, remaining);
        *self.balances.entry(to).or_default() += value;
        Ok(())
    }

    fn revoke(&mut self, issuer: Address, holder: Address, id: &str) -> Result<(), String> {
        let record = self.credentials.get_mut(id).ok_or("Credential does not exist")?;
        if record.issuer != issuer {
            return Err("Only the issuer can revoke".into());
        }
        if record.holder != holder {
            return Err("Holder mismatch".into());
        }
        if record.revoked {
            return Err("Credential already revoked".into());
        }
        record.revoked = true;
        Ok(())
    }
}

fn recover(digest: H256, v: U256, r: &[u8], s: &[u8]) -> Result<Address, String> {
    let signature = Signature {
        r: U256::from_big_endian(r),
        s: U256::from_big_endian(s),
        v: v.low_u64(),
    };
    signature
        .recover(digest.as_bytes().to_vec())
        .map_err(|_| "Invalid signature".to_string())
}

/// Fake node with the revocation registry deployed at [`registry_address`].
pub(crate) struct RegistryLedger {
    registry: ContractRef,
    state: Mutex<ChainState>,
    revert_on_chain: AtomicBool,
    withhold_receipts: AtomicBool,
    fail_receipt_queries: AtomicBool,
    empty_view_results: AtomicBool,
}

impl RegistryLedger {
    pub(crate) fn new(registry: ContractRef) -> Self {
        Self {
            registry,
            state: Mutex::new(ChainState::default()),
            revert_on_chain: AtomicBool::new(false),
            withhold_receipts: AtomicBool::new(false),
            fail_receipt_queries: AtomicBool::new(false),
            empty_view_results: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_balance(&self, account: Address, balance: U256) {
        self.state.lock().unwrap().balances.insert(account, balance);
    }

    /// Mine every following transaction with status 0.
    pub(crate) fn revert_on_chain(&self, enabled: bool) {
        self.revert_on_chain.store(enabled, Ordering::SeqCst);
    }

    /// Apply transactions but never report a receipt.
    pub(crate) fn withhold_receipts(&self, enabled: bool) {
        self.withhold_receipts.store(enabled, Ordering::SeqCst);
    }

    /// Apply transactions but fail every receipt query with a node error.
    pub(crate) fn fail_receipt_queries(&self, enabled: bool) {
        self.fail_receipt_queries.store(enabled, Ordering::SeqCst);
    }

    /// Answer every view call with `0x`.
    pub(crate) fn empty_view_results(&self, enabled: bool) {
        self.empty_view_results.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn balance_of(&self, account: Address) -> U256 {
        self.state.lock().unwrap().balances.get(&account).copied().unwrap_or_default()
    }

    pub(crate) fn broadcast_count(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }

    pub(crate) fn last_transaction(&self) -> Option<TypedTransaction> {
        self.state.lock().unwrap().sent.last().cloned()
    }

    pub(crate) fn has_credential(&self, id: &str) -> bool {
        self.state.lock().unwrap().credentials.contains_key(id)
    }

    pub(crate) fn record(&self, id: &str) -> Option<RevocationRecord> {
        self.state.lock().unwrap().credentials.get(id).cloned()
    }

    fn decode_call(&self, tx: &TypedTransaction) -> Result<(String, Vec<Token>), String> {
        let data = tx.data().map(|d| d.to_vec()).unwrap_or_default();
        if data.len() < 4 {
            return Err("missing selector".into());
        }
        let function = self
            .registry
            .abi()
            .functions()
            .find(|f| f.short_signature()[..] == data[..4])
            .ok_or("unknown selector")?;
        let tokens = function.decode_input(&data[4..]).map_err(|e| e.to_string())?;
        Ok((function.name.clone(), tokens))
    }

    fn view(&self, name: &str, args: &[Token]) -> Result<Bytes, String> {
        let state = self.state.lock().unwrap();
        let output = match (name, args) {
            ("isRevoked", [Token::String(id)]) => {
                let revoked = state.credentials.get(id).map(|r| r.revoked).unwrap_or(false);
                encode(&[Token::Bool(revoked)])
            }
            ("getNonce", [Token::Address(account)]) => {
                let nonce = state.signature_nonces.get(account).copied().unwrap_or_default();
                encode(&[Token::Uint(nonce)])
            }
            (
                "getCredentialsForHolder",
                [Token::Address(holder), Token::Uint(v), Token::FixedBytes(r), Token::FixedBytes(s), Token::FixedBytes(hash)],
            ) => {
                let caller = recover(H256::from_slice(hash), *v, r, s)?;
                let records: Vec<Token> = state
                    .credentials
                    .values()
                    .filter(|record| record.holder == *holder && record.issuer == caller)
                    .map(|record| {
                        Token::Tuple(vec![
                            Token::String(record.vc_id.clone()),
                            Token::Address(record.issuer),
                            Token::Address(record.holder),
                            Token::Uint(U256::from(record.ttl)),
                            Token::Bool(record.revoked),
                        ])
                    })
                    .collect();
                // The deployed registry reverts without data when nothing matches
                if records.is_empty() {
                    return Ok(Bytes::new());
                }
                encode(&[Token::Array(records)])
            }
            _ => return Err(format!("unsupported view {}", name)),
        };
        Ok(Bytes::from(output))
    }
}

fn rpc(reason: impl Into<String>) -> LedgerError {
    LedgerError::Rpc(reason.into())
}

#[async_trait]
impl LedgerClient for RegistryLedger {
    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, LedgerError> {
        tokio::task::yield_now().await;
        if self.empty_view_results.load(Ordering::SeqCst) {
            return Ok(Bytes::new());
        }
        let (name, args) = self.decode_call(tx).map_err(rpc)?;
        self.view(&name, &args).map_err(|e| rpc(format!("execution reverted: {}", e)))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, LedgerError> {
        tokio::task::yield_now().await;
        let from = tx.from().copied().unwrap_or_default();
        let (name, args) = self.decode_call(tx).map_err(rpc)?;
        let mut scratch = self.state.lock().unwrap().clone();
        scratch
            .execute(self.registry.address, from, &name, &args)
            .map_err(|e| rpc(format!("execution reverted: {}", e)))?;
        Ok(U256::from(ESTIMATED_GAS))
    }

    async fn fee_data(&self) -> Result<FeeData, LedgerError> {
        Ok(FeeData {
            max_fee_per_gas: U256::from(MAX_FEE),
            max_priority_fee_per_gas: U256::from(PRIORITY_FEE),
        })
    }

    async fn balance(&self, address: Address) -> Result<U256, LedgerError> {
        tokio::task::yield_now().await;
        Ok(self.state.lock().unwrap().balances.get(&address).copied().unwrap_or_default())
    }

    async fn transaction_count(&self, address: Address) -> Result<U256, LedgerError> {
        tokio::task::yield_now().await;
        Ok(self.state.lock().unwrap().account_nonces.get(&address).copied().unwrap_or_default())
    }

    async fn broadcast(&self, signed: Bytes) -> Result<H256, LedgerError> {
        tokio::task::yield_now().await;
        let (tx, signature) = TypedTransaction::decode_signed(&Rlp::new(signed.as_ref()))
            .map_err(|e| rpc(format!("invalid transaction: {}", e)))?;
        let from = signature.recover(tx.sighash()).map_err(|e| rpc(e.to_string()))?;
        let has_data = tx.data().is_some_and(|data| !data.is_empty());
        let call = if has_data { Some(self.decode_call(&tx).map_err(rpc)?) } else { None };
        let to = tx.to_addr().copied().unwrap_or_default();

        let mut state = self.state.lock().unwrap();
        let expected = state.account_nonces.get(&from).copied().unwrap_or_default();
        let nonce = tx.nonce().copied().unwrap_or_default();
        if nonce < expected {
            return Err(rpc("nonce too low"));
        }
        if nonce > expected {
            return Err(rpc("nonce too high"));
        }
        state.account_nonces.insert(from, expected + 1);
        state.block += 1;

        let reverted = self.revert_on_chain.load(Ordering::SeqCst);
        let (succeeded, gas_used) = match &call {
            Some((name, args)) => (!reverted && state.execute(self.registry.address, from, name, args).is_ok(), GAS_USED),
            None => {
                let fee = U256::from(TRANSFER_GAS) * U256::from(MAX_FEE);
                let value = tx.value().copied().unwrap_or_default();
                (!reverted && state.transfer(from, to, value, fee).is_ok(), TRANSFER_GAS)
            }
        };
        let tx_hash = tx.hash(&signature);
        let receipt = TransactionReceipt {
            transaction_hash: tx_hash,
            block_number: Some(U64::from(state.block)),
            from,
            to: Some(to),
            status: Some(U64::from(succeeded as u64)),
            gas_used: Some(U256::from(gas_used)),
            effective_gas_price: Some(U256::from(MAX_FEE)),
            ..Default::default()
        };
        state.receipts.insert(tx_hash, receipt);
        state.sent.push(tx);
        Ok(tx_hash)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        _confirmations: u64,
        timeout: Duration,
    ) -> Result<TransactionReceipt, LedgerError> {
        tokio::task::yield_now().await;
        if self.withhold_receipts.load(Ordering::SeqCst) {
            tokio::time::sleep(timeout).await;
            return Err(LedgerError::Timeout { tx_hash });
        }
        if self.fail_receipt_queries.load(Ordering::SeqCst) {
            return Err(rpc("connection reset by peer"));
        }
        self.state
            .lock()
            .unwrap()
            .receipts
            .get(&tx_hash)
            .cloned()
            .ok_or_else(|| rpc("unknown transaction"))
    }
}

/// Resolver over a fixed set of documents, counting lookups.
#[derive(Default)]
pub(crate) struct StaticResolver {
    documents: Mutex<HashMap<String, DidDocument>>,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub(crate) fn insert(&self, document: DidDocument) {
        self.documents.lock().unwrap().insert(document.id.clone(), document);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DidResolver for StaticResolver {
    async fn resolve(&self, did: &str) -> Result<DidDocument, ResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let url = DidUrl::parse(did)?;
        self.documents
            .lock()
            .unwrap()
            .get(&url.did)
            .cloned()
            .ok_or(ResolutionError::NotFound(url.did))
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    objects: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub(crate) fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn put(&self, object: &Value) -> Result<String, StorageError> {
        let cid = format!("bafy{}", ethers_core::utils::hex::encode(&blake3::hash(object.to_string().as_bytes()).as_bytes()[..16]));
        self.objects.lock().unwrap().insert(cid.clone(), object.clone());
        Ok(cid)
    }

    async fn get(&self, content_id: &str) -> Result<Value, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(content_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(content_id.to_string()))
    }

    async fn delete(&self, content_id: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().unwrap().remove(content_id).is_some())
    }
}

/// `did:ethr` document controlled by `address`, optionally advertising services.
pub(crate) fn holder_document(address: Address, services: &[(&str, &str)]) -> DidDocument {
    let did = format!("did:ethr:sepolia:{:?}", address);
    let mut document = DidDocument::new(did.clone());
    document.verification_method.push(VerificationMethod {
        id: format!("{}#controller", did),
        method_type: RECOVERY_METHOD_TYPE.to_string(),
        controller: did.clone(),
        blockchain_account_id: Some(format!("eip155:{}:{:?}", CHAIN_ID, address)),
        public_key_hex: None,
    });
    for (index, (service_type, endpoint)) in services.iter().enumerate() {
        document.service.push(Service {
            id: format!("{}#service-{}", did, index + 1),
            service_type: service_type.to_string(),
            service_endpoint: Value::String(endpoint.to_string()),
            description: None,
        });
    }
    document
}

/// Verifier wiring over in-memory collaborators.
pub(crate) struct TestEnv {
    pub agent: Arc<KeyManager>,
    pub remote: Arc<StaticResolver>,
    pub resolver: Arc<CachedDidResolver>,
    pub registry: ContractRef,
    pub ledger: Arc<RegistryLedger>,
    pub orchestrator: Arc<TransactionOrchestrator>,
    pub credentials: Arc<CredentialService>,
    pub store: Arc<MemoryStore>,
    pub chain_id: u64,
}

impl TestEnv {
    pub(crate) async fn new() -> Self {
        let agent = Arc::new(KeyManager::random(CHAIN_ID, "sepolia"));
        let remote = Arc::new(StaticResolver::default());
        let layered = LayeredResolver::new(agent.clone(), remote.clone());
        let resolver = Arc::new(CachedDidResolver::new(
            Arc::new(layered),
            Duration::from_secs(86_400),
            500,
        ));

        let registry = revocation_registry(registry_address()).unwrap();
        let ledger = Arc::new(RegistryLedger::new(registry.clone()));
        ledger.set_balance(agent.address(), U256::exp10(19));

        let orchestrator = Arc::new(TransactionOrchestrator::new(
            ledger.clone(),
            agent.clone(),
            agent.clone(),
            resolver.clone(),
            1,
            Duration::from_secs(1_800),
        ));
        let store = Arc::new(MemoryStore::default());
        let credentials = Arc::new(
            CredentialService::new(
                orchestrator.clone(),
                resolver.clone(),
                AgentCapabilities::from_agent(agent.clone()),
                store.clone(),
                registry.clone(),
                CHAIN_ID,
            )
            .with_schema_registry(schema_registry(Address::repeat_byte(0x5c)).unwrap()),
        );

        Self { agent, remote, resolver, registry, ledger, orchestrator, credentials, store, chain_id: CHAIN_ID }
    }

    pub(crate) fn issuer_did(&self) -> String {
        self.agent.default_did()
    }

    /// Registers a holder controlled by `0x{byte}{byte}...` and returns its DID.
    pub(crate) fn add_holder(&self, byte: u8) -> String {
        let document = holder_document(Address::repeat_byte(byte), &[]);
        let did = document.id.clone();
        self.remote.insert(document);
        did
    }

    pub(crate) fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities::from_agent(self.agent.clone())
    }

    /// Gives the verifier an X25519 key and returns its kid.
    pub(crate) async fn enable_messaging(&self) -> String {
        let did = self.issuer_did();
        let kid = self.agent.add_key_agreement_key(&did).await.unwrap();
        self.resolver.invalidate(&did).await;
        kid
    }
}

/// A separate agent standing in for a credential holder. Its document, with a
/// key agreement key and messaging endpoints, is published to `env.remote`.
pub(crate) async fn holder_agent(env: &TestEnv) -> (Arc<KeyManager>, String) {
    let holder = Arc::new(KeyManager::random(CHAIN_ID, "sepolia"));
    let did = holder.default_did();
    holder.add_key_agreement_key(&did).await.unwrap();
    for (fragment, service_type, endpoint) in [
        ("didcomm", DIDCOMM_SERVICE, "https://holder.example/didcomm"),
        ("verify", VERIFY_OWNERSHIP_SERVICE, "https://holder.example/verify"),
        ("credentials", RECEIVE_CREDENTIAL_SERVICE, "https://holder.example/credentials"),
    ] {
        let service = Service {
            id: format!("{}#{}", did, fragment),
            service_type: service_type.to_string(),
            service_endpoint: Value::String(endpoint.to_string()),
            description: None,
        };
        holder.add_service(&did, service).await.unwrap();
    }
    env.remote.insert(holder.resolve(&did).await.unwrap());
    (holder, did)
}

/// Channel that records deliveries instead of sending them.
#[derive(Default)]
pub(crate) struct RecordingChannel {
    delivered: Mutex<Vec<(String, PackedMessage)>>,
    fail: AtomicBool,
}

impl RecordingChannel {
    pub(crate) fn fail(&self, enabled: bool) {
        self.fail.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    pub(crate) fn last(&self) -> Option<(String, PackedMessage)> {
        self.delivered.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MessageChannel for RecordingChannel {
    async fn deliver(&self, endpoint: &str, packed: &PackedMessage) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::DeliveryFailed {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        self.delivered.lock().unwrap().push((endpoint.to_string(), packed.clone()));
        Ok(())
    }
}
