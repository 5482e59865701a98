// src/services/api_server.rs
//! REST API of the verifier.
//!
//! Built on axum. Endpoints cover:
//! - the verifier identity (`/identifier-info`, `/initialize-did`, `/clear-did`, `/transfer-funds`)
//! - credential issuance, revocation, status, verification and archival
//! - credential bindings and the identities behind them
//! - ownership challenges and their inbound responses
//! - the generic DIDComm inbox and abuse reports
//!
//! Every failure renders as `{"error": "..."}`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers_core::types::{Address, TransactionReceipt};
use ethers_core::utils::format_ether;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tower_http::cors::CorsLayer;

use crate::blockchain::ledger::LedgerClient;
use crate::error::{
    AgentError, BindingError, ChallengeError, CredentialError, LedgerError, ResolutionError, StorageError,
    TransactionError, TransportError,
};
use crate::models::credential::{CredentialStatus, IssuedCredential, RevocationRecord, VerifiableCredential};
use crate::models::message::PackedMessage;
use crate::services::binding::{BindingService, BoundIdentity, IssuedBinding};
use crate::services::credential_issuer::CredentialService;
use crate::services::did_resolver::CachedDidResolver;
use crate::services::identity::{ClearedDid, IdentityService};
use crate::services::messaging::MessagingTransport;
use crate::services::verifier::{ChallengeOutcome, OwnershipVerifier};

// =====================
// Request and response payloads
// =====================

/// Request payload naming a DID
#[derive(Deserialize)]
struct DidRequest {
    did: String,
}

/// Response for operations that only report success
#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClearDidResponse {
    message: String,
    removed: ClearedDid,
}

/// Request payload for sweeping a managed DID's balance
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferFundsRequest {
    recipient: Address,
    /// Managed DID to send from; the verifier's own DID when absent
    did: Option<String>,
}

#[derive(Serialize)]
struct TransferFundsResponse {
    message: String,
    #[serde(flatten)]
    transaction: TransactionResponse,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentifierInfoResponse {
    did: String,
    eth_address: String,
    /// In ether
    balance: String,
}

/// Request payload for issuing a credential
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueCredentialRequest {
    holder_did: String,
    #[serde(default)]
    claims: Map<String, Value>,
    /// Validity in seconds
    ttl: u64,
    schema_name: Option<String>,
}

/// Request payload for binding a real-world identity to a holder
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueBindingRequest {
    holder_did: String,
    identity: Map<String, Value>,
    schema_name: Option<String>,
}

/// Request payload for revoking a credential
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeCredentialRequest {
    holder_did: String,
    credential_id: String,
    /// Submit a signed authorization instead of revoking directly
    #[serde(default)]
    delegated: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionResponse {
    tx_hash: String,
    block_number: Option<u64>,
}

impl From<TransactionReceipt> for TransactionResponse {
    fn from(receipt: TransactionReceipt) -> Self {
        Self {
            tx_hash: format!("{:?}", receipt.transaction_hash),
            block_number: receipt.block_number.map(|n| n.as_u64()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RevocationStatusResponse {
    credential_id: String,
    revoked: bool,
}

#[derive(Serialize)]
struct HolderCredentialsResponse {
    credentials: Vec<RevocationRecord>,
}

#[derive(Serialize)]
struct ArchiveResponse {
    cid: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyCredentialResponse {
    #[serde(flatten)]
    status: CredentialStatus,
    valid: bool,
}

#[derive(Serialize)]
struct OwnershipResponse {
    did: String,
    response: Value,
}

// =====================
// Errors
// =====================

/// Failure of a request, rendered as `{"error": "..."}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Challenge(#[from] ChallengeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Ownership challenge for {0} timed out")]
    ChallengeTimedOut(String),

    #[error("Ownership challenge for {0} was replaced by a newer one")]
    ChallengeSuperseded(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Credential(e) => credential_status(e),
            ApiError::Binding(e) => binding_status(e),
            ApiError::Transaction(e) => transaction_status(e),
            ApiError::Challenge(e) => challenge_status(e),
            ApiError::Transport(e) => transport_status(e),
            ApiError::Agent(e) => agent_status(e),
            ApiError::Resolution(e) => resolution_status(e),
            ApiError::Ledger(LedgerError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Ledger(LedgerError::Rpc(_)) => StatusCode::BAD_GATEWAY,
            ApiError::ChallengeTimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::ChallengeSuperseded(_) => StatusCode::CONFLICT,
        }
    }
}

fn credential_status(e: &CredentialError) -> StatusCode {
    match e {
        CredentialError::HolderNotFound(_) => StatusCode::NOT_FOUND,
        CredentialError::InvalidTtl(_) | CredentialError::Serialization(_) => StatusCode::BAD_REQUEST,
        CredentialError::AlreadyRevoked(_) | CredentialError::NonceExhausted { .. } => StatusCode::CONFLICT,
        CredentialError::InvalidRecord(_) => StatusCode::BAD_GATEWAY,
        CredentialError::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
        CredentialError::Storage(_) => StatusCode::BAD_GATEWAY,
        CredentialError::Resolution(e) => resolution_status(e),
        CredentialError::Agent(e) => agent_status(e),
        CredentialError::Transaction(e) => transaction_status(e),
    }
}

fn binding_status(e: &BindingError) -> StatusCode {
    match e {
        BindingError::UnknownBinding(_) => StatusCode::NOT_FOUND,
        BindingError::HashMismatch { .. } => StatusCode::CONFLICT,
        BindingError::Delivery(e) => transport_status(e),
        BindingError::Credential(e) => credential_status(e),
    }
}

fn transaction_status(e: &TransactionError) -> StatusCode {
    match e {
        TransactionError::Timeout { .. } | TransactionError::ConfirmationUnknown { .. } => {
            StatusCode::GATEWAY_TIMEOUT
        }
        TransactionError::SenderNotManaged(_) | TransactionError::NoSigningKeyFound(_) => StatusCode::FORBIDDEN,
        TransactionError::Resolution(e) => resolution_status(e),
        TransactionError::NonceConflict(_) => StatusCode::CONFLICT,
        TransactionError::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        TransactionError::UnknownFunction(_) | TransactionError::Encoding(_) | TransactionError::Signing(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn resolution_status(e: &ResolutionError) -> StatusCode {
    match e {
        ResolutionError::NotFound(_) => StatusCode::NOT_FOUND,
        ResolutionError::InvalidDid(_) => StatusCode::BAD_REQUEST,
        ResolutionError::AddressNotFound(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ResolutionError::Failed { .. } => StatusCode::BAD_GATEWAY,
    }
}

fn agent_status(e: &AgentError) -> StatusCode {
    match e {
        AgentError::NotManaged(_) => StatusCode::FORBIDDEN,
        AgentError::Resolution(e) => resolution_status(e),
        AgentError::Unpacking(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn challenge_status(e: &ChallengeError) -> StatusCode {
    match e {
        ChallengeError::NoPendingChallenge(_)
        | ChallengeError::InvalidChallenge(_)
        | ChallengeError::MalformedResponse(_) => StatusCode::BAD_REQUEST,
        ChallengeError::RegistryStopped => StatusCode::SERVICE_UNAVAILABLE,
        ChallengeError::Transport(e) => transport_status(e),
    }
}

fn transport_status(e: &TransportError) -> StatusCode {
    match e {
        TransportError::EndpointNotFound { .. } | TransportError::RecipientKeyMissing(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        TransportError::EncryptionKeyMissing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        TransportError::DeliveryFailed { .. } => StatusCode::BAD_GATEWAY,
        TransportError::UnpackError(_) => StatusCode::BAD_REQUEST,
        TransportError::Resolution(e) => resolution_status(e),
        TransportError::Agent(e) => agent_status(e),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{} ({})", self, status);
        } else {
            warn!("{} ({})", self, status);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// =====================
// Server
// =====================

/// API server state containing all service dependencies
#[derive(Clone)]
pub struct ApiServer {
    credentials: Arc<CredentialService>,
    bindings: Arc<BindingService>,
    verifier: OwnershipVerifier,
    transport: Arc<MessagingTransport>,
    identity: Arc<IdentityService>,
    resolver: Arc<CachedDidResolver>,
    ledger: Arc<dyn LedgerClient>,
}

impl ApiServer {
    pub fn new(
        credentials: Arc<CredentialService>,
        bindings: Arc<BindingService>,
        verifier: OwnershipVerifier,
        transport: Arc<MessagingTransport>,
        identity: Arc<IdentityService>,
        resolver: Arc<CachedDidResolver>,
        ledger: Arc<dyn LedgerClient>,
    ) -> Self {
        Self { credentials, bindings, verifier, transport, identity, resolver, ledger }
    }

    /// All routes, with this server as shared state.
    pub fn router(self) -> Router {
        Router::new()
            .route("/identifier-info", get(Self::identifier_info_handler))
            .route("/initialize-did", post(Self::initialize_did_handler))
            .route("/clear-did", post(Self::clear_did_handler))
            .route("/transfer-funds", post(Self::transfer_funds_handler))
            .route("/credentials", post(Self::issue_credential_handler))
            .route("/credentials/revoke", post(Self::revoke_credential_handler))
            .route("/credentials/verify", post(Self::verify_credential_handler))
            .route("/credentials/binding", post(Self::issue_binding_handler))
            .route("/bindings/:id/identity", get(Self::bound_identity_handler))
            .route("/archive", post(Self::archive_credential_handler))
            .route("/archive/:cid", get(Self::retrieve_credential_handler))
            .route("/credentials/:id/status", get(Self::credential_status_handler))
            .route("/holders/:did/credentials", get(Self::holder_credentials_handler))
            .route("/challenge-ownership", post(Self::challenge_ownership_handler))
            .route("/ownership-verification", post(Self::ownership_verification_handler))
            .route("/didcomm", post(Self::didcomm_handler))
            .route("/report-abuse", post(Self::report_abuse_handler))
            .layer(CorsLayer::permissive())
            .with_state(Arc::new(self))
    }

    /// Binds `addr` and serves until the process stops.
    pub async fn run(self, addr: SocketAddr) -> std::io::Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Verifier REST API listening on {}", addr);
        axum::serve(listener, app).await
    }

    // =====================
    // Identity handlers
    // =====================

    /// GET /identifier-info
    ///
    /// The verifier's DID, its chain address and balance.
    async fn identifier_info_handler(State(state): State<Arc<ApiServer>>) -> ApiResult<IdentifierInfoResponse> {
        let did = state.credentials.issuer_did();
        let address = state.resolver.derive_address(&did).await?;
        let balance = state.ledger.balance(address).await?;
        Ok(Json(IdentifierInfoResponse {
            did,
            eth_address: format!("{:?}", address),
            balance: format_ether(balance),
        }))
    }

    /// POST /initialize-did
    async fn initialize_did_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<DidRequest>,
    ) -> ApiResult<MessageResponse> {
        state.identity.initialize_did(&payload.did).await?;
        Ok(Json(MessageResponse { message: format!("DID {} initialized successfully", payload.did) }))
    }

    /// POST /clear-did
    ///
    /// Removes the DID's services and key agreement keys.
    async fn clear_did_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<DidRequest>,
    ) -> ApiResult<ClearDidResponse> {
        let removed = state.identity.clear_did(&payload.did).await?;
        Ok(Json(ClearDidResponse { message: format!("DID {} cleared successfully", payload.did), removed }))
    }

    /// POST /transfer-funds
    ///
    /// Sends the DID's whole balance, minus the transfer fee, to `recipient`.
    ///
    /// # Responses
    /// - 200 OK: transaction hash of the transfer
    /// - 403 Forbidden: the DID is not managed by this agent
    /// - 422 Unprocessable Entity: the balance does not cover the fee
    async fn transfer_funds_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<TransferFundsRequest>,
    ) -> ApiResult<TransferFundsResponse> {
        let sender = payload.did.unwrap_or_else(|| state.credentials.issuer_did());
        let receipt = state
            .credentials
            .orchestrator()
            .transfer_all(&sender, payload.recipient, state.credentials.chain_id())
            .await?;
        Ok(Json(TransferFundsResponse {
            message: format!("Funds transferred to {:?}", payload.recipient),
            transaction: receipt.into(),
        }))
    }

    // =====================
    // Credential handlers
    // =====================

    /// POST /credentials
    ///
    /// # Responses
    /// - 200 OK: the signed credential and its registry receipt
    /// - 404 Not Found: the holder DID cannot be resolved
    /// - 504 Gateway Timeout: the registry entry is not confirmed yet; query the status before retrying
    async fn issue_credential_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<IssueCredentialRequest>,
    ) -> ApiResult<IssuedCredential> {
        let issued = state
            .credentials
            .issue(&payload.holder_did, payload.claims, payload.ttl, payload.schema_name.as_deref())
            .await?;
        Ok(Json(issued))
    }

    /// POST /credentials/revoke
    ///
    /// # Responses
    /// - 200 OK: transaction hash of the revocation
    /// - 409 Conflict: already revoked, or the signed revocation kept losing its nonce
    async fn revoke_credential_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<RevokeCredentialRequest>,
    ) -> ApiResult<TransactionResponse> {
        let receipt = if payload.delegated {
            state
                .credentials
                .revoke_with_signature(&payload.holder_did, &payload.credential_id)
                .await?
        } else {
            state.credentials.revoke(&payload.holder_did, &payload.credential_id).await?
        };
        Ok(Json(receipt.into()))
    }

    /// POST /credentials/binding
    ///
    /// Issues the identity credential, archives it encrypted and sends the
    /// holder a `CredentialBinding` credential.
    ///
    /// # Responses
    /// - 200 OK: the binding; `messageId` is null when delivery to the holder failed
    /// - 404 Not Found: the holder DID cannot be resolved
    async fn issue_binding_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<IssueBindingRequest>,
    ) -> ApiResult<IssuedBinding> {
        let issued = state
            .bindings
            .issue_binding(&payload.holder_did, payload.identity, payload.schema_name.as_deref())
            .await?;
        Ok(Json(issued))
    }

    /// GET /bindings/:id/identity
    ///
    /// # Responses
    /// - 200 OK: the identity behind the binding credential
    /// - 404 Not Found: no identity archived for this binding
    /// - 409 Conflict: the archived identity does not match the bound hash
    async fn bound_identity_handler(
        Path(binding_id): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<BoundIdentity> {
        Ok(Json(state.bindings.retrieve_identity(&binding_id).await?))
    }

    /// GET /credentials/:id/status
    async fn credential_status_handler(
        Path(credential_id): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<RevocationStatusResponse> {
        let revoked = state.credentials.is_revoked(&credential_id).await?;
        Ok(Json(RevocationStatusResponse { credential_id, revoked }))
    }

    /// POST /credentials/verify
    async fn verify_credential_handler(
        State(state): State<Arc<ApiServer>>,
        Json(credential): Json<VerifiableCredential>,
    ) -> ApiResult<VerifyCredentialResponse> {
        let status = state.credentials.verify(&credential).await?;
        let valid = status.is_valid();
        Ok(Json(VerifyCredentialResponse { status, valid }))
    }

    /// POST /archive
    async fn archive_credential_handler(
        State(state): State<Arc<ApiServer>>,
        Json(credential): Json<VerifiableCredential>,
    ) -> ApiResult<ArchiveResponse> {
        let cid = state.credentials.archive(&credential).await?;
        Ok(Json(ArchiveResponse { cid }))
    }

    /// GET /archive/:cid
    async fn retrieve_credential_handler(
        Path(cid): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<VerifiableCredential> {
        Ok(Json(state.credentials.retrieve(&cid).await?))
    }

    /// GET /holders/:did/credentials
    ///
    /// Registry entries the verifier issued to the holder.
    async fn holder_credentials_handler(
        Path(holder_did): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<HolderCredentialsResponse> {
        let credentials = state.credentials.get_credentials_for_holder(&holder_did).await?;
        Ok(Json(HolderCredentialsResponse { credentials }))
    }

    // =====================
    // Ownership and messaging handlers
    // =====================

    /// POST /challenge-ownership
    ///
    /// Sends a challenge to the DID and waits for the outcome.
    ///
    /// # Responses
    /// - 200 OK: the DID answered; its response value is returned
    /// - 409 Conflict: a newer challenge for the same DID replaced this one
    /// - 504 Gateway Timeout: no valid answer before the challenge expired
    async fn challenge_ownership_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<DidRequest>,
    ) -> ApiResult<OwnershipResponse> {
        let verifier_did = state.credentials.issuer_did();
        let handle = state.verifier.challenge_ownership(&verifier_did, &payload.did).await?;
        match handle.outcome().await {
            ChallengeOutcome::Verified { did, response } => Ok(Json(OwnershipResponse { did, response })),
            ChallengeOutcome::TimedOut { did } => Err(ApiError::ChallengeTimedOut(did)),
            ChallengeOutcome::Superseded { did } => Err(ApiError::ChallengeSuperseded(did)),
        }
    }

    /// POST /ownership-verification
    ///
    /// Inbound challenge response from a holder agent.
    ///
    /// # Responses
    /// - 200 OK: the response settled a pending challenge
    /// - 202 Accepted: no challenge is pending for the sender; the response is dropped
    /// - 400 Bad Request: the response is malformed or does not match the challenge
    async fn ownership_verification_handler(
        State(state): State<Arc<ApiServer>>,
        Json(packed): Json<PackedMessage>,
    ) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
        match state.verifier.handle_response(&packed).await {
            Ok(did) => Ok((StatusCode::OK, Json(MessageResponse { message: format!("Ownership of {} verified", did) }))),
            Err(ChallengeError::NoPendingChallenge(did)) => {
                debug!("Dropped response from {}: no pending challenge", did);
                Ok((
                    StatusCode::ACCEPTED,
                    Json(MessageResponse { message: format!("No pending challenge for {}; response dropped", did) }),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// POST /didcomm
    async fn didcomm_handler(
        State(state): State<Arc<ApiServer>>,
        Json(packed): Json<PackedMessage>,
    ) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
        let unpacked = state.transport.receive(&packed).await?;
        info!(
            "Received {} from {} ({:?})",
            unpacked.message.id,
            unpacked.message.from.as_deref().unwrap_or("anonymous sender"),
            unpacked.packing
        );
        Ok((StatusCode::ACCEPTED, Json(MessageResponse { message: unpacked.message.id })))
    }

    /// POST /report-abuse
    async fn report_abuse_handler(
        State(state): State<Arc<ApiServer>>,
        Json(packed): Json<PackedMessage>,
    ) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
        let unpacked = state.transport.receive(&packed).await?;
        warn!(
            "Abuse report from {}: {}",
            unpacked.message.from.as_deref().unwrap_or("anonymous sender"),
            unpacked.message.body
        );
        Ok((StatusCode::ACCEPTED, Json(MessageResponse { message: "Report received".into() })))
    }
}
