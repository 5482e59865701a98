// src/services/messaging.rs
//! Encrypted point-to-point messaging.
//!
//! Messages are wrapped in a DIDComm basic message, packed by the agent and
//! POSTed to the recipient's service endpoint of the requested type. Delivery
//! is at most once: failures are logged and reported, never retried.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::Value;

use crate::error::{AgentError, TransportError};
use crate::models::message::{DidCommMessage, EncryptionMode, PackedMessage, UnpackedMessage};
use crate::services::did_resolver::{CachedDidResolver, DidResolver};
use crate::wallet::capabilities::AgentCapabilities;

pub const DIDCOMM_SERVICE: &str = "DIDCommMessaging";
pub const VERIFY_OWNERSHIP_SERVICE: &str = "verifyOwnership";
pub const REPORT_ABUSE_SERVICE: &str = "reportAbuse";
pub const RECEIVE_CREDENTIAL_SERVICE: &str = "receiveCredential";

/// Delivers a packed message to an endpoint.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn deliver(&self, endpoint: &str, packed: &PackedMessage) -> Result<(), TransportError>;
}

/// HTTP delivery: `POST {endpoint}` with the packed message as JSON.
pub struct HttpChannel {
    client: reqwest::Client,
}

impl HttpChannel {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::DeliveryFailed {
                endpoint: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageChannel for HttpChannel {
    async fn deliver(&self, endpoint: &str, packed: &PackedMessage) -> Result<(), TransportError> {
        let failed = |reason: String| TransportError::DeliveryFailed {
            endpoint: endpoint.to_string(),
            reason,
        };

        let response = self
            .client
            .post(endpoint)
            .json(packed)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        // Endpoints usually answer `{"error": "..."}`
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        Err(failed(format!("{} - {}", status, detail)))
    }
}

pub struct MessagingTransport {
    resolver: Arc<CachedDidResolver>,
    agent: AgentCapabilities,
    channel: Arc<dyn MessageChannel>,
}

impl MessagingTransport {
    pub fn new(resolver: Arc<CachedDidResolver>, agent: AgentCapabilities, channel: Arc<dyn MessageChannel>) -> Self {
        Self { resolver, agent, channel }
    }

    /// Sends `body` from `sender_did` to the `service_type` endpoint of `recipient_did`.
    ///
    /// # Errors
    /// - `EndpointNotFound` when the recipient advertises no such service
    /// - `EncryptionKeyMissing` when encrypting and the sender has no X25519 key
    /// - `RecipientKeyMissing` when encrypting and the recipient has no key agreement key
    /// - `DeliveryFailed` when the endpoint is unreachable or rejects the message
    pub async fn send(
        &self,
        sender_did: &str,
        recipient_did: &str,
        body: Value,
        service_type: &str,
        mode: EncryptionMode,
    ) -> Result<String, TransportError> {
        let recipient = self.resolver.resolve(recipient_did).await?;
        let endpoint = recipient
            .service_of_type(service_type)
            .and_then(|service| service.endpoint_url())
            .ok_or_else(|| TransportError::EndpointNotFound {
                did: recipient_did.to_string(),
                service_type: service_type.to_string(),
            })?
            .to_string();

        let sender_kid = match mode {
            EncryptionMode::None => None,
            EncryptionMode::Authcrypt | EncryptionMode::Anoncrypt => {
                let kid = self
                    .agent
                    .key_agreement_kid(sender_did)
                    .await
                    .map_err(TransportError::Agent)?;
                Some(kid.ok_or_else(|| TransportError::EncryptionKeyMissing(sender_did.to_string()))?)
            }
        };

        let message = DidCommMessage::basic(sender_did, recipient_did, body);
        let packed = self
            .agent
            .packer
            .pack(&message, mode, sender_kid.as_deref(), &recipient)
            .await
            .map_err(|e| match e {
                AgentError::NoKeyAgreementKey(did) if did == recipient.id => TransportError::RecipientKeyMissing(did),
                other => TransportError::Agent(other),
            })?;

        info!("Sending {} to {} at {} ({:?})", message.id, recipient_did, endpoint, mode);
        if let Err(e) = self.channel.deliver(&endpoint, &packed).await {
            error!("Message {} to {} failed: {}", message.id, recipient_did, e);
            return Err(e);
        }
        Ok(message.id)
    }

    /// Unpacks an inbound message. Failures are reported, never propagated as panics.
    pub async fn receive(&self, packed: &PackedMessage) -> Result<UnpackedMessage, TransportError> {
        let resolver: &dyn DidResolver = self.resolver.as_ref();
        self.agent.packer.unpack(packed, resolver).await.map_err(|e| {
            warn!("Failed to unpack inbound message: {}", e);
            TransportError::UnpackError(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{holder_agent, RecordingChannel, TestEnv};
    use crate::wallet::capabilities::MessagePacker;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn transport(env: &TestEnv, channel: Arc<dyn MessageChannel>) -> MessagingTransport {
        MessagingTransport::new(env.resolver.clone(), env.capabilities(), channel)
    }

    #[tokio::test]
    async fn test_authcrypt_message_reaches_recipient() {
        let env = TestEnv::new().await;
        env.enable_messaging().await;
        let (holder, holder_did) = holder_agent(&env).await;
        let channel = Arc::new(RecordingChannel::default());
        let transport = transport(&env, channel.clone());

        transport
            .send(&env.issuer_did(), &holder_did, json!({"hello": "world"}), DIDCOMM_SERVICE, EncryptionMode::Authcrypt)
            .await
            .unwrap();

        let (endpoint, packed) = channel.last().unwrap();
        assert_eq!(endpoint, "https://holder.example/didcomm");
        let unpacked = holder.unpack(&packed, env.resolver.as_ref()).await.unwrap();
        assert_eq!(unpacked.packing, EncryptionMode::Authcrypt);
        assert_eq!(unpacked.message.from.as_deref(), Some(env.issuer_did().as_str()));
        assert_eq!(unpacked.message.body, json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn test_missing_service_endpoint() {
        let env = TestEnv::new().await;
        env.enable_messaging().await;
        let holder_did = env.add_holder(0x42);
        let transport = transport(&env, Arc::new(RecordingChannel::default()));

        let err = transport
            .send(&env.issuer_did(), &holder_did, json!({}), VERIFY_OWNERSHIP_SERVICE, EncryptionMode::Authcrypt)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::EndpointNotFound { .. }));
    }

    #[tokio::test]
    async fn test_encryption_requires_sender_key() {
        let env = TestEnv::new().await;
        let (_, holder_did) = holder_agent(&env).await;
        let channel = Arc::new(RecordingChannel::default());
        let transport = transport(&env, channel.clone());

        let err = transport
            .send(&env.issuer_did(), &holder_did, json!({}), DIDCOMM_SERVICE, EncryptionMode::Anoncrypt)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::EncryptionKeyMissing(_)));

        // Plaintext needs no key
        transport
            .send(&env.issuer_did(), &holder_did, json!({}), DIDCOMM_SERVICE, EncryptionMode::None)
            .await
            .unwrap();
        assert_eq!(channel.count(), 1);
    }

    #[tokio::test]
    async fn test_receive_garbage_is_unpack_error() {
        let env = TestEnv::new().await;
        let transport = transport(&env, Arc::new(RecordingChannel::default()));
        let err = transport
            .receive(&PackedMessage { message: "{not json".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnpackError(_)));
    }

    #[tokio::test]
    async fn test_http_channel_posts_packed_message() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/didcomm")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({"message": "hello"})))
            .with_status(202)
            .create_async()
            .await;

        let channel = HttpChannel::new(Duration::from_secs(5)).unwrap();
        channel
            .deliver(&format!("{}/didcomm", server.url()), &PackedMessage { message: "hello".into() })
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_channel_reports_rejection() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/didcomm")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"unknown recipient"}"#)
            .create_async()
            .await;

        let channel = HttpChannel::new(Duration::from_secs(5)).unwrap();
        let err = channel
            .deliver(&format!("{}/didcomm", server.url()), &PackedMessage { message: "hello".into() })
            .await
            .unwrap_err();
        match err {
            TransportError::DeliveryFailed { reason, .. } => assert!(reason.contains("unknown recipient")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
