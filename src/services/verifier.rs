// src/services/verifier.rs
//! Ownership verification by challenge and response.
//!
//! A single registry task owns every pending challenge. Registration, timer
//! expiry and inbound responses all arrive as commands on one channel, so each
//! transition runs to completion before the next one is looked at:
//!
//! ```text
//! Idle -> ChallengeSent -> Verified | TimedOut | Superseded
//! ```
//!
//! Timers carry the generation of the entry they were started for. An expiry
//! whose generation no longer matches (answered, replaced, aborted) is ignored,
//! and a response arriving after expiry finds no entry and is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::RngCore;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::ChallengeError;
use crate::models::message::{EncryptionMode, PackedMessage};
use crate::services::messaging::{MessagingTransport, VERIFY_OWNERSHIP_SERVICE};

pub const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(300);

const COMMAND_BUFFER: usize = 64;

/// How a challenge ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ChallengeOutcome {
    Verified { did: String, response: Value },
    TimedOut { did: String },
    /// A newer challenge for the same DID replaced this one
    Superseded { did: String },
}

/// Returned to whoever started a challenge.
#[derive(Debug)]
pub struct ChallengeHandle {
    did: String,
    challenge: String,
    outcome: oneshot::Receiver<ChallengeOutcome>,
}

impl ChallengeHandle {
    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    /// Waits for the challenge to end.
    pub async fn outcome(self) -> ChallengeOutcome {
        // The registry only drops a reply sender when it shuts down or
        // replaces the entry.
        self.outcome
            .await
            .unwrap_or(ChallengeOutcome::Superseded { did: self.did })
    }
}

enum Command {
    Register {
        did: String,
        challenge: String,
        reply: oneshot::Sender<ChallengeOutcome>,
        ack: oneshot::Sender<u64>,
    },
    Respond {
        did: String,
        challenge: String,
        response: Value,
        ack: oneshot::Sender<Result<(), ChallengeError>>,
    },
    Expire {
        did: String,
        generation: u64,
    },
    Abort {
        did: String,
        generation: u64,
    },
    Count {
        ack: oneshot::Sender<usize>,
    },
}

struct PendingChallenge {
    challenge: String,
    generation: u64,
    reply: oneshot::Sender<ChallengeOutcome>,
    timer: JoinHandle<()>,
}

struct ChallengeRegistry {
    pending: HashMap<String, PendingChallenge>,
    next_generation: u64,
    timeout: Duration,
    // Weak so that timers alone do not keep the registry alive
    commands: mpsc::WeakSender<Command>,
}

impl ChallengeRegistry {
    async fn run(mut self, mut inbox: mpsc::Receiver<Command>) {
        while let Some(command) = inbox.recv().await {
            self.handle(command);
        }
        for (_, entry) in self.pending.drain() {
            entry.timer.abort();
        }
        debug!("Challenge registry stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { did, challenge, reply, ack } => {
                let generation = self.register(did, challenge, reply);
                let _ = ack.send(generation);
            }
            Command::Respond { did, challenge, response, ack } => {
                let _ = ack.send(self.respond(&did, &challenge, response));
            }
            Command::Expire { did, generation } => {
                if let Some(entry) = self.take_generation(&did, generation) {
                    info!("Challenge for {} timed out", did);
                    let _ = entry.reply.send(ChallengeOutcome::TimedOut { did });
                }
            }
            Command::Abort { did, generation } => {
                if let Some(entry) = self.take_generation(&did, generation) {
                    entry.timer.abort();
                    debug!("Challenge for {} aborted", did);
                }
            }
            Command::Count { ack } => {
                let _ = ack.send(self.pending.len());
            }
        }
    }

    fn register(&mut self, did: String, challenge: String, reply: oneshot::Sender<ChallengeOutcome>) -> u64 {
        if let Some(previous) = self.pending.remove(&did) {
            previous.timer.abort();
            debug!("Replacing pending challenge for {}", did);
            let _ = previous.reply.send(ChallengeOutcome::Superseded { did: did.clone() });
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let timer = tokio::spawn({
            let commands = self.commands.clone();
            let timeout = self.timeout;
            let did = did.clone();
            async move {
                tokio::time::sleep(timeout).await;
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(Command::Expire { did, generation }).await;
                }
            }
        });

        self.pending.insert(did, PendingChallenge { challenge, generation, reply, timer });
        generation
    }

    fn respond(&mut self, did: &str, challenge: &str, response: Value) -> Result<(), ChallengeError> {
        let entry = self
            .pending
            .get(did)
            .ok_or_else(|| ChallengeError::NoPendingChallenge(did.to_string()))?;
        if entry.challenge != challenge {
            // The legitimate response may still arrive
            return Err(ChallengeError::InvalidChallenge(did.to_string()));
        }

        if let Some(entry) = self.pending.remove(did) {
            entry.timer.abort();
            let _ = entry.reply.send(ChallengeOutcome::Verified { did: did.to_string(), response });
        }
        Ok(())
    }

    fn take_generation(&mut self, did: &str, generation: u64) -> Option<PendingChallenge> {
        match self.pending.get(did) {
            Some(entry) if entry.generation == generation => self.pending.remove(did),
            _ => None,
        }
    }
}

/// Client of the challenge registry. Cheap to clone; the registry stops once
/// every clone is dropped.
#[derive(Clone)]
pub struct OwnershipVerifier {
    commands: mpsc::Sender<Command>,
    transport: Arc<MessagingTransport>,
}

impl OwnershipVerifier {
    /// Starts the registry task. Must be called inside a tokio runtime.
    pub fn spawn(transport: Arc<MessagingTransport>, timeout: Duration) -> Self {
        let (commands, inbox) = mpsc::channel(COMMAND_BUFFER);
        let registry = ChallengeRegistry {
            pending: HashMap::new(),
            next_generation: 0,
            timeout,
            commands: commands.downgrade(),
        };
        tokio::spawn(registry.run(inbox));
        Self { commands, transport }
    }

    /// Sends a fresh challenge from `verifier_did` to `did` and registers it.
    ///
    /// Any challenge already pending for `did` ends as
    /// [`ChallengeOutcome::Superseded`]. If the challenge cannot be delivered
    /// the new entry is removed again before the error is returned.
    pub async fn challenge_ownership(&self, verifier_did: &str, did: &str) -> Result<ChallengeHandle, ChallengeError> {
        let challenge = new_challenge();
        let (reply, outcome) = oneshot::channel();
        let (ack, registered) = oneshot::channel();
        self.command(Command::Register {
            did: did.to_string(),
            challenge: challenge.clone(),
            reply,
            ack,
        })
        .await?;
        let generation = registered.await.map_err(|_| ChallengeError::RegistryStopped)?;

        let body = json!({ "challenge": challenge });
        if let Err(e) = self
            .transport
            .send(verifier_did, did, body, VERIFY_OWNERSHIP_SERVICE, EncryptionMode::Authcrypt)
            .await
        {
            warn!("Could not deliver challenge to {}: {}", did, e);
            self.command(Command::Abort { did: did.to_string(), generation }).await?;
            return Err(e.into());
        }

        info!("Challenge sent to {}", did);
        Ok(ChallengeHandle { did: did.to_string(), challenge, outcome })
    }

    /// Matches an inbound response against the pending challenge of its sender.
    ///
    /// Returns the verified DID. Only sender-authenticated (authcrypt) messages
    /// are accepted, with a body of `{"challenge": "...", "response": ...}`.
    pub async fn handle_response(&self, packed: &PackedMessage) -> Result<String, ChallengeError> {
        let unpacked = self.transport.receive(packed).await?;
        if unpacked.packing != EncryptionMode::Authcrypt {
            return Err(ChallengeError::MalformedResponse("response is not sender-authenticated".into()));
        }

        let message = unpacked.message;
        let did = message
            .from
            .ok_or_else(|| ChallengeError::MalformedResponse("missing sender".into()))?;
        let challenge = message
            .body
            .get("challenge")
            .and_then(Value::as_str)
            .ok_or_else(|| ChallengeError::MalformedResponse("missing challenge".into()))?
            .to_string();
        let response = message
            .body
            .get("response")
            .cloned()
            .ok_or_else(|| ChallengeError::MalformedResponse("missing response".into()))?;

        let (ack, result) = oneshot::channel();
        self.command(Command::Respond { did: did.clone(), challenge, response, ack }).await?;
        result.await.map_err(|_| ChallengeError::RegistryStopped)??;

        info!("Ownership of {} verified", did);
        Ok(did)
    }

    /// Number of challenges awaiting a response.
    pub async fn pending_count(&self) -> Result<usize, ChallengeError> {
        let (ack, count) = oneshot::channel();
        self.command(Command::Count { ack }).await?;
        count.await.map_err(|_| ChallengeError::RegistryStopped)
    }

    async fn command(&self, command: Command) -> Result<(), ChallengeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChallengeError::RegistryStopped)
    }
}

fn new_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    ethers_core::utils::hex::encode(bytes)
}
