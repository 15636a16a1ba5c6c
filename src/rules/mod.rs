// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Handlers for the wire methods: OFFER, AUDIT, CONSIGN, MIRROR,
//! RETRIEVE, PROBE, RENEW and TRIGGER. Each handler validates its input
//! before touching any store, performs its mutations through the storage
//! manager's transactional surface, and returns either a result payload
//! or a typed [`ProtocolError`] the dispatcher maps onto the wire.

mod triggers;

pub use triggers::{TriggerProcessor, TriggerRegistry};

use crate::audit::{ProofStream, ProofError};
use crate::contract::{Contract, SignatureRole, RESTRICTED_RENEWAL_FIELDS};
use crate::node::{Contact, Identity, NodeEvent, Transport};
use crate::offers::{Offer, OfferMap};
use crate::shard_server::{generate_token, Operation, ShardClient, TokenTable, TransferError};
use crate::store::{Error as StoreError, StorageAdapter, StorageItem, StorageManager};
use crate::utils::{is_hex_string, Clock};
use crate::crypto;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Cap on proofs generated concurrently for one AUDIT batch.
pub const MAX_CONCURRENT_AUDITS: usize = 10;

/// Forward slack on the CONSIGN window, permitting clock skew between
/// the renter and the farmer.
pub const CONSIGN_THRESHOLD_MS: u64 = 30 * 60 * 1000;

/// Read buffer size when piping a shard through a proof stream.
const PROOF_READ_BUF: usize = 64 * 1024;

/// Typed handler failures. Every variant surfaces on the wire as
/// `{ "error": { "message": ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid shard descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Incomplete contract")]
    IncompleteContract,
    #[error("Offers for this shard are closed")]
    OffersClosed,
    #[error("{0}")]
    OfferRejected(String),
    #[error("Consignment violates the contract time window")]
    ContractExpired,
    #[error("No storage contract with the requesting peer")]
    NotAuthorized,
    #[error("Shard not found")]
    ShardNotFound,
    #[error("Hash does not match the expected result")]
    HashMismatch,
    #[error("Failed to generate proof: {0}")]
    ProofGeneration(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Probe failed: {0}")]
    ProbeFailed(String),
    #[error("Trigger not registered: {0}")]
    UnknownTrigger(String),
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
    #[error("Storage error: {0}")]
    Store(String),
    #[error("Transfer error: {0}")]
    Transfer(String),
    #[error("Unexpected response: {0}")]
    BadResponse(String),
}

impl From<StoreError> for ProtocolError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ShardNotFound(_) => ProtocolError::ShardNotFound,
            other => ProtocolError::Store(other.to_string()),
        }
    }
}

impl From<crate::contract::Error> for ProtocolError {
    fn from(e: crate::contract::Error) -> Self {
        ProtocolError::InvalidDescriptor(e.to_string())
    }
}

impl From<TransferError> for ProtocolError {
    fn from(e: TransferError) -> Self {
        ProtocolError::Transfer(e.to_string())
    }
}

impl From<ProofError> for ProtocolError {
    fn from(e: ProofError) -> Self {
        ProtocolError::ProofGeneration(e.to_string())
    }
}

/// An inbound request: the sender's contact (verified by the transport
/// layer) and the method parameters.
#[derive(Debug, Clone)]
pub struct Request {
    pub contact: Contact,
    pub params: Value,
}

impl Request {
    pub fn new(contact: Contact, params: Value) -> Self {
        Request { contact, params }
    }

    fn param(&self, index: usize) -> Result<&Value, ProtocolError> {
        self.params
            .get(index)
            .ok_or_else(|| ProtocolError::InvalidDescriptor(format!("missing parameter {index}")))
    }

    fn param_str(&self, index: usize) -> Result<&str, ProtocolError> {
        self.param(index)?.as_str().ok_or_else(|| {
            ProtocolError::InvalidDescriptor(format!("parameter {index} must be a string"))
        })
    }
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    hash: String,
    challenge: String,
}

/// Knobs the handlers read; filled from the node configuration.
#[derive(Debug, Clone)]
pub struct RulesConfig {
    pub consign_threshold_ms: u64,
    pub max_concurrent_audits: usize,
}

impl Default for RulesConfig {
    fn default() -> Self {
        RulesConfig {
            consign_threshold_ms: CONSIGN_THRESHOLD_MS,
            max_concurrent_audits: MAX_CONCURRENT_AUDITS,
        }
    }
}

/// The protocol rule set. Owns nothing long-lived itself: stores, offer
/// streams and the token table are borrowed from the node through `Arc`s
/// and mutated only through their own transactional surfaces.
pub struct Rules<DB> {
    identity: Arc<Identity>,
    manager: Arc<StorageManager<DB>>,
    offers: Arc<OfferMap>,
    tokens: Arc<TokenTable>,
    transport: Arc<dyn Transport>,
    triggers: Arc<TriggerRegistry>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<NodeEvent>,
    client: ShardClient,
    config: RulesConfig,
}

impl<DB> Rules<DB>
where
    DB: StorageAdapter + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<Identity>,
        manager: Arc<StorageManager<DB>>,
        offers: Arc<OfferMap>,
        tokens: Arc<TokenTable>,
        transport: Arc<dyn Transport>,
        triggers: Arc<TriggerRegistry>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<NodeEvent>,
        config: RulesConfig,
    ) -> Self {
        Rules {
            identity,
            manager,
            offers,
            tokens,
            transport,
            triggers,
            clock,
            events,
            client: ShardClient::new(),
            config,
        }
    }

    /// Route a wire method to its handler.
    pub async fn dispatch(&self, method: &str, request: Request) -> Result<Value, ProtocolError> {
        match method {
            "OFFER" => self.offer(request).await,
            "AUDIT" => self.audit(request).await,
            "CONSIGN" => self.consign(request).await,
            "MIRROR" => self.mirror(request).await,
            "RETRIEVE" => self.retrieve(request).await,
            "PROBE" => self.probe(request).await,
            "RENEW" => self.renew(request).await,
            "TRIGGER" => self.trigger(request).await,
            other => Err(ProtocolError::UnknownMethod(other.to_owned())),
        }
    }

    /// OFFER: a farmer answers a published shard descriptor with a
    /// signed counter-offer. The renter countersigns, queues it on the
    /// published contract's offer stream and replies once the consumer
    /// settles it.
    async fn offer(&self, request: Request) -> Result<Value, ProtocolError> {
        let descriptor = request.param(0)?;
        let mut contract = Contract::from_value(descriptor)
            .map_err(|e| ProtocolError::InvalidDescriptor(e.to_string()))?;
        if !contract.is_valid() {
            return Err(ProtocolError::InvalidDescriptor(
                "contract fails schema validation".into(),
            ));
        }
        if !contract.verify(SignatureRole::Farmer) {
            return Err(ProtocolError::InvalidSignature);
        }

        contract.sign(SignatureRole::Renter, self.identity.secret())?;
        if !contract.is_complete() {
            return Err(ProtocolError::IncompleteContract);
        }

        let data_hash = contract.data_hash()?.to_owned();
        let Some(stream) = self.offers.get(&data_hash) else {
            debug!(%data_hash, farmer = %request.contact.id, "offer for unknown descriptor");
            let _ = self.events.send(NodeEvent::UnhandledOffer {
                contact: request.contact.clone(),
                data_hash: data_hash.clone(),
            });
            return Err(ProtocolError::OffersClosed);
        };

        let (offer, resolution) = Offer::new(request.contact, contract);
        stream.queue(offer)?;

        match resolution.await {
            Ok(Ok(contract)) => Ok(json!({ "contract": contract })),
            Ok(Err(error)) => Err(error),
            // Resolver dropped without an answer: stream torn down.
            Err(_) => Err(ProtocolError::OffersClosed),
        }
    }

    /// AUDIT: answer a batch of retention challenges. Failures on one
    /// shard never fail the batch; the affected entry carries a null
    /// proof instead. Output order mirrors the request order.
    async fn audit(&self, request: Request) -> Result<Value, ProtocolError> {
        let audits = request
            .params
            .as_array()
            .filter(|batch| !batch.is_empty())
            .ok_or_else(|| {
                ProtocolError::InvalidDescriptor("audit batch must be a non-empty array".into())
            })?;

        let proofs: Vec<Value> = futures::stream::iter(
            audits
                .iter()
                .map(|query| self.prove_retention(&request.contact, query)),
        )
        .buffered(self.config.max_concurrent_audits.max(1))
        .collect()
        .await;

        Ok(json!({ "proofs": proofs }))
    }

    /// Produce one `{ hash, proof }` entry; `proof` is null on any
    /// failure so the batch survives missing shards.
    async fn prove_retention(&self, contact: &Contact, query: &Value) -> Value {
        let fallback_hash = query.get("hash").cloned().unwrap_or(Value::Null);
        let failed = |reason: &str, hash: Value| {
            debug!(%hash, reason, "audit proof unavailable");
            json!({ "hash": hash, "proof": null })
        };

        let query: AuditQuery = match serde_json::from_value(query.clone()) {
            Ok(query) => query,
            Err(_) => return failed("malformed audit query", fallback_hash),
        };
        let hash = Value::String(query.hash.clone());

        let item = match self.manager.load(&query.hash) {
            Ok(item) => item,
            Err(_) => return failed("no storage item", hash),
        };
        let Some(leaves) = item
            .audit_leaves(contact)
            .cloned()
            .or_else(|| item.contract(contact).map(|c| c.audit_leaves.clone()))
        else {
            return failed("no audit tree for peer", hash);
        };

        let mut proof = match ProofStream::new(&leaves, &query.challenge) {
            Ok(proof) => proof,
            Err(_) => return failed("bad challenge or leaves", hash),
        };
        let mut reader = match self.manager.shard_reader(&query.hash).await {
            Ok(reader) => reader,
            Err(_) => return failed("shard unreadable", hash),
        };

        let mut buffer = vec![0u8; PROOF_READ_BUF];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => proof.write(&buffer[..n]),
                Err(_) => return failed("shard read failed", hash),
            }
        }

        match proof.finish() {
            Ok(branch) => json!({ "hash": query.hash, "proof": branch.to_value() }),
            Err(_) => failed("proof generation failed", hash),
        }
    }

    /// CONSIGN: grant a PUSH token to the renter of a stored contract,
    /// provided the contract window (with forward slack) is open.
    async fn consign(&self, request: Request) -> Result<Value, ProtocolError> {
        let data_hash = request.param_str(0)?;
        if !is_hex_string(data_hash, 40) {
            return Err(ProtocolError::InvalidDescriptor(
                "data_hash must be 40 hex characters".into(),
            ));
        }

        let item = self
            .manager
            .load(data_hash)
            .map_err(|_| ProtocolError::NotAuthorized)?;
        let contract = item
            .contract(&request.contact)
            .ok_or(ProtocolError::NotAuthorized)?;

        let now = self.clock.now_ms();
        let window_open = now < contract.store_end
            && now + self.config.consign_threshold_ms > contract.store_begin;
        if !window_open {
            return Err(ProtocolError::ContractExpired);
        }

        let token = generate_token(&mut rand::thread_rng());
        self.tokens.accept(
            &token,
            data_hash,
            request.contact.clone(),
            Operation::Push,
            Some(contract.data_size),
        );
        info!(%data_hash, renter = %request.contact.id, "consignment authorized");
        Ok(json!({ "token": token }))
    }

    /// RETRIEVE: grant a PULL token for a stored shard.
    async fn retrieve(&self, request: Request) -> Result<Value, ProtocolError> {
        let data_hash = request.param_str(0)?;
        if !is_hex_string(data_hash, 40) {
            return Err(ProtocolError::InvalidDescriptor(
                "data_hash must be 40 hex characters".into(),
            ));
        }

        self.manager
            .load(data_hash)
            .map_err(|_| ProtocolError::ShardNotFound)?;
        if !self.manager.shard_exists(data_hash).await? {
            return Err(ProtocolError::ShardNotFound);
        }

        let token = generate_token(&mut rand::thread_rng());
        self.tokens.accept(
            &token,
            data_hash,
            request.contact.clone(),
            Operation::Pull,
            None,
        );
        Ok(json!({ "token": token }))
    }

    /// MIRROR: replicate a shard from another farmer using a retrieval
    /// token the renter obtained on our behalf.
    async fn mirror(&self, request: Request) -> Result<Value, ProtocolError> {
        let data_hash = request.param_str(0)?.to_owned();
        let token = request.param_str(1)?.to_owned();
        let source: Contact = serde_json::from_value(request.param(2)?.clone())
            .map_err(|e| ProtocolError::InvalidDescriptor(format!("source contact: {e}")))?;

        let item = self
            .manager
            .load(&data_hash)
            .map_err(|_| ProtocolError::NotAuthorized)?;
        if item.contract(&request.contact).is_none() {
            return Err(ProtocolError::NotAuthorized);
        }

        // Already holding the shard: nothing to transfer.
        let mut sink = match self.manager.shard_writer(&data_hash).await {
            Ok(sink) => sink,
            Err(StoreError::AlreadyStored(_)) => return Ok(json!({})),
            Err(error) => return Err(error.into()),
        };

        let mut stream = match self.client.download(&source, &data_hash, &token).await {
            Ok(stream) => stream,
            Err(error) => {
                let _ = sink.abort().await;
                return Err(error.into());
            }
        };

        let mut hasher = Sha256::new();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    let _ = sink.abort().await;
                    return Err(ProtocolError::Transfer(error.to_string()));
                }
            };
            hasher.update(&chunk);
            if let Err(error) = sink.write(&chunk).await {
                let _ = sink.abort().await;
                return Err(error.into());
            }
        }

        let digest: [u8; 32] = hasher.finalize().into();
        if hex::encode(crypto::ripemd160(&digest)) != data_hash {
            let _ = sink.abort().await;
            return Err(ProtocolError::HashMismatch);
        }

        sink.commit().await?;
        self.manager.check_capacity();
        info!(%data_hash, source = %source.id, "shard mirrored");
        let _ = self.events.send(NodeEvent::ShardMirrored {
            data_hash,
            source,
        });
        Ok(json!({}))
    }

    /// PROBE: ping the requester's stated contact to establish whether
    /// it is publicly addressable.
    async fn probe(&self, request: Request) -> Result<Value, ProtocolError> {
        match self
            .transport
            .send(&request.contact, "PING", json!([]))
            .await
        {
            Ok(_) => Ok(json!({})),
            Err(error) => Err(ProtocolError::ProbeFailed(error.to_string())),
        }
    }

    /// RENEW: the original renter proposes updated terms. Restricted
    /// fields must not change; accepted renewals are countersigned and
    /// persisted under the renter's key.
    async fn renew(&self, request: Request) -> Result<Value, ProtocolError> {
        let descriptor = request.param(0)?;
        let updated = Contract::from_value(descriptor)
            .map_err(|e| ProtocolError::InvalidDescriptor(e.to_string()))?;
        if !updated.is_complete() {
            return Err(ProtocolError::IncompleteContract);
        }
        if !updated.verify(SignatureRole::Renter) {
            return Err(ProtocolError::InvalidSignature);
        }

        let data_hash = updated.data_hash()?.to_owned();
        let key = StorageItem::contract_key(&request.contact);
        let item = self
            .manager
            .load(&data_hash)
            .map_err(|_| ProtocolError::NotAuthorized)?;
        let current = item
            .contracts
            .get(&key)
            .ok_or(ProtocolError::NotAuthorized)?;

        let changed = Contract::diff(current, &updated);
        if let Some(field) = changed
            .iter()
            .find(|f| RESTRICTED_RENEWAL_FIELDS.contains(&f.as_str()))
        {
            return Err(ProtocolError::InvalidDescriptor(format!(
                "renewal changes restricted field {field}"
            )));
        }

        let mut renewed = updated;
        renewed.sign(SignatureRole::Farmer, self.identity.secret())?;

        let persisted = renewed.clone();
        self.manager
            .put(&data_hash, move |item| {
                item.trees
                    .insert(key.clone(), persisted.audit_leaves.clone());
                item.contracts.insert(key, persisted);
            })
            .await?;

        info!(%data_hash, renter = %request.contact.id, "contract renewed");
        Ok(json!({ "contract": renewed }))
    }

    /// TRIGGER: pass-through to a user-registered trigger processor.
    async fn trigger(&self, request: Request) -> Result<Value, ProtocolError> {
        let behavior = request.param_str(0)?.to_owned();
        self.triggers
            .process(&behavior, &request.contact, &request.params)
            .await
    }
}

#[cfg(test)]
mod tests;
