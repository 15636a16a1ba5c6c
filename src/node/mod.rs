// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The node: glue between the protocol rule set and the collaborator
//! transport, plus the renter/farmer client surface. The node owns every
//! long-lived store (storage manager, offer streams, token table) and
//! hands the rule set shared references; the Kademlia collaborator
//! reaches it through [`Node::handle_request`] and the traits below.

mod config;
mod contact;

pub use config::{NodeConfig, RESPONSE_TIMEOUT_MS, TOKEN_REAP_INTERVAL_MS};
pub use contact::{Contact, Identity};

use crate::audit::ProofNode;
use crate::contract::{Contract, SignatureRole};
use crate::offers::{Offer, OfferMap, OfferStream, OfferStreamOptions};
use crate::rules::{ProtocolError, Request, Rules, RulesConfig, TriggerProcessor, TriggerRegistry};
use crate::shard_server::{ShardServer, TokenTable};
use crate::store::{StorageAdapter, StorageManager};
use crate::utils::{Clock, SystemClock};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Outbound message path into the Kademlia collaborator. The transport
/// owns message framing, envelope signing and retries; the node only
/// sees JSON parameters and results.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        contact: &Contact,
        method: &str,
        params: Value,
    ) -> Result<Value, ProtocolError>;
}

/// Topic-routed publish/subscribe collaborator.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), ProtocolError>;

    /// Subscribe to a set of topic codes; descriptors arrive as raw
    /// JSON values.
    async fn subscribe(&self, topics: &[String]) -> Result<flume::Receiver<Value>, ProtocolError>;
}

/// Observable node happenings, delivered on a broadcast channel.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// An OFFER arrived for a contract no stream is open for.
    UnhandledOffer { contact: Contact, data_hash: String },
    /// A shard was replicated onto this node from another farmer.
    ShardMirrored { data_hash: String, source: Contact },
}

/// One remote audit challenge.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ShardAudit {
    pub hash: String,
    pub challenge: String,
}

/// One remote audit answer; `proof` is `None` when the farmer could not
/// produce one.
#[derive(Debug)]
pub struct ShardProof {
    pub hash: String,
    pub proof: Option<ProofNode>,
}

/// One mirror instruction: replicate `hash` from `source` (authorized
/// by `token`) onto `destination`.
#[derive(Debug, Clone)]
pub struct MirrorTarget {
    pub hash: String,
    pub token: String,
    pub source: Contact,
    pub destination: Contact,
}

/// A storage network peer, wearing the renter or farmer hat (or both).
pub struct Node<DB> {
    identity: Arc<Identity>,
    config: NodeConfig,
    manager: Arc<StorageManager<DB>>,
    offers: Arc<OfferMap>,
    tokens: Arc<TokenTable>,
    rules: Arc<Rules<DB>>,
    server: Arc<ShardServer<DB>>,
    transport: Arc<dyn Transport>,
    pubsub: Arc<dyn PubSub>,
    triggers: Arc<TriggerRegistry>,
    events: broadcast::Sender<NodeEvent>,
    reaper: tokio::task::JoinHandle<()>,
}

impl<DB> Node<DB>
where
    DB: StorageAdapter + Send + Sync + 'static,
{
    /// Build a node on the system clock. Must be called from within a
    /// tokio runtime (the token reaper is spawned here).
    pub fn new(
        identity: Identity,
        config: NodeConfig,
        db: DB,
        transport: Arc<dyn Transport>,
        pubsub: Arc<dyn PubSub>,
    ) -> Self {
        Self::with_clock(identity, config, db, transport, pubsub, Arc::new(SystemClock))
    }

    pub fn with_clock(
        identity: Identity,
        config: NodeConfig,
        db: DB,
        transport: Arc<dyn Transport>,
        pubsub: Arc<dyn PubSub>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let identity = Arc::new(identity);
        let manager = Arc::new(StorageManager::with_capacity(db, config.capacity_bytes));
        let offers = Arc::new(OfferMap::new());
        let tokens = Arc::new(TokenTable::new(config.token_ttl_ms, clock.clone()));
        let triggers = Arc::new(TriggerRegistry::new());
        let (events, _) = broadcast::channel(64);

        let rules = Arc::new(Rules::new(
            identity.clone(),
            manager.clone(),
            offers.clone(),
            tokens.clone(),
            transport.clone(),
            triggers.clone(),
            clock.clone(),
            events.clone(),
            RulesConfig {
                consign_threshold_ms: config.consign_threshold_ms,
                max_concurrent_audits: config.max_concurrent_audits,
            },
        ));
        let server = Arc::new(ShardServer::new(manager.clone(), tokens.clone(), clock));
        let reaper = tokens.clone().spawn_reaper(TOKEN_REAP_INTERVAL_MS);

        Node {
            identity,
            config,
            manager,
            offers,
            tokens,
            rules,
            server,
            transport,
            pubsub,
            triggers,
            events,
            reaper,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn manager(&self) -> &Arc<StorageManager<DB>> {
        &self.manager
    }

    /// The token-gated HTTP endpoint; callers bind a listener and hand
    /// it to [`ShardServer::serve`].
    pub fn shard_server(&self) -> Arc<ShardServer<DB>> {
        self.server.clone()
    }

    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        &self.triggers
    }

    /// The transfer token table shared with the shard server.
    pub fn tokens(&self) -> &Arc<TokenTable> {
        &self.tokens
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Register a trigger processor for a behavior name.
    pub fn register_trigger(&self, behavior: &str, processor: Arc<dyn TriggerProcessor>) {
        self.triggers.register(behavior, processor);
    }

    /// Entry point for the Kademlia collaborator's dispatcher: handle
    /// one inbound request and produce the wire envelope.
    pub async fn handle_request(&self, method: &str, contact: Contact, params: Value) -> Value {
        match self
            .rules
            .dispatch(method, Request::new(contact, params))
            .await
        {
            Ok(result) => json!({ "result": result }),
            Err(error) => {
                debug!(method, %error, "request rejected");
                json!({ "error": { "message": error.to_string() } })
            }
        }
    }

    /// Tear down the client surface: every open offer stream is
    /// destroyed and pending consumers see end-of-stream.
    pub fn destroy(&self) {
        self.offers.destroy_all();
    }

    // ---- renter surface ----

    /// Publish a shard descriptor to its criteria topic and open an
    /// offer stream for the answers.
    pub async fn publish_shard_descriptor(
        &self,
        contract: &Contract,
        options: OfferStreamOptions,
    ) -> Result<Arc<OfferStream>, ProtocolError> {
        let data_hash = contract.data_hash()?.to_owned();
        let topic = contract.topic_hex();

        let options = OfferStreamOptions {
            max_offers: options.max_offers.or(Some(self.config.max_offers)),
            ..options
        };
        let stream = Arc::new(OfferStream::new(contract.clone(), options));
        self.offers.insert(&data_hash, stream.clone());

        let payload = serde_json::to_value(contract)
            .map_err(|e| ProtocolError::InvalidDescriptor(e.to_string()))?;
        if let Err(error) = self.pubsub.publish(&topic, payload).await {
            self.offers.remove(&data_hash);
            return Err(error);
        }
        debug!(%data_hash, %topic, "shard descriptor published");
        Ok(stream)
    }

    /// Accept a queued offer: persist the agreement, then resolve the
    /// farmer's pending OFFER request with the completed contract.
    pub async fn accept_offer(&self, offer: Offer) -> Result<Contract, ProtocolError> {
        let contract = offer.contract.clone();
        let contact = offer.contact.clone();
        let data_hash = contract.data_hash()?.to_owned();

        let stored = contract.clone();
        self.manager
            .put(&data_hash, move |item| {
                item.add_contract(&contact, stored);
            })
            .await?;

        offer.resolve(Ok(contract.clone()));
        Ok(contract)
    }

    /// Decline a queued offer; the farmer receives the reason.
    pub fn reject_offer(&self, offer: Offer, reason: &str) {
        offer.resolve(Err(ProtocolError::OfferRejected(reason.to_owned())));
    }

    /// Request consignment tokens for a batch of shards held under
    /// contract with `peer`.
    pub async fn authorize_consignment(
        &self,
        peer: &Contact,
        hashes: &[String],
    ) -> Result<Vec<String>, ProtocolError> {
        let mut tokens = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let result = self.send(peer, "CONSIGN", json!([hash])).await?;
            tokens.push(Self::result_str(&result, "token")?);
        }
        Ok(tokens)
    }

    /// Request retrieval tokens for a batch of shards stored on `peer`.
    pub async fn authorize_retrieval(
        &self,
        peer: &Contact,
        hashes: &[String],
    ) -> Result<Vec<String>, ProtocolError> {
        let mut tokens = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let result = self.send(peer, "RETRIEVE", json!([hash])).await?;
            tokens.push(Self::result_str(&result, "token")?);
        }
        Ok(tokens)
    }

    /// Instruct `destination` to replicate a shard from `source`.
    pub async fn create_shard_mirror(
        &self,
        source: &Contact,
        destination: &Contact,
        hash: &str,
        token: &str,
    ) -> Result<(), ProtocolError> {
        let params = json!([hash, token, source]);
        self.send(destination, "MIRROR", params).await?;
        Ok(())
    }

    /// Establish mirrors on a set of destinations, tolerating partial
    /// failure: as long as one mirror lands, the call succeeds and
    /// reports the peers that took a copy.
    pub async fn get_mirror_nodes(
        &self,
        targets: &[MirrorTarget],
    ) -> Result<Vec<Contact>, ProtocolError> {
        let mut established = Vec::new();
        let mut last_error = ProtocolError::OfferRejected("no mirror targets supplied".into());

        for target in targets {
            match self
                .create_shard_mirror(
                    &target.source,
                    &target.destination,
                    &target.hash,
                    &target.token,
                )
                .await
            {
                Ok(()) => established.push(target.destination.clone()),
                Err(error) => {
                    warn!(hash = %target.hash, destination = %target.destination, %error,
                        "mirror request failed");
                    last_error = error;
                }
            }
        }

        if established.is_empty() {
            Err(last_error)
        } else {
            Ok(established)
        }
    }

    /// Issue a batch of audit challenges against `peer`.
    pub async fn audit_remote_shards(
        &self,
        peer: &Contact,
        audits: &[ShardAudit],
    ) -> Result<Vec<ShardProof>, ProtocolError> {
        let params =
            serde_json::to_value(audits).map_err(|e| ProtocolError::BadResponse(e.to_string()))?;
        let result = self.send(peer, "AUDIT", params).await?;

        let proofs = result
            .get("proofs")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ProtocolError::BadResponse("missing proofs array".into()))?;

        proofs
            .iter()
            .map(|entry| {
                let hash = entry
                    .get("hash")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_owned();
                let proof = match entry.get("proof") {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(ProofNode::from_value(value).map_err(|e| {
                        ProtocolError::BadResponse(format!("bad proof for {hash}: {e}"))
                    })?),
                };
                Ok(ShardProof { hash, proof })
            })
            .collect()
    }

    /// Ask `peer` to renew a contract under updated terms; the updated
    /// agreement replaces the stored one on success.
    pub async fn request_contract_renewal(
        &self,
        peer: &Contact,
        contract: &Contract,
    ) -> Result<Contract, ProtocolError> {
        let result = self
            .send(peer, "RENEW", json!([contract]))
            .await?;
        let renewed = result
            .get("contract")
            .ok_or_else(|| ProtocolError::BadResponse("missing contract".into()))
            .and_then(|v| {
                Contract::from_value(v).map_err(|e| ProtocolError::BadResponse(e.to_string()))
            })?;

        if !renewed.is_complete() || !renewed.verify(SignatureRole::Farmer) {
            return Err(ProtocolError::BadResponse(
                "renewed contract is incomplete or badly signed".into(),
            ));
        }

        let data_hash = renewed.data_hash()?.to_owned();
        let contact = peer.clone();
        let stored = renewed.clone();
        self.manager
            .put(&data_hash, move |item| {
                item.add_contract(&contact, stored);
            })
            .await?;
        Ok(renewed)
    }

    pub async fn ping(&self, peer: &Contact) -> Result<(), ProtocolError> {
        self.send(peer, "PING", json!([])).await?;
        Ok(())
    }

    // ---- farmer surface ----

    /// Subscribe to a set of topic codes; only valid shard descriptors
    /// come through.
    pub async fn subscribe_shard_descriptor(
        &self,
        topics: &[String],
    ) -> Result<flume::Receiver<Contract>, ProtocolError> {
        let raw = self.pubsub.subscribe(topics).await?;
        let (tx, rx) = flume::bounded(64);

        tokio::spawn(async move {
            while let Ok(value) = raw.recv_async().await {
                let contract = match Contract::from_value(&value) {
                    Ok(contract) if contract.is_valid() => contract,
                    _ => {
                        debug!("discarding invalid shard descriptor");
                        continue;
                    }
                };
                if tx.send_async(contract).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    /// Counter-sign a descriptor as farmer and offer it to the renter.
    /// On success the completed contract is persisted and returned.
    pub async fn offer_shard_allocation(
        &self,
        peer: &Contact,
        descriptor: &Contract,
    ) -> Result<Contract, ProtocolError> {
        let mut contract = descriptor.clone();
        contract.set("farmer_id", json!(self.identity.node_id()))?;
        if let Some(hd_key) = self.identity.hd_key() {
            contract.set("farmer_hd_key", json!(hd_key))?;
            contract.set("farmer_hd_index", json!(self.identity.hd_index()))?;
        }
        contract.sign(SignatureRole::Farmer, self.identity.secret())?;

        let result = self.send(peer, "OFFER", json!([contract])).await?;
        let completed = result
            .get("contract")
            .ok_or_else(|| ProtocolError::BadResponse("missing contract".into()))
            .and_then(|v| {
                Contract::from_value(v).map_err(|e| ProtocolError::BadResponse(e.to_string()))
            })?;

        if !completed.is_valid() || !completed.is_complete() {
            return Err(ProtocolError::BadResponse(
                "counterparty returned an incomplete contract".into(),
            ));
        }

        let data_hash = completed.data_hash()?.to_owned();
        let contact = peer.clone();
        let stored = completed.clone();
        self.manager
            .put(&data_hash, move |item| {
                item.add_contract(&contact, stored);
            })
            .await?;
        Ok(completed)
    }

    // ---- internals ----

    /// Outbound RPC with the configured deadline.
    async fn send(
        &self,
        contact: &Contact,
        method: &str,
        params: Value,
    ) -> Result<Value, ProtocolError> {
        let deadline = Duration::from_millis(self.config.response_timeout_ms);
        match tokio::time::timeout(deadline, self.transport.send(contact, method, params)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    fn result_str(result: &Value, field: &str) -> Result<String, ProtocolError> {
        result
            .get(field)
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| ProtocolError::BadResponse(format!("missing {field}")))
    }
}

impl<DB> Drop for Node<DB> {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}
