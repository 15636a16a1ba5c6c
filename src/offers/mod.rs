// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Bounded, backpressure-aware queues of storage offers. A renter opens
//! one [`OfferStream`] per published contract; farmer counter-offers are
//! queued in arrival order and handed to the consumer one at a time.
//! Each queued [`Offer`] carries a resolver the consumer must settle;
//! the resolution travels back to the farmer as the OFFER response.

use crate::contract::Contract;
use crate::node::Contact;
use crate::rules::ProtocolError;
use futures::channel::oneshot;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Default cap on offers queued for a single published contract.
pub const MAX_OFFERS_DEFAULT: usize = 12;

/// Rejection message returned to farmers whose offer is not queued.
pub const OFFER_REJECTED_MSG: &str = "Storage offer rejected";

/// A farmer's counter-offer, paired with the channel that resolves it.
#[derive(Debug)]
pub struct Offer {
    pub contact: Contact,
    pub contract: Contract,
    resolver: oneshot::Sender<Result<Contract, ProtocolError>>,
}

impl Offer {
    /// Create an offer and the receiver its resolution arrives on.
    pub fn new(
        contact: Contact,
        contract: Contract,
    ) -> (Self, oneshot::Receiver<Result<Contract, ProtocolError>>) {
        let (resolver, rx) = oneshot::channel();
        (
            Offer {
                contact,
                contract,
                resolver,
            },
            rx,
        )
    }

    /// Settle the offer. `Ok` carries the fully countersigned contract
    /// the farmer receives; `Err` becomes a wire-level error response.
    pub fn resolve(self, result: Result<Contract, ProtocolError>) {
        // The handler may have given up waiting; nothing to do then.
        let _ = self.resolver.send(result);
    }
}

/// Construction options for an [`OfferStream`].
#[derive(Debug, Clone, Default)]
pub struct OfferStreamOptions {
    pub max_offers: Option<usize>,
    pub farmer_blacklist: HashSet<String>,
}

struct Shared {
    tx: Option<flume::Sender<Offer>>,
    accepted: usize,
    processed: usize,
    farmers: HashSet<String>,
    destroyed: bool,
}

/// Bounded stream of accepted offers for one published contract.
pub struct OfferStream {
    contract: Contract,
    max_offers: usize,
    blacklist: HashSet<String>,
    shared: Mutex<Shared>,
    rx: flume::Receiver<Offer>,
}

impl OfferStream {
    pub fn new(contract: Contract, options: OfferStreamOptions) -> Self {
        let max_offers = options.max_offers.unwrap_or(MAX_OFFERS_DEFAULT).max(1);
        let (tx, rx) = flume::bounded(max_offers);
        OfferStream {
            contract,
            max_offers,
            blacklist: options.farmer_blacklist,
            shared: Mutex::new(Shared {
                tx: Some(tx),
                accepted: 0,
                processed: 0,
                farmers: HashSet::new(),
                destroyed: false,
            }),
            rx,
        }
    }

    /// The published contract this stream collects offers for.
    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    /// Queue an incoming offer, or reject it. A rejected offer has its
    /// resolver settled with the rejection, so the sender always hears
    /// back; the same error is returned for the caller's bookkeeping.
    pub fn queue(&self, offer: Offer) -> Result<(), ProtocolError> {
        let mut shared = self.shared.lock();

        let rejection = if shared.destroyed || shared.tx.is_none() {
            Some(ProtocolError::OfferRejected(OFFER_REJECTED_MSG.into()))
        } else if self.blacklist.contains(&offer.contact.id)
            || shared.farmers.contains(&offer.contact.id)
        {
            Some(ProtocolError::OfferRejected(OFFER_REJECTED_MSG.into()))
        } else if !offer.contract.is_complete() {
            Some(ProtocolError::IncompleteContract)
        } else if shared.accepted == self.max_offers {
            Some(ProtocolError::OfferRejected(OFFER_REJECTED_MSG.into()))
        } else {
            None
        };

        if let Some(error) = rejection {
            debug!(farmer = %offer.contact.id, %error, "rejecting storage offer");
            offer.resolve(Err(error.clone()));
            return Err(error);
        }

        let farmer_id = offer.contact.id.clone();
        let tx = shared.tx.as_ref().expect("checked above");
        match tx.try_send(offer) {
            Ok(()) => {
                shared.accepted += 1;
                shared.farmers.insert(farmer_id);
                Ok(())
            }
            Err(flume::TrySendError::Full(offer))
            | Err(flume::TrySendError::Disconnected(offer)) => {
                let error = ProtocolError::OfferRejected(OFFER_REJECTED_MSG.into());
                offer.resolve(Err(error.clone()));
                Err(error)
            }
        }
    }

    /// Receive the next accepted offer in arrival order. Returns `None`
    /// once the stream has ended: destroyed, or `max_offers` processed.
    pub async fn recv(&self) -> Option<Offer> {
        let offer = self.rx.recv_async().await.ok()?;

        let mut shared = self.shared.lock();
        shared.processed += 1;
        if shared.processed >= self.max_offers {
            shared.destroyed = true;
            shared.tx = None;
        }
        Some(offer)
    }

    /// Tear the stream down: pending offers are drained and discarded
    /// (their senders receive an error through the dropped resolver) and
    /// later offers are rejected.
    pub fn destroy(&self) {
        let mut shared = self.shared.lock();
        shared.destroyed = true;
        shared.tx = None;
        drop(shared);

        while let Ok(offer) = self.rx.try_recv() {
            drop(offer);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }

    /// Offers accepted so far (queued or already processed).
    pub fn offers_queued(&self) -> usize {
        self.shared.lock().accepted
    }

    /// Offers handed to the consumer so far.
    pub fn offers_processed(&self) -> usize {
        self.shared.lock().processed
    }
}

/// The set of live offer streams, keyed by contract `data_hash`.
#[derive(Default)]
pub struct OfferMap {
    streams: RwLock<HashMap<String, Arc<OfferStream>>>,
}

impl OfferMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream for a published contract, replacing (and
    /// destroying) any previous stream for the same hash.
    pub fn insert(&self, data_hash: &str, stream: Arc<OfferStream>) {
        let previous = self
            .streams
            .write()
            .insert(data_hash.to_owned(), stream);
        if let Some(previous) = previous {
            previous.destroy();
        }
    }

    pub fn get(&self, data_hash: &str) -> Option<Arc<OfferStream>> {
        self.streams.read().get(data_hash).cloned()
    }

    /// Drop a stream after publication completes, destroying it.
    pub fn remove(&self, data_hash: &str) {
        if let Some(stream) = self.streams.write().remove(data_hash) {
            stream.destroy();
        }
    }

    /// Node teardown: destroy every live stream.
    pub fn destroy_all(&self) {
        for (_, stream) in self.streams.write().drain() {
            stream.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::SignatureRole;
    use crate::crypto::Keypair;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use serde_json::json;

    fn complete_contract(renter: &Keypair, farmer: &Keypair) -> Contract {
        let mut contract = Contract::default();
        contract
            .update(&json!({
                "renter_id": renter.node_id(),
                "farmer_id": farmer.node_id(),
                "data_size": 1024u64,
                "data_hash": crate::crypto::hash160_hex(b"offer shard"),
                "store_begin": 1_000u64,
                "store_end": 2_000u64,
                "payment_destination": "payme",
            }))
            .unwrap();
        contract.sign(SignatureRole::Renter, renter.secret()).unwrap();
        contract.sign(SignatureRole::Farmer, farmer.secret()).unwrap();
        contract
    }

    fn contact(id: &str) -> Contact {
        Contact::new(id, "127.0.0.1", 4001)
    }

    #[tokio::test]
    async fn duplicate_and_overflow_offers_are_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let renter = Keypair::random(&mut rng);
        let farmer_a = Keypair::random(&mut rng);
        let farmer_b = Keypair::random(&mut rng);

        let contract = complete_contract(&renter, &farmer_a);
        let stream = OfferStream::new(
            contract.clone(),
            OfferStreamOptions {
                max_offers: Some(1),
                ..Default::default()
            },
        );

        let (offer, _rx_a) = Offer::new(contact(&farmer_a.node_id()), contract.clone());
        stream.queue(offer).unwrap();

        // Same farmer again: rejected with the canonical message.
        let (offer, rx) = Offer::new(contact(&farmer_a.node_id()), contract.clone());
        let err = stream.queue(offer).unwrap_err();
        assert_eq!(err.to_string(), OFFER_REJECTED_MSG);
        let resolved = rx.await.unwrap();
        assert_eq!(resolved.unwrap_err().to_string(), OFFER_REJECTED_MSG);

        // Different farmer, but the queue is already at capacity.
        let (offer, rx) = Offer::new(contact(&farmer_b.node_id()), contract.clone());
        assert!(stream.queue(offer).is_err());
        assert!(rx.await.unwrap().is_err());

        assert_eq!(stream.offers_queued(), 1);
    }

    #[tokio::test]
    async fn offers_arrive_in_order_and_stream_ends_at_max() {
        let mut rng = ChaCha8Rng::seed_from_u64(22);
        let renter = Keypair::random(&mut rng);
        let farmers: Vec<Keypair> = (0..3).map(|_| Keypair::random(&mut rng)).collect();

        let contract = complete_contract(&renter, &farmers[0]);
        let stream = OfferStream::new(
            contract.clone(),
            OfferStreamOptions {
                max_offers: Some(3),
                ..Default::default()
            },
        );

        for farmer in &farmers {
            let (offer, _rx) = Offer::new(contact(&farmer.node_id()), contract.clone());
            stream.queue(offer).unwrap();
        }

        for farmer in &farmers {
            let offer = stream.recv().await.unwrap();
            assert_eq!(offer.contact.id, farmer.node_id());
        }

        // Max offers processed: the stream has ended.
        assert!(stream.recv().await.is_none());
        assert!(stream.is_destroyed());
        let (offer, _rx) = Offer::new(contact("aa"), contract.clone());
        assert!(stream.queue(offer).is_err());
    }

    #[tokio::test]
    async fn incomplete_contracts_are_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(23);
        let renter = Keypair::random(&mut rng);
        let farmer = Keypair::random(&mut rng);

        let complete = complete_contract(&renter, &farmer);
        let stream = OfferStream::new(complete.clone(), OfferStreamOptions::default());

        let mut incomplete = complete;
        incomplete.farmer_signature = None;
        let (offer, rx) = Offer::new(contact(&farmer.node_id()), incomplete);
        assert!(matches!(
            stream.queue(offer),
            Err(ProtocolError::IncompleteContract)
        ));
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn blacklisted_farmers_are_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(24);
        let renter = Keypair::random(&mut rng);
        let farmer = Keypair::random(&mut rng);

        let contract = complete_contract(&renter, &farmer);
        let stream = OfferStream::new(
            contract.clone(),
            OfferStreamOptions {
                max_offers: Some(4),
                farmer_blacklist: [farmer.node_id()].into_iter().collect(),
            },
        );

        let (offer, _rx) = Offer::new(contact(&farmer.node_id()), contract);
        assert!(stream.queue(offer).is_err());
        assert_eq!(stream.offers_queued(), 0);
    }

    #[tokio::test]
    async fn destroyed_streams_emit_nothing() {
        let mut rng = ChaCha8Rng::seed_from_u64(25);
        let renter = Keypair::random(&mut rng);
        let farmer = Keypair::random(&mut rng);

        let contract = complete_contract(&renter, &farmer);
        let stream = OfferStream::new(contract.clone(), OfferStreamOptions::default());

        let (offer, rx) = Offer::new(contact(&farmer.node_id()), contract.clone());
        stream.queue(offer).unwrap();

        stream.destroy();
        // The queued offer was drained; its resolver is gone.
        assert!(rx.await.is_err());
        assert!(stream.recv().await.is_none());

        // Later offers are silently ignored apart from the error reply.
        let (offer, _rx) = Offer::new(contact("bb"), contract);
        assert!(stream.queue(offer).is_err());
    }

    #[tokio::test]
    async fn resolving_an_offer_reaches_the_sender() {
        let mut rng = ChaCha8Rng::seed_from_u64(26);
        let renter = Keypair::random(&mut rng);
        let farmer = Keypair::random(&mut rng);

        let contract = complete_contract(&renter, &farmer);
        let stream = OfferStream::new(contract.clone(), OfferStreamOptions::default());

        let (offer, rx) = Offer::new(contact(&farmer.node_id()), contract.clone());
        stream.queue(offer).unwrap();

        let queued = stream.recv().await.unwrap();
        queued.resolve(Ok(contract.clone()));

        let resolved = rx.await.unwrap().unwrap();
        assert_eq!(resolved, contract);
    }

    #[test]
    fn offer_map_replaces_and_destroys() {
        let mut rng = ChaCha8Rng::seed_from_u64(27);
        let renter = Keypair::random(&mut rng);
        let farmer = Keypair::random(&mut rng);
        let contract = complete_contract(&renter, &farmer);

        let map = OfferMap::new();
        let first = Arc::new(OfferStream::new(contract.clone(), Default::default()));
        map.insert("aa", first.clone());
        let second = Arc::new(OfferStream::new(contract, Default::default()));
        map.insert("aa", second.clone());

        assert!(first.is_destroyed());
        assert!(!second.is_destroyed());

        map.remove("aa");
        assert!(second.is_destroyed());
        assert!(map.get("aa").is_none());
    }
}
