// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::*;
use crate::audit::{verify_proof, AuditStream, ProofNode};
use crate::node::{Identity, NodeEvent};
use crate::offers::{OfferStream, OfferStreamOptions};
use crate::store::MemoryAdapter;
use crate::utils::FixedClock;
use crate::crypto::Keypair;
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;

const NOW: u64 = 1_600_000_000_000;
const HOUR: u64 = 60 * 60 * 1000;

struct StubTransport {
    fail: bool,
    calls: Mutex<Vec<(String, String)>>,
}

impl StubTransport {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(StubTransport {
            fail,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl Transport for StubTransport {
    async fn send(
        &self,
        contact: &Contact,
        method: &str,
        _params: Value,
    ) -> Result<Value, ProtocolError> {
        self.calls
            .lock()
            .push((contact.id.clone(), method.to_owned()));
        if self.fail {
            Err(ProtocolError::Timeout)
        } else {
            Ok(json!({}))
        }
    }
}

struct Harness {
    rules: Rules<MemoryAdapter>,
    manager: Arc<StorageManager<MemoryAdapter>>,
    offers: Arc<OfferMap>,
    clock: FixedClock,
    events: broadcast::Sender<NodeEvent>,
    transport: Arc<StubTransport>,
}

fn harness_with(keypair: Keypair, transport_fails: bool) -> Harness {
    let clock = FixedClock::new(NOW);
    let identity = Arc::new(Identity::new(keypair));
    let manager = Arc::new(StorageManager::new(MemoryAdapter::default()));
    let offers = Arc::new(OfferMap::new());
    let tokens = Arc::new(TokenTable::new(
        crate::shard_server::TOKEN_TTL_MS,
        Arc::new(clock.clone()),
    ));
    let triggers = Arc::new(TriggerRegistry::new());
    let transport = StubTransport::new(transport_fails);
    let (events, _) = broadcast::channel(16);

    let rules = Rules::new(
        identity.clone(),
        manager.clone(),
        offers.clone(),
        tokens.clone(),
        transport.clone(),
        triggers.clone(),
        Arc::new(clock.clone()),
        events.clone(),
        RulesConfig::default(),
    );

    Harness {
        rules,
        manager,
        offers,
        clock,
        events,
        transport,
    }
}

fn keypairs(seed: u64) -> (Keypair, Keypair) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (Keypair::random(&mut rng), Keypair::random(&mut rng))
}

fn contact_for(keypair: &Keypair) -> Contact {
    Contact::new(&keypair.node_id(), "127.0.0.1", 4000)
}

/// A descriptor carrying both parties, unsigned.
fn descriptor(renter: &Keypair, farmer: &Keypair, data_hash: &str, size: u64) -> Contract {
    let mut contract = Contract::default();
    contract
        .update(&json!({
            "renter_id": renter.node_id(),
            "farmer_id": farmer.node_id(),
            "data_size": size,
            "data_hash": data_hash,
            "store_begin": NOW - HOUR,
            "store_end": NOW + 24 * HOUR,
            "audit_count": 4,
            "payment_destination": "payment-address",
        }))
        .unwrap();
    contract
}

fn complete_contract(renter: &Keypair, farmer: &Keypair, data_hash: &str) -> Contract {
    let mut contract = descriptor(renter, farmer, data_hash, 1024);
    contract.sign(SignatureRole::Renter, renter.secret()).unwrap();
    contract.sign(SignatureRole::Farmer, farmer.secret()).unwrap();
    contract
}

async fn seed_item(harness: &Harness, contact: &Contact, contract: &Contract) {
    let contact = contact.clone();
    let contract = contract.clone();
    let hash = contract.data_hash().unwrap().to_owned();
    harness
        .manager
        .put(&hash, move |item| item.add_contract(&contact, contract))
        .await
        .unwrap();
}

async fn store_shard(harness: &Harness, hash: &str, bytes: &[u8]) {
    let mut sink = harness.manager.shard_writer(hash).await.unwrap();
    sink.write(bytes).await.unwrap();
    sink.commit().await.unwrap();
}

mod offer {
    use super::*;

    #[tokio::test]
    async fn countersigns_and_resolves_through_the_stream() {
        let (renter_kp, farmer_kp) = keypairs(31);
        let harness = harness_with(renter_kp.clone(), false);

        let hash = crate::crypto::hash160_hex(b"offered shard");
        let mut offered = descriptor(&renter_kp, &farmer_kp, &hash, 2048);
        offered.sign(SignatureRole::Farmer, farmer_kp.secret()).unwrap();

        let stream = Arc::new(OfferStream::new(
            offered.clone(),
            OfferStreamOptions {
                max_offers: Some(1),
                ..Default::default()
            },
        ));
        harness.offers.insert(&hash, stream.clone());

        let request = Request::new(contact_for(&farmer_kp), json!([offered]));
        let handler = harness.rules.dispatch("OFFER", request);
        let consumer = async {
            let offer = stream.recv().await.expect("one offer queued");
            let contract = offer.contract.clone();
            offer.resolve(Ok(contract));
        };

        let (result, ()) = tokio::join!(handler, consumer);
        let reply = result.unwrap();
        let completed = Contract::from_value(&reply["contract"]).unwrap();
        assert!(completed.is_complete());
        assert!(completed.verify(SignatureRole::Renter));
        assert!(completed.verify(SignatureRole::Farmer));
    }

    #[tokio::test]
    async fn missing_stream_closes_offers_and_emits_event() {
        let (renter_kp, farmer_kp) = keypairs(32);
        let harness = harness_with(renter_kp.clone(), false);
        let mut events = harness.events.subscribe();

        let hash = crate::crypto::hash160_hex(b"unpublished shard");
        let mut offered = descriptor(&renter_kp, &farmer_kp, &hash, 64);
        offered.sign(SignatureRole::Farmer, farmer_kp.secret()).unwrap();

        let request = Request::new(contact_for(&farmer_kp), json!([offered]));
        let result = harness.rules.dispatch("OFFER", request).await;
        assert!(matches!(result, Err(ProtocolError::OffersClosed)));

        match events.recv().await.unwrap() {
            NodeEvent::UnhandledOffer { data_hash, contact } => {
                assert_eq!(data_hash, hash);
                assert_eq!(contact.id, farmer_kp.node_id());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_farmer_signature_is_rejected() {
        let (renter_kp, farmer_kp) = keypairs(33);
        let (impostor, _) = keypairs(133);
        let harness = harness_with(renter_kp.clone(), false);

        let hash = crate::crypto::hash160_hex(b"shard");
        let mut offered = descriptor(&renter_kp, &farmer_kp, &hash, 64);
        offered.sign(SignatureRole::Farmer, impostor.secret()).unwrap();

        let request = Request::new(contact_for(&farmer_kp), json!([offered]));
        let result = harness.rules.dispatch("OFFER", request).await;
        assert!(matches!(result, Err(ProtocolError::InvalidSignature)));
    }

    #[tokio::test]
    async fn malformed_descriptor_is_rejected() {
        let (renter_kp, _) = keypairs(34);
        let harness = harness_with(renter_kp, false);

        let request = Request::new(Contact::new("aa", "127.0.0.1", 1), json!(["not an object"]));
        let result = harness.rules.dispatch("OFFER", request).await;
        assert!(matches!(result, Err(ProtocolError::InvalidDescriptor(_))));
    }
}

mod consign {
    use super::*;

    async fn consign_at(now_offset_ms: i64, begin_offset_ms: i64, end_offset_ms: i64) -> Result<Value, ProtocolError> {
        let (renter_kp, farmer_kp) = keypairs(41);
        let harness = harness_with(farmer_kp.clone(), false);

        let hash = crate::crypto::hash160_hex(b"consigned shard");
        let mut contract = descriptor(&renter_kp, &farmer_kp, &hash, 1024);
        contract
            .update(&json!({
                "store_begin": (NOW as i64 + begin_offset_ms) as u64,
                "store_end": (NOW as i64 + end_offset_ms) as u64,
            }))
            .unwrap();
        contract.sign(SignatureRole::Renter, renter_kp.secret()).unwrap();
        contract.sign(SignatureRole::Farmer, farmer_kp.secret()).unwrap();

        let renter_contact = contact_for(&renter_kp);
        seed_item(&harness, &renter_contact, &contract).await;

        harness.clock.set((NOW as i64 + now_offset_ms) as u64);
        harness
            .rules
            .dispatch("CONSIGN", Request::new(renter_contact, json!([hash])))
            .await
    }

    #[tokio::test]
    async fn grants_a_push_token_inside_the_window() {
        // Ten minutes before the window opens, within the forward slack.
        let reply = consign_at(-10 * 60 * 1000, 0, 2 * HOUR as i64).await.unwrap();
        let token = reply["token"].as_str().unwrap();
        assert!(crate::utils::is_hex_string(token, 40));
    }

    #[tokio::test]
    async fn too_early_violates_the_window() {
        // The contract opens an hour from now; the 30 minute slack is
        // not enough.
        let result = consign_at(0, HOUR as i64, 2 * HOUR as i64).await;
        assert!(matches!(result, Err(ProtocolError::ContractExpired)));
    }

    #[tokio::test]
    async fn after_store_end_is_expired() {
        let result = consign_at(3 * HOUR as i64, HOUR as i64, 2 * HOUR as i64).await;
        assert!(matches!(result, Err(ProtocolError::ContractExpired)));
    }

    #[tokio::test]
    async fn unknown_contract_is_not_authorized() {
        let (renter_kp, farmer_kp) = keypairs(42);
        let harness = harness_with(farmer_kp, false);

        let hash = crate::crypto::hash160_hex(b"never contracted");
        let result = harness
            .rules
            .dispatch(
                "CONSIGN",
                Request::new(contact_for(&renter_kp), json!([hash])),
            )
            .await;
        assert!(matches!(result, Err(ProtocolError::NotAuthorized)));
    }
}

mod audit {
    use super::*;

    #[tokio::test]
    async fn batch_preserves_order_and_survives_missing_shards() {
        let (renter_kp, farmer_kp) = keypairs(51);
        let harness = harness_with(farmer_kp.clone(), false);

        // Build the shard and its audit tree the way a renter would.
        let mut rng = ChaCha8Rng::seed_from_u64(510);
        let mut shard = vec![0u8; 16 * 1024];
        rng.fill_bytes(&mut shard);
        let hash = crate::crypto::hash160_hex(&shard);

        let mut audit = AuditStream::with_rng(4, &mut rng).unwrap();
        audit.write(&shard);
        let tree = audit.finish();
        let record = tree.private_record();

        let mut contract = descriptor(&renter_kp, &farmer_kp, &hash, shard.len() as u64);
        contract
            .set("audit_leaves", json!(tree.public_record()))
            .unwrap();
        contract.sign(SignatureRole::Renter, renter_kp.secret()).unwrap();
        contract.sign(SignatureRole::Farmer, farmer_kp.secret()).unwrap();

        let renter_contact = contact_for(&renter_kp);
        seed_item(&harness, &renter_contact, &contract).await;
        store_shard(&harness, &hash, &shard).await;

        let unknown = crate::crypto::hash160_hex(b"not stored here");
        let batch = json!([
            { "hash": hash, "challenge": record.challenges[0] },
            { "hash": unknown, "challenge": record.challenges[1] },
            { "hash": hash, "challenge": record.challenges[2] },
        ]);

        let reply = harness
            .rules
            .dispatch("AUDIT", Request::new(renter_contact, batch))
            .await
            .unwrap();
        let proofs = reply["proofs"].as_array().unwrap();
        assert_eq!(proofs.len(), 3);

        assert_eq!(proofs[0]["hash"], json!(hash));
        assert_eq!(proofs[1]["hash"], json!(unknown));
        assert!(proofs[1]["proof"].is_null());
        assert_eq!(proofs[2]["hash"], json!(hash));

        // The two good entries verify against the renter's records.
        for index in [0, 2] {
            let node = ProofNode::from_value(&proofs[index]["proof"]).unwrap();
            let (expected, computed) =
                verify_proof(&node, &record.root, record.depth).unwrap();
            assert_eq!(expected, computed);
        }
    }

    #[tokio::test]
    async fn empty_batch_is_invalid() {
        let (_, farmer_kp) = keypairs(52);
        let harness = harness_with(farmer_kp, false);

        let result = harness
            .rules
            .dispatch("AUDIT", Request::new(Contact::new("aa", "h", 1), json!([])))
            .await;
        assert!(matches!(result, Err(ProtocolError::InvalidDescriptor(_))));
    }

    #[tokio::test]
    async fn wrong_challenge_yields_null_proof() {
        let (renter_kp, farmer_kp) = keypairs(53);
        let harness = harness_with(farmer_kp.clone(), false);

        let shard = b"some stored shard".to_vec();
        let hash = crate::crypto::hash160_hex(&shard);

        let mut rng = ChaCha8Rng::seed_from_u64(530);
        let mut audit = AuditStream::with_rng(2, &mut rng).unwrap();
        audit.write(&shard);
        let tree = audit.finish();

        let mut contract = descriptor(&renter_kp, &farmer_kp, &hash, shard.len() as u64);
        contract
            .set("audit_leaves", json!(tree.public_record()))
            .unwrap();
        contract.sign(SignatureRole::Renter, renter_kp.secret()).unwrap();
        contract.sign(SignatureRole::Farmer, farmer_kp.secret()).unwrap();

        let renter_contact = contact_for(&renter_kp);
        seed_item(&harness, &renter_contact, &contract).await;
        store_shard(&harness, &hash, &shard).await;

        let bogus_challenge = hex::encode([9u8; 32]);
        let reply = harness
            .rules
            .dispatch(
                "AUDIT",
                Request::new(
                    renter_contact,
                    json!([{ "hash": hash, "challenge": bogus_challenge }]),
                ),
            )
            .await
            .unwrap();
        assert!(reply["proofs"][0]["proof"].is_null());
    }
}

mod retrieve {
    use super::*;

    #[tokio::test]
    async fn grants_a_pull_token_for_stored_shards() {
        let (renter_kp, farmer_kp) = keypairs(61);
        let harness = harness_with(farmer_kp.clone(), false);

        let shard = b"retrievable bytes".to_vec();
        let hash = crate::crypto::hash160_hex(&shard);
        let contract = complete_contract(&renter_kp, &farmer_kp, &hash);

        let renter_contact = contact_for(&renter_kp);
        seed_item(&harness, &renter_contact, &contract).await;
        store_shard(&harness, &hash, &shard).await;

        let reply = harness
            .rules
            .dispatch("RETRIEVE", Request::new(renter_contact, json!([hash])))
            .await
            .unwrap();
        assert!(reply["token"].is_string());
    }

    #[tokio::test]
    async fn missing_shard_is_not_found() {
        let (renter_kp, farmer_kp) = keypairs(62);
        let harness = harness_with(farmer_kp, false);

        let hash = crate::crypto::hash160_hex(b"ghost shard");
        let result = harness
            .rules
            .dispatch(
                "RETRIEVE",
                Request::new(contact_for(&renter_kp), json!([hash])),
            )
            .await;
        assert!(matches!(result, Err(ProtocolError::ShardNotFound)));
    }

    #[tokio::test]
    async fn invalid_hash_is_rejected() {
        let (renter_kp, farmer_kp) = keypairs(63);
        let harness = harness_with(farmer_kp, false);

        let result = harness
            .rules
            .dispatch(
                "RETRIEVE",
                Request::new(contact_for(&renter_kp), json!(["nothex"])),
            )
            .await;
        assert!(matches!(result, Err(ProtocolError::InvalidDescriptor(_))));
    }
}

mod mirror {
    use super::*;

    #[tokio::test]
    async fn already_stored_shard_acks_without_transfer() {
        let (renter_kp, farmer_kp) = keypairs(71);
        let harness = harness_with(farmer_kp.clone(), false);

        let shard = b"mirrored shard".to_vec();
        let hash = crate::crypto::hash160_hex(&shard);
        let contract = complete_contract(&renter_kp, &farmer_kp, &hash);

        let renter_contact = contact_for(&renter_kp);
        seed_item(&harness, &renter_contact, &contract).await;
        store_shard(&harness, &hash, &shard).await;

        let source = Contact::new("cafe", "127.0.0.1", 1);
        let reply = harness
            .rules
            .dispatch(
                "MIRROR",
                Request::new(renter_contact, json!([hash, "token", source])),
            )
            .await
            .unwrap();
        assert_eq!(reply, json!({}));
    }

    #[tokio::test]
    async fn mirror_without_contract_is_rejected() {
        let (renter_kp, farmer_kp) = keypairs(72);
        let harness = harness_with(farmer_kp, false);

        let hash = crate::crypto::hash160_hex(b"uncontracted");
        let source = Contact::new("cafe", "127.0.0.1", 1);
        let result = harness
            .rules
            .dispatch(
                "MIRROR",
                Request::new(contact_for(&renter_kp), json!([hash, "token", source])),
            )
            .await;
        assert!(matches!(result, Err(ProtocolError::NotAuthorized)));
    }
}

mod probe {
    use super::*;

    #[tokio::test]
    async fn pings_back_the_requester() {
        let (_, farmer_kp) = keypairs(81);
        let harness = harness_with(farmer_kp, false);

        let requester = Contact::new("beef", "10.1.1.1", 9000);
        let reply = harness
            .rules
            .dispatch("PROBE", Request::new(requester.clone(), json!([])))
            .await
            .unwrap();
        assert_eq!(reply, json!({}));

        let calls = harness.transport.calls.lock();
        assert_eq!(calls.as_slice(), &[("beef".to_owned(), "PING".to_owned())]);
    }

    #[tokio::test]
    async fn unreachable_requester_fails() {
        let (_, farmer_kp) = keypairs(82);
        let harness = harness_with(farmer_kp, true);

        let requester = Contact::new("beef", "10.1.1.1", 9000);
        let result = harness
            .rules
            .dispatch("PROBE", Request::new(requester, json!([])))
            .await;
        assert!(matches!(result, Err(ProtocolError::ProbeFailed(_))));
    }
}

mod renew {
    use super::*;

    async fn renewal_setup() -> (Harness, Contact, Contract, Keypair) {
        let (renter_kp, farmer_kp) = keypairs(91);
        let harness = harness_with(farmer_kp.clone(), false);

        let hash = crate::crypto::hash160_hex(b"renewable shard");
        let contract = complete_contract(&renter_kp, &farmer_kp, &hash);
        let renter_contact = contact_for(&renter_kp);
        seed_item(&harness, &renter_contact, &contract).await;
        (harness, renter_contact, contract, renter_kp)
    }

    #[tokio::test]
    async fn extends_store_end_and_resigns() {
        let (harness, renter_contact, contract, renter_kp) = renewal_setup().await;

        let mut renewal = contract.clone();
        renewal
            .set("store_end", json!(contract.store_end + 24 * HOUR))
            .unwrap();
        renewal.sign(SignatureRole::Renter, renter_kp.secret()).unwrap();

        let reply = harness
            .rules
            .dispatch("RENEW", Request::new(renter_contact.clone(), json!([renewal])))
            .await
            .unwrap();

        let renewed = Contract::from_value(&reply["contract"]).unwrap();
        assert_eq!(renewed.store_end, contract.store_end + 24 * HOUR);
        assert!(renewed.verify(SignatureRole::Farmer));
        assert!(renewed.verify(SignatureRole::Renter));

        // The stored agreement was replaced.
        let item = harness.manager.load(contract.data_hash().unwrap()).unwrap();
        assert_eq!(
            item.contract(&renter_contact).unwrap().store_end,
            contract.store_end + 24 * HOUR
        );
    }

    #[tokio::test]
    async fn restricted_field_changes_are_rejected() {
        let (harness, renter_contact, contract, renter_kp) = renewal_setup().await;

        let mut renewal = contract.clone();
        renewal.set("data_size", json!(4096)).unwrap();
        renewal.sign(SignatureRole::Renter, renter_kp.secret()).unwrap();

        let result = harness
            .rules
            .dispatch("RENEW", Request::new(renter_contact, json!([renewal])))
            .await;
        assert!(matches!(result, Err(ProtocolError::InvalidDescriptor(_))));
    }

    #[tokio::test]
    async fn renewal_from_a_stranger_is_rejected() {
        let (harness, _, contract, renter_kp) = renewal_setup().await;

        let mut renewal = contract.clone();
        renewal
            .set("store_end", json!(contract.store_end + HOUR))
            .unwrap();
        renewal.sign(SignatureRole::Renter, renter_kp.secret()).unwrap();

        let stranger = Contact::new("dddd", "127.0.0.1", 2);
        let result = harness
            .rules
            .dispatch("RENEW", Request::new(stranger, json!([renewal])))
            .await;
        assert!(matches!(result, Err(ProtocolError::NotAuthorized)));
    }

    #[tokio::test]
    async fn tampered_renewal_signature_is_rejected() {
        let (harness, renter_contact, contract, _) = renewal_setup().await;

        let mut renewal = contract.clone();
        // store_end changed without re-signing: renter signature is stale.
        renewal.store_end += HOUR;

        let result = harness
            .rules
            .dispatch("RENEW", Request::new(renter_contact, json!([renewal])))
            .await;
        assert!(matches!(result, Err(ProtocolError::InvalidSignature)));
    }
}

mod trigger {
    use super::*;

    struct Echo;

    #[async_trait::async_trait]
    impl TriggerProcessor for Echo {
        async fn process(
            &self,
            contact: &Contact,
            params: &Value,
        ) -> Result<Value, ProtocolError> {
            Ok(json!({ "from": contact.id, "params": params }))
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_processor() {
        let (_, farmer_kp) = keypairs(101);
        let harness = harness_with(farmer_kp, false);
        harness.rules.triggers.register("echo", Arc::new(Echo));

        let reply = harness
            .rules
            .dispatch(
                "TRIGGER",
                Request::new(Contact::new("aa", "h", 1), json!(["echo", 42])),
            )
            .await
            .unwrap();
        assert_eq!(reply["from"], json!("aa"));
    }

    #[tokio::test]
    async fn unknown_behavior_is_rejected() {
        let (_, farmer_kp) = keypairs(102);
        let harness = harness_with(farmer_kp, false);

        let result = harness
            .rules
            .dispatch(
                "TRIGGER",
                Request::new(Contact::new("aa", "h", 1), json!(["nope"])),
            )
            .await;
        assert!(matches!(result, Err(ProtocolError::UnknownTrigger(_))));
    }
}

#[tokio::test]
async fn unknown_methods_are_rejected() {
    let (_, farmer_kp) = keypairs(111);
    let harness = harness_with(farmer_kp, false);

    let result = harness
        .rules
        .dispatch("STEAL", Request::new(Contact::new("aa", "h", 1), json!([])))
        .await;
    assert!(matches!(result, Err(ProtocolError::UnknownMethod(_))));
}
