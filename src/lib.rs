// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Shardnet is a node implementation for a decentralized shard-storage
//! network. Peers negotiate signed storage contracts over a topic-routed
//! publish/subscribe overlay, transfer shard bytes through token-gated
//! HTTP endpoints and prove retention with Merkle audit challenges.
//!
//! The crate is organized around a small set of owned subsystems:
//!
//! * [`contract`]: the canonical storage agreement and its criteria topics
//! * [`audit`]: challenge generation and streaming proof production
//! * [`offers`]: bounded queues of counter-offers for published contracts
//! * [`store`]: per-shard state and the storage adapter seam
//! * [`shard_server`]: token-authorized shard upload/download
//! * [`rules`]: the wire-method handlers tying the above together
//! * [`node`]: the renter/farmer client surface
//!
//! Kademlia routing, message framing and NAT traversal are collaborator
//! concerns reached through the traits in [`node`].

pub mod audit;
pub mod contract;
pub mod crypto;
pub mod node;
pub mod offers;
pub mod rules;
pub mod shard_server;
pub mod store;
pub mod utils;

pub use contract::{Contract, SignatureRole};
pub use node::{Node, NodeConfig, NodeEvent};
pub use rules::ProtocolError;
