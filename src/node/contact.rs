// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::crypto::Keypair;
use libsecp256k1::SecretKey;
use serde::{Deserialize, Serialize};

/// Addressing details for one peer: its 40-hex node id, the reachable
/// address of its shard endpoint, and the HD key material it negotiates
/// contracts under (when it has any).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hd_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hd_index: Option<u32>,
}

impl Contact {
    pub fn new(id: &str, address: &str, port: u16) -> Self {
        Contact {
            id: id.to_owned(),
            address: address.to_owned(),
            port,
            hd_key: None,
            hd_index: None,
        }
    }

    pub fn with_hd_key(mut self, hd_key: &str, hd_index: u32) -> Self {
        self.hd_key = Some(hd_key.to_owned());
        self.hd_index = Some(hd_index);
        self
    }
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.address, self.port)
    }
}

/// This node's own keys: the secp256k1 identity keypair and, when the
/// node negotiates under an HD tree, the extended public key and
/// derivation index advertised to counterparties.
pub struct Identity {
    keypair: Keypair,
    hd_key: Option<String>,
    hd_index: Option<u32>,
}

impl Identity {
    pub fn new(keypair: Keypair) -> Self {
        Identity {
            keypair,
            hd_key: None,
            hd_index: None,
        }
    }

    pub fn with_hd_key(mut self, hd_key: &str, hd_index: u32) -> Self {
        self.hd_key = Some(hd_key.to_owned());
        self.hd_index = Some(hd_index);
        self
    }

    pub fn node_id(&self) -> String {
        self.keypair.node_id()
    }

    pub fn secret(&self) -> &SecretKey {
        self.keypair.secret()
    }

    pub fn hd_key(&self) -> Option<&str> {
        self.hd_key.as_deref()
    }

    pub fn hd_index(&self) -> Option<u32> {
        self.hd_index
    }

    /// The contact other peers reach this node at.
    pub fn contact(&self, address: &str, port: u16) -> Contact {
        Contact {
            id: self.node_id(),
            address: address.to_owned(),
            port,
            hd_key: self.hd_key.clone(),
            hd_index: self.hd_index,
        }
    }
}
