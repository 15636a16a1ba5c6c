// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::ProtocolError;
use crate::node::Contact;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// User-supplied handler for one TRIGGER behavior.
#[async_trait]
pub trait TriggerProcessor: Send + Sync {
    async fn process(&self, contact: &Contact, params: &Value) -> Result<Value, ProtocolError>;
}

/// Registry of trigger processors, keyed by behavior name. The TRIGGER
/// handler is a pure pass-through: whatever the processor returns goes
/// back on the wire.
#[derive(Default)]
pub struct TriggerRegistry {
    processors: RwLock<HashMap<String, Arc<dyn TriggerProcessor>>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, behavior: &str, processor: Arc<dyn TriggerProcessor>) {
        self.processors
            .write()
            .insert(behavior.to_owned(), processor);
    }

    pub fn deregister(&self, behavior: &str) {
        self.processors.write().remove(behavior);
    }

    pub async fn process(
        &self,
        behavior: &str,
        contact: &Contact,
        params: &Value,
    ) -> Result<Value, ProtocolError> {
        let processor = self
            .processors
            .read()
            .get(behavior)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownTrigger(behavior.to_owned()))?;
        processor.process(contact, params).await
    }
}
