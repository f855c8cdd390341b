//! Live brokers keyed by stream

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::registry::{RegistryError, StreamKey};

use super::fanout::FrameBroker;

/// Index of the brokers of all currently published streams
#[derive(Default)]
pub struct BrokerHub {
    brokers: RwLock<HashMap<StreamKey, Arc<FrameBroker>>>,
}

impl BrokerHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the broker for a newly publishing stream
    pub async fn create(
        &self,
        key: StreamKey,
        publisher_id: u64,
    ) -> Result<Arc<FrameBroker>, RegistryError> {
        let mut brokers = self.brokers.write().await;
        if brokers.contains_key(&key) {
            return Err(RegistryError::StreamKeyInUse(key));
        }
        let broker = Arc::new(FrameBroker::new(key.clone(), publisher_id));
        brokers.insert(key.clone(), Arc::clone(&broker));
        tracing::debug!(stream = %key, publisher_id, "Broker created");
        Ok(broker)
    }

    pub async fn get(&self, key: &StreamKey) -> Option<Arc<FrameBroker>> {
        self.brokers.read().await.get(key).cloned()
    }

    /// Remove the broker if `publisher_id` still owns it
    pub async fn remove(&self, key: &StreamKey, publisher_id: u64) -> Option<Arc<FrameBroker>> {
        let mut brokers = self.brokers.write().await;
        match brokers.get(key).map(|broker| broker.publisher_id()) {
            Some(owner) if owner == publisher_id => brokers.remove(key),
            Some(owner) => {
                tracing::warn!(
                    stream = %key,
                    owner,
                    publisher_id,
                    "Publisher mismatch on broker removal"
                );
                None
            }
            None => None,
        }
    }

    pub async fn count(&self) -> usize {
        self.brokers.read().await.len()
    }

    /// Remove every broker
    pub async fn drain(&self) -> Vec<Arc<FrameBroker>> {
        self.brokers.write().await.drain().map(|(_, b)| b).collect()
    }
}
