//! Test fixtures for operations and sync engines

use crate::config::{Config, QueueConfig};
use crate::core_crypto::{CryptoProvider, NullCryptoProvider};
use crate::core_protocol::ChannelTransport;
use crate::core_queue::{OfflineOperationQueue, Operation, OperationPriority};
use crate::core_sync::SyncEngine;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Session every fixture operation belongs to
pub const TEST_SESSION: &str = "s1";

/// An `update` on the test session with a retry budget of 3
pub fn update_op(id: &str, data: Value) -> Operation {
    Operation::new("update", TEST_SESSION, data, OperationPriority::Normal, 3).with_id(id)
}

pub fn delete_op(id: &str) -> Operation {
    Operation::new("delete", TEST_SESSION, Value::Null, OperationPriority::Normal, 3).with_id(id)
}

/// Engine over a plain in-memory queue
pub fn engine_with(node_id: &str, config: &Config, crypto: Arc<dyn CryptoProvider>) -> SyncEngine {
    let queue = Arc::new(OfflineOperationQueue::new(QueueConfig::default()));
    SyncEngine::new(node_id, config, queue, crypto)
}

/// Unauthenticated engine with default configuration
pub fn plain_engine(node_id: &str) -> SyncEngine {
    engine_with(node_id, &Config::default(), Arc::new(NullCryptoProvider))
}

/// Answer everything arriving on `transport` until the other end hangs up
pub fn spawn_responder(engine: Arc<SyncEngine>, transport: ChannelTransport) -> JoinHandle<()> {
    tokio::spawn(async move {
        while engine.process_next(&transport).await.unwrap_or(false) {}
    })
}
