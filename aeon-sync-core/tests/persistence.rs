/*
    persistence.rs - Restart recovery over the SQLite record store

    Components write through to a `RecordStore`; these tests drop them and
    rebuild from the same database file.
*/

use aeon_sync_core::config::{CoordinatorConfig, QueueConfig};
use aeon_sync_core::core_crypto::NullCryptoProvider;
use aeon_sync_core::core_migration::{Migration, MigrationEngine, MigrationStatus, MigrationTracker, SemVer};
use aeon_sync_core::core_queue::{OfflineOperationQueue, OperationPriority, OperationStatus};
use aeon_sync_core::core_sync::{NodeInfo, SyncCoordinator};
use aeon_sync_core::storage::{collections, RecordStore, SqlRecordStore};
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

fn v(s: &str) -> SemVer {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_queue_survives_restart_mid_sync() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("aeon.db");

    let (first, second) = {
        let store: Arc<dyn RecordStore> = Arc::new(SqlRecordStore::new(&path)?);
        let queue = OfflineOperationQueue::with_store(QueueConfig::default(), store);
        let first = queue.enqueue("update", json!({"n": 1}), "s1", OperationPriority::High, None).await.unwrap();
        let second = queue.enqueue("update", json!({"n": 2}), "s1", OperationPriority::Normal, None).await.unwrap();
        queue.mark_syncing(&[first.clone()]).await.unwrap();
        (first, second)
    };

    // Reopen: the in-flight operation is handed back as pending
    let store: Arc<dyn RecordStore> = Arc::new(SqlRecordStore::new(&path)?);
    let queue = OfflineOperationQueue::restore(QueueConfig::default(), store).await?;
    assert_eq!(queue.len().await, 2);
    assert_eq!(queue.get_operation(&first).await.unwrap().status, OperationStatus::Pending);

    let batch = queue.get_next_batch(10).await;
    let ids: Vec<_> = batch.iter().map(|op| op.id.clone()).collect();
    assert_eq!(ids, vec![first, second]);
    Ok(())
}

#[tokio::test]
async fn test_coordinator_reloads_nodes() -> Result<()> {
    let dir = tempdir()?;
    let store: Arc<dyn RecordStore> = Arc::new(SqlRecordStore::new(dir.path().join("aeon.db"))?);

    let coordinator = SyncCoordinator::new(CoordinatorConfig::default(), Arc::new(NullCryptoProvider))
        .with_store(store.clone());
    for id in ["a", "b"] {
        coordinator
            .register_node(NodeInfo { id: id.into(), address: format!("{}.local", id), ..Default::default() })
            .await
            .unwrap();
    }
    coordinator.create_sync_session("a", vec!["b".into()]).await.unwrap();

    let reloaded = SyncCoordinator::new(CoordinatorConfig::default(), Arc::new(NullCryptoProvider)).with_store(store);
    assert_eq!(reloaded.load_from_store().await.unwrap(), (2, 1));
    assert_eq!(reloaded.get_node("b").await.unwrap().address, "b.local");
    Ok(())
}

#[tokio::test]
async fn test_migration_history_allows_rollback_after_restart() -> Result<()> {
    let dir = tempdir()?;
    let store = SqlRecordStore::new(dir.path().join("aeon.db"))?;

    let rename = || {
        Migration::new("rename-title", v("1.0.0"), v("1.1.0"), |mut data| {
            let title = data.as_object_mut().and_then(|o| o.remove("title")).ok_or("no title")?;
            data["name"] = title;
            Ok(data)
        })
        .with_down(|mut data| {
            let name = data.as_object_mut().and_then(|o| o.remove("name")).ok_or("no name")?;
            data["title"] = name;
            Ok(data)
        })
    };

    let upgraded = {
        let mut engine = MigrationEngine::new();
        engine.register(rename()).unwrap();
        let upgraded = engine.execute_pending(v("1.0.0"), v("1.1.0"), json!({"title": "A"})).unwrap();
        assert_eq!(engine.tracker().persist(&store).await.unwrap(), 1);
        upgraded
    };
    assert_eq!(store.list(collections::MIGRATIONS).await.unwrap().len(), 1);

    // A fresh engine without history refuses the downgrade
    let mut engine = MigrationEngine::new();
    engine.register(rename()).unwrap();
    assert!(engine.execute_pending(v("1.1.0"), v("1.0.0"), upgraded.clone()).is_err());

    let tracker = MigrationTracker::load(&store).await?;
    assert!(tracker.can_rollback(v("1.1.0"), v("1.0.0")));
    let mut engine = MigrationEngine::with_tracker(tracker);
    engine.register(rename()).unwrap();
    let restored = engine.execute_pending(v("1.1.0"), v("1.0.0"), upgraded).unwrap();
    assert_eq!(restored, json!({"title": "A"}));

    let statuses: Vec<_> = engine.tracker().get_history().iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![MigrationStatus::Applied, MigrationStatus::RolledBack]);
    Ok(())
}
