//! Change Log (C2): durably records every mutation against tracked tables,
//! independently of business tables. See spec §4.1.

mod memory;
mod sqlite;

pub use memory::MemoryChangeLog;
pub use sqlite::SqliteChangeLog;

use async_trait::async_trait;

use crate::change::{Change, ChangeDescriptor, SyncError};

/// Relation name for the bit-exact wire schema (spec §6).
pub const TABLE_NAME: &str = "_sync_changes";

#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Assigns `id` and `timestamp`, persists durably, returns the
    /// materialized Change. Never overwrites. Concurrent callers are
    /// serialized.
    async fn record(&self, descriptor: ChangeDescriptor) -> Result<Change, SyncError>;

    /// Changes whose `synced = false` and `timestamp > since_ts`, ordered
    /// ascending by `timestamp` then by insertion order.
    async fn unsynced(&self, since_ts: i64) -> Result<Vec<Change>, SyncError>;

    /// Sets `synced = true` for matching ids. Unknown ids are silently
    /// ignored; empty input is a no-op success.
    async fn mark_synced(&self, ids: &[String]) -> Result<(), SyncError>;

    /// Removes rows with `synced = true` and `timestamp < ts`. Never
    /// removes unsynced rows regardless of age.
    async fn clear_before(&self, ts: i64) -> Result<(), SyncError>;
}

#[cfg(test)]
mod contract_tests {
    use super::*;
    use crate::change::OpType;
    use crate::value::Value;
    use std::collections::BTreeMap;

    fn row(id: &str) -> BTreeMap<String, Value> {
        let mut r = BTreeMap::new();
        r.insert("id".to_string(), Value::Text(id.to_string()));
        r
    }

    async fn run_contract(log: &dyn ChangeLog) {
        let c1 = log
            .record(ChangeDescriptor::new("users", OpType::Insert, row("1")))
            .await
            .unwrap();
        let c2 = log
            .record(ChangeDescriptor::new("users", OpType::Insert, row("2")))
            .await
            .unwrap();
        assert!(c2.timestamp >= c1.timestamp);
        assert_ne!(c1.id, c2.id);

        let unsynced = log.unsynced(0).await.unwrap();
        assert_eq!(unsynced.len(), 2);
        assert!(unsynced.iter().all(|c| !c.synced));
        assert!(unsynced.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        log.mark_synced(&[c1.id.clone()]).await.unwrap();
        let unsynced = log.unsynced(0).await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].id, c2.id);

        // Unknown ids are silently ignored; empty input is a no-op.
        log.mark_synced(&["does-not-exist".to_string()]).await.unwrap();
        log.mark_synced(&[]).await.unwrap();

        // clear_before never removes unsynced rows.
        log.clear_before(i64::MAX).await.unwrap();
        let unsynced = log.unsynced(0).await.unwrap();
        assert_eq!(unsynced.len(), 1, "clear_before must not touch unsynced rows");

        log.mark_synced(&[c2.id.clone()]).await.unwrap();
        log.clear_before(i64::MAX).await.unwrap();
        let unsynced = log.unsynced(0).await.unwrap();
        assert!(unsynced.is_empty());
    }

    #[tokio::test]
    async fn memory_change_log_satisfies_contract() {
        run_contract(&MemoryChangeLog::new()).await;
    }

    #[tokio::test]
    async fn sqlite_change_log_satisfies_contract() {
        let log = SqliteChangeLog::open_in_memory().unwrap();
        run_contract(&log).await;
    }
}
