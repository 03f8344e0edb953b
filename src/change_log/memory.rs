use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;
use tracing::trace;

use super::ChangeLog;
use crate::change::{new_change_id, Change, ChangeDescriptor, SyncError};

struct State {
    rows: Vec<Change>,
    last_timestamp: i64,
}

/// In-memory `ChangeLog`, for tests and embedders with no local database.
/// Write path is serialized through a single mutex, matching the Change
/// Log's "concurrent callers are serialized" contract.
pub struct MemoryChangeLog {
    state: Mutex<State>,
}

impl Default for MemoryChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                rows: Vec::new(),
                last_timestamp: 0,
            }),
        }
    }
}

#[async_trait]
impl ChangeLog for MemoryChangeLog {
    async fn record(&self, descriptor: ChangeDescriptor) -> Result<Change, SyncError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now().timestamp_millis();
        let timestamp = now.max(state.last_timestamp);
        state.last_timestamp = timestamp;

        let change = Change {
            id: new_change_id(),
            table: descriptor.table,
            op: descriptor.op,
            timestamp,
            data: descriptor.data,
            old_data: descriptor.old_data,
            synced: false,
        };
        trace!(table = %change.table, id = %change.id, "recorded change in memory log");
        state.rows.push(change.clone());
        Ok(change)
    }

    async fn unsynced(&self, since_ts: i64) -> Result<Vec<Change>, SyncError> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<Change> = state
            .rows
            .iter()
            .filter(|c| !c.synced && c.timestamp > since_ts)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.timestamp);
        Ok(out)
    }

    async fn mark_synced(&self, ids: &[String]) -> Result<(), SyncError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        for row in state.rows.iter_mut() {
            if ids.contains(&row.id) {
                row.synced = true;
            }
        }
        Ok(())
    }

    async fn clear_before(&self, ts: i64) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        state.rows.retain(|c| !(c.synced && c.timestamp < ts));
        Ok(())
    }
}
