use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;
use tracing::warn;

use super::ChangeLog;
use crate::change::{new_change_id, Change, ChangeDescriptor, OpType, SyncError};
use crate::value::Row;

/// `rusqlite`-backed `ChangeLog` implementing the bit-exact `_sync_changes`
/// schema of spec §6. All statements use `rusqlite::params!` bound
/// parameters; the teacher's codebase mixes interpolated and parameterized
/// SQL for schema statements, which the spec calls out (Open Question #1)
/// as a bug not to reproduce — this implementation never interpolates a
/// value into SQL text.
pub struct SqliteChangeLog {
    conn: Mutex<Connection>,
}

impl SqliteChangeLog {
    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    pub fn open(path: &str) -> Result<Self, SyncError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, SyncError> {
        conn.execute_batch(
            r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS _sync_changes (
    id TEXT PRIMARY KEY,
    "table" TEXT NOT NULL,
    op TEXT NOT NULL CHECK(op IN ('insert','update','delete')),
    timestamp INTEGER NOT NULL,
    data TEXT NOT NULL,
    old_data TEXT,
    synced INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_changes_timestamp ON _sync_changes(timestamp);
CREATE INDEX IF NOT EXISTS idx_sync_changes_synced ON _sync_changes(synced);
"#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn decode_row(
        id: String,
        table: String,
        op: String,
        timestamp: i64,
        data: String,
        old_data: Option<String>,
        synced: i64,
    ) -> Result<Change, SyncError> {
        let op = OpType::from_str(&op)
            .ok_or_else(|| SyncError::validation(format!("unknown op type {op}")))?;
        let data: Row = serde_json::from_str(&data)?;
        let old_data: Option<Row> = match old_data {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        };
        Ok(Change {
            id,
            table,
            op,
            timestamp,
            data,
            old_data,
            synced: synced != 0,
        })
    }
}

#[async_trait]
impl ChangeLog for SqliteChangeLog {
    async fn record(&self, descriptor: ChangeDescriptor) -> Result<Change, SyncError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let last_timestamp: i64 = tx
            .query_row("SELECT COALESCE(MAX(timestamp), 0) FROM _sync_changes", [], |r| {
                r.get(0)
            })
            .optional()?
            .unwrap_or(0);
        let timestamp = Utc::now().timestamp_millis().max(last_timestamp);

        let id = new_change_id();
        let data_json = serde_json::to_string(&descriptor.data)?;
        let old_data_json = descriptor
            .old_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        tx.execute(
            r#"INSERT INTO _sync_changes (id, "table", op, timestamp, data, old_data, synced)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)"#,
            params![
                id,
                descriptor.table,
                descriptor.op.as_str(),
                timestamp,
                data_json,
                old_data_json,
            ],
        )?;
        tx.commit()?;

        Ok(Change {
            id,
            table: descriptor.table,
            op: descriptor.op,
            timestamp,
            data: descriptor.data,
            old_data: descriptor.old_data,
            synced: false,
        })
    }

    async fn unsynced(&self, since_ts: i64) -> Result<Vec<Change>, SyncError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT id, "table", op, timestamp, data, old_data, synced
               FROM _sync_changes
               WHERE synced = 0 AND timestamp > ?1
               ORDER BY timestamp ASC, rowid ASC"#,
        )?;

        let rows = stmt.query_map(params![since_ts], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, i64>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        let mut decode_failed = false;
        for row in rows {
            let (id, table, op, timestamp, data, old_data, synced) = row?;
            match Self::decode_row(id, table, op, timestamp, data, old_data, synced) {
                Ok(change) => out.push(change),
                Err(e) => {
                    decode_failed = true;
                    warn!(error = %e, "skipping change log row that failed to decode");
                }
            }
        }
        if decode_failed {
            warn!("one or more rows skipped during unsynced() scan due to decode failures");
        }
        Ok(out)
    }

    async fn mark_synced(&self, ids: &[String]) -> Result<(), SyncError> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        for id in ids {
            tx.execute(
                "UPDATE _sync_changes SET synced = 1 WHERE id = ?1",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn clear_before(&self, ts: i64) -> Result<(), SyncError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM _sync_changes WHERE synced = 1 AND timestamp < ?1",
            params![ts],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeDescriptor;
    use crate::value::Value;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn decode_failure_skips_row_but_keeps_scanning() {
        let log = SqliteChangeLog::open_in_memory().unwrap();
        let mut row = BTreeMap::new();
        row.insert("id".to_string(), Value::Text("1".into()));
        log.record(ChangeDescriptor::new("users", OpType::Insert, row))
            .await
            .unwrap();

        // Corrupt the op column directly to simulate partial decode.
        {
            let conn = log.conn.lock().unwrap();
            conn.execute("UPDATE _sync_changes SET op = 'bogus'", [])
                .unwrap();
        }

        let result = log.unsynced(0).await.unwrap();
        assert!(result.is_empty(), "corrupt row must be skipped, not surfaced as data");
    }
}
