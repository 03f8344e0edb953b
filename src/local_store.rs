//! Local Store Gateway (C3): parameterized query/execute with scoped
//! acquisition of a transaction. See spec §4.2.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::SecondsFormat;
use rusqlite::Connection;
use tracing::trace;

use crate::change::SyncError;
use crate::value::{Row, Value};

#[async_trait]
pub trait LocalStoreGateway: Send + Sync {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SyncError>;
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<(), SyncError>;

    /// Runs `statements` as a single scoped transaction: all succeed and
    /// commit, or any failure rolls back every statement in the list
    /// (spec §4.2/§6 — `transaction` is a C3 contract operation).
    async fn transaction(&self, statements: &[(String, Vec<Value>)]) -> Result<(), SyncError>;
}

/// Renders a positional `$N` parameter for inline substitution, following
/// the exact escaping rules of spec §4.2: strings double their single
/// quotes, instants render as ISO-8601, byte arrays hex-encode as
/// `\xHH...`, booleans render as `true`/`false`, and null renders as
/// `NULL`.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        Value::Null => "NULL".to_string(),
        Value::Instant(t) => format!("'{}'", t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        Value::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{byte:02x}")).collect();
            format!("'\\x{hex}'")
        }
    }
}

/// Substitutes `$1`, `$2`, ... markers in `sql` with their positional
/// parameter, rendered via [`render_value`]. Returns a `Validation` error
/// if a marker references a parameter index out of range, distinguishable
/// from a runtime failure raised by the underlying engine.
pub fn substitute_params(sql: &str, params: &[Value]) -> Result<String, SyncError> {
    let mut out = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            let n: usize = sql[start..end].parse().map_err(|_| {
                SyncError::validation(format!("invalid parameter marker at byte {i}"))
            })?;
            if n == 0 || n > params.len() {
                return Err(SyncError::validation(format!(
                    "parameter ${n} out of range (have {})",
                    params.len()
                )));
            }
            out.push_str(&render_value(&params[n - 1]));
            i = end;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    Ok(out)
}

/// A `rusqlite`-backed gateway. Transactions are non-reentrant: a nested
/// `transaction()` call while one is already open returns a `Validation`
/// error rather than silently nesting.
pub struct SqliteLocalStore {
    conn: std::sync::Mutex<Connection>,
    in_transaction: AtomicBool,
}

impl SqliteLocalStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: std::sync::Mutex::new(conn),
            in_transaction: AtomicBool::new(false),
        }
    }

    /// Scoped acquisition of a transaction: `BEGIN` on entry, `COMMIT` on
    /// success, `ROLLBACK` on any failure from `body`. The reentrancy guard
    /// is claimed with a single atomic compare-exchange so two threads
    /// racing `with_transaction()` can't both proceed.
    pub fn with_transaction<T>(
        &self,
        body: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        if self
            .in_transaction
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::validation("transaction() is not reentrant"));
        }
        let conn = self.conn.lock().unwrap();
        let tx = match conn.unchecked_transaction() {
            Ok(tx) => tx,
            Err(e) => {
                self.in_transaction.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        let result = body(&tx);
        let outcome = match result {
            Ok(value) => tx.commit().map(|_| value).map_err(SyncError::from),
            Err(e) => {
                // rollback happens implicitly on drop of `tx` when commit is
                // never called.
                Err(e)
            }
        };
        self.in_transaction.store(false, Ordering::Release);
        outcome
    }
}

#[async_trait]
impl LocalStoreGateway for SqliteLocalStore {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SyncError> {
        let rendered = substitute_params(sql, params)?;
        trace!(sql = %rendered, "executing query");
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&rendered).map_err(|e| {
            SyncError::validation(format!("invalid SQL: {e}"))
        })?;
        let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let column_count = column_names.len();

        let rows = stmt
            .query_map([], |r| {
                let mut row = Row::new();
                for (idx, name) in column_names.iter().enumerate().take(column_count) {
                    let value: rusqlite::types::Value = r.get(idx)?;
                    row.insert(name.clone(), sqlite_value_to_value(value));
                }
                Ok(row)
            })
            .map_err(SyncError::from)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<(), SyncError> {
        let rendered = substitute_params(sql, params)?;
        trace!(sql = %rendered, "executing statement");
        let conn = self.conn.lock().unwrap();
        conn.execute(&rendered, [])
            .map_err(|e| SyncError::validation(format!("invalid SQL: {e}")))?;
        Ok(())
    }

    async fn transaction(&self, statements: &[(String, Vec<Value>)]) -> Result<(), SyncError> {
        trace!(count = statements.len(), "executing scoped transaction");
        self.with_transaction(|tx| {
            for (sql, params) in statements {
                let rendered = substitute_params(sql, params)?;
                tx.execute(&rendered, []).map_err(SyncError::from)?;
            }
            Ok(())
        })
    }
}

fn sqlite_value_to_value(v: rusqlite::types::Value) -> Value {
    use rusqlite::types::Value as SqlValue;
    match v {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(i),
        SqlValue::Real(f) => Value::Real(f),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Blob(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_and_escapes_values() {
        let params = vec![
            Value::Text("O'Brien".to_string()),
            Value::Integer(42),
            Value::Bool(true),
            Value::Null,
        ];
        let sql = substitute_params("INSERT INTO t VALUES ($1, $2, $3, $4)", &params).unwrap();
        assert_eq!(sql, "INSERT INTO t VALUES ('O''Brien', 42, true, NULL)");
    }

    #[test]
    fn out_of_range_marker_is_validation_error() {
        let err = substitute_params("SELECT $1", &[]).unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }

    #[test]
    fn nested_transaction_is_rejected() {
        let store = SqliteLocalStore::new(Connection::open_in_memory().unwrap());
        let result = store.with_transaction(|_tx| {
            store.with_transaction(|_tx2| Ok(()))
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn trait_transaction_rolls_back_whole_batch_on_failure() {
        let store = SqliteLocalStore::new(Connection::open_in_memory().unwrap());
        store
            .execute("CREATE TABLE t (id TEXT PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();

        let statements = vec![
            (
                "INSERT INTO t (id, name) VALUES ($1, $2)".to_string(),
                vec![Value::Text("1".to_string()), Value::Text("a".to_string())],
            ),
            (
                "INSERT INTO t (id, name) VALUES ($1, $2)".to_string(),
                vec![Value::Text("1".to_string()), Value::Text("b".to_string())],
            ),
        ];
        let err = store.transaction(&statements).await;
        assert!(err.is_err(), "duplicate primary key must fail the transaction");

        let rows = store.query("SELECT * FROM t", &[]).await.unwrap();
        assert!(rows.is_empty(), "failed transaction must roll back the first insert too");
    }
}
