//! Conflict Detector (C5) and Resolver (C6). See spec §4.4/§4.5.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::change::{Change, OpType, SyncError};
use crate::value::{Row, Value};

/// One record diverging on both sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub table: String,
    pub key: String,
    pub local_value: Row,
    pub remote_value: Row,
    pub local_ts: i64,
    pub remote_ts: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorOptions {
    /// If both sides carry `_sync_timestamp` and the absolute difference is
    /// below this tolerance, treat as equal rather than conflicting.
    pub timestamp_tolerance_ms: Option<i64>,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            timestamp_tolerance_ms: None,
        }
    }
}

/// Use the first available of `id`, `_id`, `uuid`, `key`; otherwise the
/// full row, canonically serialized.
pub fn key_projection(row: &Row) -> String {
    for candidate in ["id", "_id", "uuid", "key"] {
        if let Some(v) = row.get(candidate) {
            if !v.is_null() {
                return v.canonical();
            }
        }
    }
    let mut parts: Vec<String> = row
        .iter()
        .map(|(k, v)| format!("{k}={}", v.canonical()))
        .collect();
    parts.sort();
    parts.join("|")
}

fn latest_by_key(changes: &[Change]) -> HashMap<(String, String), &Change> {
    let mut index: HashMap<(String, String), &Change> = HashMap::new();
    for change in changes {
        let key = key_projection(&change.data);
        if key.is_empty() && change.data.is_empty() {
            // No extractable primary key: ignored by detection (still
            // pushed blindly), per spec §4.4 point 4.
            continue;
        }
        let map_key = (change.table.clone(), key);
        match index.get(&map_key) {
            // Strictly newer, or a tie: later in the input slice wins,
            // since `changes` is assumed ascending by timestamp/insertion
            // order (insertion-order tie-break per spec §4.4 step 1).
            Some(existing) if existing.timestamp > change.timestamp => {}
            _ => {
                index.insert(map_key, change);
            }
        }
    }
    index
}

/// Rows are equal iff every non-`_sync_`-prefixed column matches. When a
/// tolerance is configured and both sides carry `_sync_timestamp` within
/// that tolerance, the rows are treated as equal regardless of the above
/// (spec §4.4: "if both carry `_sync_timestamp` and `|diff| < tolerance`,
/// treat as equal").
fn rows_equal(a: &Row, b: &Row, options: &DetectorOptions) -> bool {
    if let Some(tolerance) = options.timestamp_tolerance_ms {
        if let (Some(Value::Integer(at)), Some(Value::Integer(bt))) =
            (a.get("_sync_timestamp"), b.get("_sync_timestamp"))
        {
            if (at - bt).abs() < tolerance {
                return true;
            }
        }
    }
    let keys: std::collections::BTreeSet<&String> = a
        .keys()
        .chain(b.keys())
        .filter(|k| !k.starts_with("_sync_"))
        .collect();
    for key in keys {
        let av = a.get(key).unwrap_or(&Value::Null);
        let bv = b.get(key).unwrap_or(&Value::Null);
        if av != bv {
            return false;
        }
    }
    true
}

/// Pairs local and remote changes by `(table, primary-key)` and identifies
/// value divergence and delete/update asymmetries.
pub fn detect_conflicts(
    local: &[Change],
    remote: &[Change],
    options: &DetectorOptions,
) -> Vec<Conflict> {
    let local_index = latest_by_key(local);
    let remote_index = latest_by_key(remote);

    let mut conflicts = Vec::new();
    let mut seen_keys: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();

    for (map_key, local_change) in &local_index {
        seen_keys.insert(map_key.clone());
        let Some(remote_change) = remote_index.get(map_key) else {
            continue;
        };

        match (local_change.op, remote_change.op) {
            (OpType::Delete, OpType::Delete) => continue,
            (OpType::Delete, _) | (_, OpType::Delete) => {
                conflicts.push(Conflict {
                    table: map_key.0.clone(),
                    key: map_key.1.clone(),
                    local_value: if local_change.op == OpType::Delete {
                        Row::new()
                    } else {
                        local_change.data.clone()
                    },
                    remote_value: if remote_change.op == OpType::Delete {
                        Row::new()
                    } else {
                        remote_change.data.clone()
                    },
                    local_ts: local_change.timestamp,
                    remote_ts: remote_change.timestamp,
                });
            }
            _ => {
                if !rows_equal(&local_change.data, &remote_change.data, options) {
                    conflicts.push(Conflict {
                        table: map_key.0.clone(),
                        key: map_key.1.clone(),
                        local_value: local_change.data.clone(),
                        remote_value: remote_change.data.clone(),
                        local_ts: local_change.timestamp,
                        remote_ts: remote_change.timestamp,
                    });
                }
            }
        }
    }

    conflicts
}

/// Declared conflict-resolution strategy, per spec §4.5.
#[derive(Clone)]
pub enum ConflictPolicy {
    LocalWins,
    RemoteWins,
    LatestWins,
    Merge(std::sync::Arc<dyn Fn(&Conflict) -> Result<Row, SyncError> + Send + Sync>),
    Manual,
}

impl std::fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictPolicy::LocalWins => write!(f, "LocalWins"),
            ConflictPolicy::RemoteWins => write!(f, "RemoteWins"),
            ConflictPolicy::LatestWins => write!(f, "LatestWins"),
            ConflictPolicy::Merge(_) => write!(f, "Merge(..)"),
            ConflictPolicy::Manual => write!(f, "Manual"),
        }
    }
}

/// Resolves a single conflict per the declared policy. A resolver failure
/// for any single conflict fails the batch resolution and is surfaced
/// (handled by the caller iterating over a conflict list).
pub fn resolve(conflict: &Conflict, policy: &ConflictPolicy) -> Result<Row, SyncError> {
    match policy {
        ConflictPolicy::LocalWins => Ok(conflict.local_value.clone()),
        ConflictPolicy::RemoteWins => Ok(conflict.remote_value.clone()),
        ConflictPolicy::LatestWins => {
            if conflict.local_ts > conflict.remote_ts {
                Ok(conflict.local_value.clone())
            } else {
                // Ties favor remote.
                Ok(conflict.remote_value.clone())
            }
        }
        ConflictPolicy::Merge(merge_fn) => merge_fn(conflict),
        ConflictPolicy::Manual => Err(SyncError::RequiresManual(format!(
            "{}:{}",
            conflict.table, conflict.key
        ))),
    }
}

/// Resolves every conflict in `conflicts`, failing the whole batch if any
/// single conflict fails to resolve.
pub fn resolve_all(conflicts: &[Conflict], policy: &ConflictPolicy) -> Result<Vec<Row>, SyncError> {
    conflicts.iter().map(|c| resolve(c, policy)).collect()
}

/// Built-in merge: prefer the non-null field from either side, preferring
/// the local value when both are non-null.
pub fn prefer_non_null_merge(conflict: &Conflict) -> Result<Row, SyncError> {
    let mut out = Row::new();
    let keys: std::collections::BTreeSet<&String> = conflict
        .local_value
        .keys()
        .chain(conflict.remote_value.keys())
        .collect();
    for key in keys {
        let local = conflict.local_value.get(key);
        let remote = conflict.remote_value.get(key);
        let chosen = match (local, remote) {
            (Some(l), _) if !l.is_null() => l.clone(),
            (_, Some(r)) if !r.is_null() => r.clone(),
            (Some(l), _) => l.clone(),
            (None, Some(r)) => r.clone(),
            (None, None) => Value::Null,
        };
        out.insert(key.clone(), chosen);
    }
    Ok(out)
}

/// Built-in merge: set-union on array-valued columns (represented as a
/// JSON-encoded `Value::Text`), prefer-non-null elsewhere.
pub fn set_union_merge(conflict: &Conflict) -> Result<Row, SyncError> {
    let mut out = prefer_non_null_merge(conflict)?;
    let keys: std::collections::BTreeSet<&String> = conflict
        .local_value
        .keys()
        .chain(conflict.remote_value.keys())
        .collect();
    for key in keys {
        if let (Some(Value::Text(l)), Some(Value::Text(r))) =
            (conflict.local_value.get(key), conflict.remote_value.get(key))
        {
            if let (Ok(serde_json::Value::Array(la)), Ok(serde_json::Value::Array(ra))) = (
                serde_json::from_str::<serde_json::Value>(l),
                serde_json::from_str::<serde_json::Value>(r),
            ) {
                let mut union: Vec<serde_json::Value> = la;
                for item in ra {
                    if !union.contains(&item) {
                        union.push(item);
                    }
                }
                out.insert(
                    key.clone(),
                    Value::Text(serde_json::to_string(&union)?),
                );
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeDescriptor;

    fn row_with_id(id: &str, name: &str) -> Row {
        let mut r = Row::new();
        r.insert("id".to_string(), Value::Text(id.to_string()));
        r.insert("name".to_string(), Value::Text(name.to_string()));
        r
    }

    fn change(table: &str, op: OpType, data: Row, ts: i64) -> Change {
        let descriptor = ChangeDescriptor::new(table, op, data);
        Change {
            id: "x".to_string(),
            table: descriptor.table,
            op: descriptor.op,
            timestamp: ts,
            data: descriptor.data,
            old_data: descriptor.old_data,
            synced: false,
        }
    }

    #[test]
    fn detects_divergent_values() {
        let local = vec![change("users", OpType::Update, row_with_id("1", "Local"), 1000)];
        let remote = vec![change("users", OpType::Update, row_with_id("1", "Remote"), 2000)];
        let conflicts = detect_conflicts(&local, &remote, &DetectorOptions::default());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].table, "users");
    }

    #[test]
    fn identical_rows_are_not_conflicts() {
        let local = vec![change("users", OpType::Update, row_with_id("1", "Same"), 1000)];
        let remote = vec![change("users", OpType::Update, row_with_id("1", "Same"), 2000)];
        assert!(detect_conflicts(&local, &remote, &DetectorOptions::default()).is_empty());
    }

    #[test]
    fn update_vs_delete_emits_asymmetric_conflict() {
        let local = vec![change("users", OpType::Update, row_with_id("1", "Local"), 1000)];
        let remote = vec![change("users", OpType::Delete, Row::new(), 2000)];
        let conflicts = detect_conflicts(&local, &remote, &DetectorOptions::default());
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].remote_value.is_empty());
    }

    #[test]
    fn rows_with_no_extractable_key_are_ignored() {
        let local = vec![change("users", OpType::Update, Row::new(), 1000)];
        let remote = vec![change("users", OpType::Update, Row::new(), 2000)];
        assert!(detect_conflicts(&local, &remote, &DetectorOptions::default()).is_empty());
    }

    #[test]
    fn latest_wins_ties_favor_remote() {
        let conflict = Conflict {
            table: "users".to_string(),
            key: "1".to_string(),
            local_value: row_with_id("1", "Local"),
            remote_value: row_with_id("1", "Remote"),
            local_ts: 1000,
            remote_ts: 1000,
        };
        let resolved = resolve(&conflict, &ConflictPolicy::LatestWins).unwrap();
        assert_eq!(resolved.get("name").unwrap().as_text(), Some("Remote"));
    }

    #[test]
    fn latest_wins_picks_larger_timestamp() {
        let conflict = Conflict {
            table: "users".to_string(),
            key: "1".to_string(),
            local_value: row_with_id("1", "Local"),
            remote_value: row_with_id("1", "Remote"),
            local_ts: 2000,
            remote_ts: 1000,
        };
        let resolved = resolve(&conflict, &ConflictPolicy::LatestWins).unwrap();
        assert_eq!(resolved.get("name").unwrap().as_text(), Some("Local"));
    }

    #[test]
    fn manual_policy_fails_with_requires_manual() {
        let conflict = Conflict {
            table: "users".to_string(),
            key: "1".to_string(),
            local_value: row_with_id("1", "Local"),
            remote_value: row_with_id("1", "Remote"),
            local_ts: 1000,
            remote_ts: 1000,
        };
        let err = resolve(&conflict, &ConflictPolicy::Manual).unwrap_err();
        assert!(matches!(err, SyncError::RequiresManual(_)));
    }

    #[test]
    fn prefer_non_null_merge_fills_gaps_from_either_side() {
        let mut local_value = Row::new();
        local_value.insert("a".to_string(), Value::Null);
        local_value.insert("b".to_string(), Value::Text("local-b".to_string()));
        let mut remote_value = Row::new();
        remote_value.insert("a".to_string(), Value::Text("remote-a".to_string()));
        remote_value.insert("b".to_string(), Value::Null);

        let conflict = Conflict {
            table: "t".to_string(),
            key: "1".to_string(),
            local_value,
            remote_value,
            local_ts: 1,
            remote_ts: 2,
        };
        let merged = prefer_non_null_merge(&conflict).unwrap();
        assert_eq!(merged.get("a").unwrap().as_text(), Some("remote-a"));
        assert_eq!(merged.get("b").unwrap().as_text(), Some("local-b"));
    }
}
