//! Sync Engine (C9): state machine coordinating push, pull, full sync,
//! auto-sync scheduling, progress emission, and error propagation. See
//! spec §4.8.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::batch::{self, BatchOptions};
use crate::change::{Change, ChangeDescriptor, SyncError};
use crate::change_log::ChangeLog;
use crate::conflict::{self, Conflict, ConflictPolicy, DetectorOptions};
use crate::config::{ConflictPolicyKind, SyncConfig};
use crate::local_store::LocalStoreGateway;
use crate::network::NetworkMonitor;
use crate::remote_store::RemoteStore;
use crate::table_filter::TableFilter;
use crate::value::Value;

/// Emitted by the engine as it moves through its lifecycle. Transitions are
/// totally ordered and never coalesced across observable states (spec §5):
/// `Idle -> Syncing -> Idle` is never collapsed to `Idle -> Idle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncState {
    Uninitialized,
    Idle,
    Syncing { progress: u8 },
    Error { kind: String, message: String },
    Conflict { list: Vec<Conflict> },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushResult {
    pub uploaded: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullResult {
    pub downloaded: usize,
    pub applied: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResult {
    pub pushed: usize,
    pub pulled: usize,
    pub conflicts: Vec<Conflict>,
    pub errors: Vec<String>,
    pub duration_ms: i64,
}

fn policy_from_config(kind: ConflictPolicyKind) -> ConflictPolicy {
    match kind {
        ConflictPolicyKind::LocalWins => ConflictPolicy::LocalWins,
        ConflictPolicyKind::RemoteWins => ConflictPolicy::RemoteWins,
        ConflictPolicyKind::LatestWins => ConflictPolicy::LatestWins,
        ConflictPolicyKind::Merge => {
            ConflictPolicy::Merge(Arc::new(|c: &Conflict| conflict::prefer_non_null_merge(c)))
        }
        ConflictPolicyKind::Manual => ConflictPolicy::Manual,
    }
}

/// Parameterized over its three collaborators, the engine owns no
/// process-wide singleton: it is constructed once by the embedder with the
/// Change Log, Local Store Gateway, Remote Store Client, and Network
/// Monitor it should use (spec §9).
pub struct SyncEngine<G, R, N>
where
    G: LocalStoreGateway + 'static,
    R: RemoteStore + 'static,
    N: NetworkMonitor + 'static,
{
    change_log: Arc<dyn ChangeLog>,
    local_store: Arc<G>,
    remote_store: Arc<R>,
    network: Arc<N>,
    config: AsyncRwLock<Option<SyncConfig>>,
    state_tx: watch::Sender<SyncState>,
    auto_sync_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

impl<G, R, N> SyncEngine<G, R, N>
where
    G: LocalStoreGateway + 'static,
    R: RemoteStore + 'static,
    N: NetworkMonitor + 'static,
{
    pub fn new(change_log: Arc<dyn ChangeLog>, local_store: Arc<G>, remote_store: Arc<R>, network: Arc<N>) -> Self {
        let (state_tx, _rx) = watch::channel(SyncState::Uninitialized);
        Self {
            change_log,
            local_store,
            remote_store,
            network,
            config: AsyncRwLock::new(None),
            state_tx,
            auto_sync_handle: AsyncMutex::new(None),
        }
    }

    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    fn emit(&self, state: SyncState) {
        let _ = self.state_tx.send(state);
    }

    fn current_state_is_idle(&self) -> bool {
        matches!(*self.state_tx.borrow(), SyncState::Idle)
    }

    /// The engine never latches into `Error` or `Conflict` (spec §7): a
    /// terminal non-idle state left over from the previous tick is reset to
    /// `Idle` so the next attempt can proceed.
    fn reset_if_latched(&self) {
        let latched = matches!(*self.state_tx.borrow(), SyncState::Error { .. } | SyncState::Conflict { .. });
        if latched {
            self.emit(SyncState::Idle);
        }
    }

    async fn require_config(&self) -> Result<SyncConfig, SyncError> {
        self.config
            .read()
            .await
            .clone()
            .ok_or_else(|| SyncError::validation("engine is not initialized"))
    }

    /// Authenticates via the Remote Store Client; on success stores the
    /// config and emits `Idle`. Auth errors are preserved verbatim (not
    /// wrapped as `Unknown`) so downstream handlers can trigger token
    /// refresh.
    pub async fn initialize(&self, config: SyncConfig) -> Result<(), SyncError> {
        let token = config.credential.resolve()?;
        self.remote_store.authenticate(&token).await?;
        self.remote_store
            .configure_compression(config.compression_enabled, config.compression_threshold_bytes);
        *self.config.write().await = Some(config);
        info!("sync engine initialized");
        self.emit(SyncState::Idle);
        Ok(())
    }

    pub async fn record_change(&self, descriptor: ChangeDescriptor) -> Result<Change, SyncError> {
        self.change_log.record(descriptor).await
    }

    fn table_filter(&self, config: &SyncConfig) -> Result<TableFilter, SyncError> {
        TableFilter::new(&config.table_filter)
            .map_err(|e| SyncError::validation(format!("invalid table filter pattern: {e}")))
    }

    fn group_by_table(changes: Vec<Change>) -> HashMap<String, Vec<Change>> {
        let mut grouped: HashMap<String, Vec<Change>> = HashMap::new();
        for change in changes {
            grouped.entry(change.table.clone()).or_default().push(change);
        }
        grouped
    }

    /// Fetch unsynced local changes, filter by table, group by table,
    /// upload each group's rows in batches, and mark succeeded ids synced.
    pub async fn push(&self) -> Result<PushResult, SyncError> {
        if !self.current_state_is_idle() {
            return Err(SyncError::validation("push() requires the engine to be Idle"));
        }
        let config = self.require_config().await?;
        let result = self.push_with_config(&config).await?;
        self.emit(SyncState::Idle);
        Ok(result)
    }

    async fn push_with_config(&self, config: &SyncConfig) -> Result<PushResult, SyncError> {
        let unsynced = self.change_log.unsynced(0).await?;
        if unsynced.is_empty() {
            return Ok(PushResult::default());
        }

        let filter = self.table_filter(config)?;
        let filtered = filter.filter_changes(unsynced);
        let grouped = Self::group_by_table(filtered);

        let mut uploaded = 0usize;
        let mut failed = 0usize;
        let mut errors = Vec::new();
        let mut synced_ids: Vec<String> = Vec::new();

        for (table, changes) in grouped {
            let rows: Vec<_> = changes.iter().map(|c| c.data.clone()).collect();
            let ids: Vec<String> = changes.iter().map(|c| c.id.clone()).collect();
            let estimated_size: usize = rows
                .iter()
                .map(|r| serde_json::to_vec(r).map(|v| v.len()).unwrap_or(0))
                .sum();
            if config.compression_enabled && estimated_size >= config.compression_threshold_bytes {
                debug!(table = %table, estimated_size, "payload qualifies for compression (enforced by the remote client, configured at initialize)");
            }

            let remote_store = self.remote_store.clone();
            let table_for_closure = table.clone();
            let batch_options = config.batch_options();
            let retry_options = config.retry_options();
            // Chunked identically to `batch::process`'s own fixed-size
            // splitting, so `id_chunks[i]` names exactly the ids uploaded
            // in `batch_results[i]`.
            let id_chunks: Vec<Vec<String>> = ids
                .chunks(batch_options.batch_size.max(1))
                .map(|c| c.to_vec())
                .collect();

            let batch_results = batch::process(
                rows,
                move |batch_rows| {
                    let remote_store = remote_store.clone();
                    let table_for_closure = table_for_closure.clone();
                    let retry_options = retry_options;
                    async move {
                        batch::retry_with_backoff(retry_options, move || {
                            let remote_store = remote_store.clone();
                            let table_for_closure = table_for_closure.clone();
                            let batch_rows = batch_rows.clone();
                            async move { remote_store.upload(&table_for_closure, &batch_rows).await }
                        })
                        .await
                    }
                },
                BatchOptions {
                    batch_size: batch_options.batch_size,
                    concurrency: batch_options.concurrency,
                    delay_between_batches: None,
                },
            )
            .await;

            // Preserve the synced flag only for ids whose enclosing batch
            // succeeded (spec §4.8 push step 7) — a table with one failing
            // batch among several still marks the successful batches' ids.
            for (chunk, result) in id_chunks.into_iter().zip(batch_results.into_iter()) {
                match result {
                    Ok(()) => {
                        uploaded += chunk.len();
                        synced_ids.extend(chunk);
                    }
                    Err(err) => {
                        failed += chunk.len();
                        errors.push(format!("{table}: {err}"));
                    }
                }
            }
        }

        if !synced_ids.is_empty() {
            self.change_log.mark_synced(&synced_ids).await?;
        }

        Ok(PushResult {
            uploaded,
            failed,
            errors,
        })
    }

    /// Downloads each configured table in parallel, then applies each
    /// table's rows inside its own scoped transaction (delete-then-reinsert
    /// per spec §4.8 / Open Question #2).
    pub async fn pull(&self) -> Result<PullResult, SyncError> {
        if !self.current_state_is_idle() {
            return Err(SyncError::validation("pull() requires the engine to be Idle"));
        }
        let config = self.require_config().await?;
        let result = self.pull_with_config(&config).await?;
        self.emit(SyncState::Idle);
        Ok(result)
    }

    async fn pull_with_config(&self, config: &SyncConfig) -> Result<PullResult, SyncError> {
        if config.tables.is_empty() {
            return Err(SyncError::validation("pull() requires a non-empty tables list"));
        }

        let downloads: Vec<(String, Result<Vec<crate::value::Row>, SyncError>)> = {
            let mut join_set = tokio::task::JoinSet::new();
            for table in &config.tables {
                let remote_store = self.remote_store.clone();
                let table = table.clone();
                join_set.spawn(async move {
                    let rows = remote_store.download(&table, None).await;
                    (table, rows)
                });
            }
            let mut out = Vec::new();
            while let Some(res) = join_set.join_next().await {
                if let Ok(pair) = res {
                    out.push(pair);
                }
            }
            out
        };

        let mut downloaded = 0usize;
        let mut applied = 0usize;
        let mut errors = Vec::new();

        for (table, rows) in downloads {
            let rows = match rows {
                Ok(rows) => rows,
                Err(e) => {
                    errors.push(format!("{table}: {e}"));
                    continue;
                }
            };
            downloaded += rows.len();
            debug!(table = %table, rows = rows.len(), "replacing local table contents from remote snapshot");

            let mut statements: Vec<(String, Vec<Value>)> =
                vec![(format!("DELETE FROM {table}"), Vec::new())];
            for row in &rows {
                let columns: Vec<&str> = row.keys().map(|s| s.as_str()).collect();
                let placeholders: Vec<String> = (1..=columns.len()).map(|n| format!("${n}")).collect();
                let sql = format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    columns.join(", "),
                    placeholders.join(", ")
                );
                let values: Vec<Value> = row.values().cloned().collect();
                statements.push((sql, values));
            }

            // Delete-then-reinsert runs as one scoped transaction per table
            // (spec §4.8 pull step 3): a failure on any insert rolls back
            // the delete too, so a table is never left truncated.
            match self.local_store.transaction(&statements).await {
                Ok(()) => applied += rows.len(),
                Err(e) => errors.push(format!("{table}: {e}")),
            }
        }

        Ok(PullResult {
            downloaded,
            applied,
            errors,
        })
    }

    /// Full sync: gather unsynced, download remote snapshots, detect
    /// conflicts against the true remote change set, push (unless
    /// conflicts remain and the policy is `manual`), then pull.
    pub async fn sync(&self) -> Result<SyncResult, SyncError> {
        if !self.current_state_is_idle() {
            return Err(SyncError::validation("sync() requires the engine to be Idle"));
        }
        let config = self.require_config().await?;
        let start = std::time::Instant::now();
        self.emit(SyncState::Syncing { progress: 10 });

        let local_unsynced = self.change_log.unsynced(0).await?;
        self.emit(SyncState::Syncing { progress: 30 });

        let mut remote_changes: Vec<Change> = Vec::new();
        let mut errors = Vec::new();
        if !config.tables.is_empty() {
            let mut join_set = tokio::task::JoinSet::new();
            for table in &config.tables {
                let remote_store = self.remote_store.clone();
                let table = table.clone();
                join_set.spawn(async move {
                    let rows = remote_store.download(&table, None).await;
                    (table, rows)
                });
            }
            while let Some(res) = join_set.join_next().await {
                if let Ok((table, rows)) = res {
                    match rows {
                        Ok(rows) => {
                            for row in rows {
                                remote_changes.push(Change {
                                    id: crate::change::new_change_id(),
                                    table: table.clone(),
                                    op: crate::change::OpType::Update,
                                    timestamp: chrono::Utc::now().timestamp_millis(),
                                    data: row,
                                    old_data: None,
                                    synced: true,
                                });
                            }
                        }
                        Err(e) => errors.push(format!("{table}: {e}")),
                    }
                }
            }
        }
        self.emit(SyncState::Syncing { progress: 40 });

        // Conflict detection always consumes the true downloaded remote
        // change set (resolves Open Question #3: never call with an empty
        // remote list).
        let conflicts = conflict::detect_conflicts(&local_unsynced, &remote_changes, &DetectorOptions::default());
        self.emit(SyncState::Syncing { progress: 60 });

        let mut pushed = 0usize;
        if conflicts.is_empty() || config.conflict_policy != ConflictPolicyKind::Manual {
            match self.push_with_config(&config).await {
                Ok(push_result) => {
                    pushed = push_result.uploaded;
                    errors.extend(push_result.errors);
                }
                Err(e) => errors.push(e.to_string()),
            }
        }
        self.emit(SyncState::Syncing { progress: 80 });

        let mut pulled = 0usize;
        if !config.tables.is_empty() {
            match self.pull_with_config(&config).await {
                Ok(pull_result) => {
                    pulled = pull_result.applied;
                    errors.extend(pull_result.errors);
                }
                Err(e) => errors.push(e.to_string()),
            }
        }
        self.emit(SyncState::Syncing { progress: 100 });

        let duration_ms = start.elapsed().as_millis().max(1) as i64;
        let result = SyncResult {
            pushed,
            pulled,
            conflicts: conflicts.clone(),
            errors,
            duration_ms,
        };

        if !conflicts.is_empty() {
            self.emit(SyncState::Conflict { list: conflicts });
        } else {
            self.emit(SyncState::Idle);
        }

        Ok(result)
    }

    /// Starts the periodic auto-sync scheduler. Idempotent: calling this
    /// while already running is a no-op.
    pub async fn start_auto_sync(self: &Arc<Self>) {
        let mut handle_slot = self.auto_sync_handle.lock().await;
        if handle_slot.is_some() {
            return;
        }
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let interval_ms = match engine.config.read().await.as_ref() {
                    Some(cfg) => cfg.sync_interval_ms,
                    None => 30_000,
                };
                tokio::time::sleep(std::time::Duration::from_millis(interval_ms)).await;

                if !engine.network.current().online {
                    engine.emit(SyncState::Idle);
                    continue;
                }

                engine.reset_if_latched();
                if !engine.current_state_is_idle() {
                    continue;
                }

                match engine.sync().await {
                    Ok(result) if !result.conflicts.is_empty() => {
                        // sync() already emitted Conflict; nothing further.
                        debug!(conflicts = result.conflicts.len(), "auto-sync tick found conflicts");
                    }
                    Ok(_) => {
                        debug!("auto-sync tick completed");
                    }
                    Err(e) => {
                        error!(error = %e, "auto-sync tick failed");
                        engine.emit(SyncState::Error {
                            kind: "sync".to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        });
        *handle_slot = Some(handle);
        info!("auto-sync started");
    }

    /// Stops the scheduler. Idempotent. Does not cancel an in-flight sync.
    pub async fn stop_auto_sync(&self) {
        let mut handle_slot = self.auto_sync_handle.lock().await;
        if let Some(handle) = handle_slot.take() {
            handle.abort();
            info!("auto-sync stopped");
        }
    }

    pub async fn is_auto_sync_running(&self) -> bool {
        self.auto_sync_handle.lock().await.is_some()
    }

    /// Applies the configured conflict policy to each conflict, surfacing
    /// the resolved value without applying it to either store — embedders
    /// call this to decide what to write back after a `Conflict` state is
    /// observed.
    pub fn resolve_conflicts(
        &self,
        conflicts: &[Conflict],
        config: &SyncConfig,
    ) -> Result<Vec<crate::value::Row>, SyncError> {
        let policy = policy_from_config(config.conflict_policy);
        conflict::resolve_all(conflicts, &policy)
    }
}
