//! Run orchestration.
//!
//! Drives one bounded run of a job: take the run lock, make sure every
//! source has a complete key snapshot, optionally flush the targets once on
//! the job's first run, then transfer at most one batch per source and
//! advance its checkpoint. Sources fail independently; the lock is released
//! on every exit path. Repeated invocations converge on a complete transfer.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::client::{Connection, ConnectionPool};
use crate::config::JobConfig;
use crate::endpoint::Endpoint;
use crate::error::{MigrateError, Result};
use crate::placement::PlacementResolver;
use crate::progress::{ProgressReport, RunStats};
use crate::snapshot::SnapshotStore;
use crate::state::{JobState, StateKeys};
use crate::transfer::{transfer_key, TransferOutcome};

/// What happened to one source endpoint during a run.
#[derive(Debug, Clone, Serialize)]
pub enum SourceOutcome {
    /// The checkpoint already covered every eligible entry; nothing was read
    /// beyond the counters.
    AlreadyComplete {
        /// Total eligible snapshot entries, all transferred.
        eligible: u64,
    },
    /// One batch was transferred and the checkpoint advanced.
    Transferred {
        /// Checkpoint before the batch (first window index).
        from: u64,
        /// Checkpoint after the batch (one past the last window index).
        to: u64,
        /// Total eligible snapshot entries for this source.
        eligible: u64,
    },
    /// The source's batch failed; its checkpoint did not move.
    Failed {
        /// Human-readable failure, with endpoint identity where applicable.
        error: String,
    },
}

impl SourceOutcome {
    /// Whether this source has nothing left to transfer.
    pub fn is_complete(&self) -> bool {
        match self {
            SourceOutcome::AlreadyComplete { .. } => true,
            SourceOutcome::Transferred { to, eligible, .. } => to >= eligible,
            SourceOutcome::Failed { .. } => false,
        }
    }
}

/// Result of one run across all sources.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Per-source outcomes, keyed by identity, in configuration order.
    pub sources: Vec<(String, SourceOutcome)>,
    /// Aggregated transfer counters.
    pub progress: ProgressReport,
}

impl RunReport {
    /// Whether every source is fully transferred.
    pub fn is_complete(&self) -> bool {
        self.sources.iter().all(|(_, o)| o.is_complete())
    }

    /// Whether any source failed this run.
    pub fn has_failures(&self) -> bool {
        self.sources
            .iter()
            .any(|(_, o)| matches!(o, SourceOutcome::Failed { .. }))
    }
}

/// Read-only view of a job's persisted state.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    /// Whether the run lock is currently held.
    pub locked: bool,
    /// Whether the one-time target flush already happened.
    pub first_run_done: bool,
    /// Per-source snapshot and checkpoint positions.
    pub sources: Vec<SourceStatus>,
}

/// Snapshot/checkpoint position of one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    /// Source identity (`host:port:db`).
    pub source: String,
    /// Live keys in the source database, bookkeeping included.
    pub db_keys: i64,
    /// Persisted snapshot length.
    pub snapshot_len: u64,
    /// Whether the snapshot's complete flag is set.
    pub snapshot_complete: bool,
    /// Entries already transferred.
    pub checkpoint: u64,
    /// Entries this job will transfer in total.
    pub eligible: u64,
}

/// Drives runs of one configured job.
#[derive(Debug)]
pub struct TransferOrchestrator {
    config: JobConfig,
    state: JobState,
    snapshots: SnapshotStore,
    checkpoints: CheckpointStore,
    resolver: Arc<PlacementResolver>,
    pool: Arc<ConnectionPool>,
}

impl TransferOrchestrator {
    /// Build an orchestrator for a validated configuration.
    pub fn new(config: JobConfig) -> Result<Self> {
        config.validate()?;
        let keys = StateKeys::new(config.prefix.clone());
        let resolver = Arc::new(PlacementResolver::from_spec(&config.placement));
        Ok(Self {
            state: JobState::new(keys.clone()),
            snapshots: SnapshotStore::new(keys.clone()),
            checkpoints: CheckpointStore::new(keys),
            resolver,
            pool: Arc::new(ConnectionPool::new()),
            config,
        })
    }

    /// All source endpoints, in configuration order.
    fn source_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        for addr in &self.config.sources {
            for &db in &self.config.databases {
                endpoints.push(addr.endpoint(db));
            }
        }
        endpoints
    }

    /// Execute one bounded run: at most `batch_size` keys per source.
    ///
    /// Fails with [`MigrateError::AlreadyRunning`] when another run holds the
    /// job lock, having mutated nothing. Per-source failures are isolated
    /// into the report; the lock is released before returning either way.
    pub async fn run(&self) -> Result<RunReport> {
        let anchor_endpoint = self.config.anchor();
        let mut anchor = Connection::connect(&anchor_endpoint)
            .await
            .map_err(|e| MigrateError::source(&anchor_endpoint, e))?;

        if !self.state.try_acquire(&mut anchor).await? {
            return Err(MigrateError::AlreadyRunning);
        }
        info!(anchor = %anchor_endpoint, prefix = %self.config.prefix, "run lock acquired");

        let outcome = self.run_locked(&mut anchor).await;

        if let Err(e) = self.state.release(&mut anchor).await {
            // Not fatal for the run itself; the operator can `clean` the
            // stale lock.
            warn!(error = %e, "failed to release run lock");
        }
        outcome
    }

    async fn run_locked(&self, anchor: &mut Connection) -> Result<RunReport> {
        let endpoints = self.source_endpoints();

        // Snapshots are frozen before the destructive flush phase runs.
        // Config validation guarantees no source address is also a target.
        let mut snapshot_errors: HashMap<String, String> = HashMap::new();
        for endpoint in &endpoints {
            if let Err(e) = self.ensure_source_snapshot(endpoint).await {
                warn!(source = %endpoint, error = %e, "snapshot failed");
                snapshot_errors.insert(endpoint.identity(), e.to_string());
            }
        }

        if self.config.flush_on_first_run && !self.state.first_run_done(anchor).await? {
            self.flush_targets().await?;
            self.state.mark_first_run(anchor).await?;
        }

        let stats = Arc::new(RunStats::new());
        let mut sources = Vec::new();
        for endpoint in endpoints {
            let identity = endpoint.identity();
            let outcome = if let Some(error) = snapshot_errors.remove(&identity) {
                SourceOutcome::Failed { error }
            } else {
                match self.run_source(&endpoint, Arc::clone(&stats)).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(
                            source = %identity,
                            error = %e,
                            retryable = e.is_retryable(),
                            "source batch failed"
                        );
                        SourceOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                }
            };
            sources.push((identity, outcome));
        }

        let report = RunReport {
            sources,
            progress: stats.report(),
        };
        let pool = self.pool.stats();
        info!(
            keys = report.progress.keys_copied,
            skipped = report.progress.keys_skipped,
            complete = report.is_complete(),
            connections = pool.connected,
            reused = pool.reused,
            "run finished"
        );
        Ok(report)
    }

    /// Make sure a complete snapshot exists for one source. Idempotent; the
    /// transfer phase re-reads the snapshot length through the same flag.
    async fn ensure_source_snapshot(&self, endpoint: &Endpoint) -> Result<()> {
        let mut conn = self
            .pool
            .acquire(endpoint)
            .await
            .map_err(|e| MigrateError::source(endpoint, e))?;
        self.snapshots.ensure_snapshot(&mut conn).await?;
        self.pool.release(conn).await;
        Ok(())
    }

    /// Flush every target database once. Destructive; gated on the job's
    /// first-run flag by the caller.
    async fn flush_targets(&self) -> Result<()> {
        for addr in self.config.placement.target_addresses() {
            for &db in &self.config.databases {
                let endpoint = addr.endpoint(db);
                let mut conn = self
                    .pool
                    .acquire(&endpoint)
                    .await
                    .map_err(|e| MigrateError::target(&endpoint, e))?;
                conn.flushdb()
                    .await
                    .map_err(|e| MigrateError::target(&endpoint, e))?;
                info!(target = %endpoint, "flushed target database");
                self.pool.release(conn).await;
            }
        }
        Ok(())
    }

    /// Transfer at most one batch for one source.
    async fn run_source(
        &self,
        endpoint: &Endpoint,
        stats: Arc<RunStats>,
    ) -> Result<SourceOutcome> {
        let identity = endpoint.identity();
        let mut conn = self
            .pool
            .acquire(endpoint)
            .await
            .map_err(|e| MigrateError::source(&identity, e))?;

        let snapshot_len = self.snapshots.ensure_snapshot(&mut conn).await?;
        let eligible = self
            .checkpoints
            .eligible(snapshot_len, self.config.reserve_final_key);
        let checkpoint = self.checkpoints.read(&mut conn).await?;

        if checkpoint >= eligible {
            info!(source = %identity, eligible, "source already complete");
            self.pool.release(conn).await;
            return Ok(SourceOutcome::AlreadyComplete { eligible });
        }

        let end = eligible.min(checkpoint + self.config.batch_size);
        let window = self.snapshots.window(&mut conn, checkpoint, end).await?;
        info!(
            source = %identity,
            from = checkpoint,
            to = end,
            eligible,
            "transferring batch"
        );

        self.transfer_window(endpoint, window, Arc::clone(&stats))
            .await?;

        // The whole window landed; only now does the checkpoint move.
        self.checkpoints.advance(&mut conn, end).await?;
        self.pool.release(conn).await;

        Ok(SourceOutcome::Transferred {
            from: checkpoint,
            to: end,
            eligible,
        })
    }

    /// Transfer one window of keys with bounded parallelism. Any worker
    /// failure aborts the batch.
    async fn transfer_window(
        &self,
        source: &Endpoint,
        window: Vec<Bytes>,
        stats: Arc<RunStats>,
    ) -> Result<()> {
        // Snapshots written by this version never contain reserved keys, but
        // ones persisted by older tooling under the same prefix might.
        let keys: Vec<Bytes> = window
            .into_iter()
            .filter(|k| !self.state.keys().is_reserved(k))
            .collect();
        if keys.is_empty() {
            return Ok(());
        }

        let workers = self.config.parallelism.min(keys.len());
        let chunk_len = keys.len().div_ceil(workers);

        let mut set: JoinSet<Result<()>> = JoinSet::new();
        for chunk in keys.chunks(chunk_len) {
            set.spawn(transfer_chunk(
                Arc::clone(&self.pool),
                Arc::clone(&self.resolver),
                Arc::clone(&stats),
                source.clone(),
                chunk.to_vec(),
            ));
        }

        let mut first_error: Option<MigrateError> = None;
        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(MigrateError::Worker(e.to_string())),
            };
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                }
                // Remaining workers are left to finish; the batch already
                // cannot advance the checkpoint.
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Read the job's persisted state without taking the lock or mutating
    /// anything.
    pub async fn status(&self) -> Result<JobStatus> {
        let anchor_endpoint = self.config.anchor();
        let mut anchor = Connection::connect(&anchor_endpoint)
            .await
            .map_err(|e| MigrateError::source(&anchor_endpoint, e))?;

        let lock = anchor
            .get(self.state.keys().run_lock().as_bytes())
            .await
            .map_err(|e| MigrateError::source(&anchor_endpoint, e))?;
        let first_run_done = self.state.first_run_done(&mut anchor).await?;

        let mut sources = Vec::new();
        for endpoint in self.source_endpoints() {
            let mut conn = self
                .pool
                .acquire(&endpoint)
                .await
                .map_err(|e| MigrateError::source(&endpoint, e))?;
            let db_keys = conn
                .dbsize()
                .await
                .map_err(|e| MigrateError::source(&endpoint, e))?;
            let snapshot_len = self.snapshots.len(&mut conn).await?;
            let snapshot_complete = self.snapshots.is_complete(&mut conn).await?;
            let checkpoint = self.checkpoints.read(&mut conn).await?;
            self.pool.release(conn).await;
            sources.push(SourceStatus {
                source: endpoint.identity(),
                db_keys,
                snapshot_len,
                snapshot_complete,
                checkpoint,
                eligible: self
                    .checkpoints
                    .eligible(snapshot_len, self.config.reserve_final_key),
            });
        }

        Ok(JobStatus {
            locked: lock.is_some(),
            first_run_done,
            sources,
        })
    }

    /// Delete every piece of persisted job state: the lock, the first-run
    /// flag, and each source's snapshot and checkpoint. Data keys are never
    /// touched. Also the escape hatch for a lock left by a crashed run.
    pub async fn clean(&self) -> Result<()> {
        let anchor_endpoint = self.config.anchor();
        let mut anchor = Connection::connect(&anchor_endpoint)
            .await
            .map_err(|e| MigrateError::source(&anchor_endpoint, e))?;
        self.state.clean_job(&mut anchor).await?;

        for endpoint in self.source_endpoints() {
            let identity = endpoint.identity();
            let mut conn = self
                .pool
                .acquire(&endpoint)
                .await
                .map_err(|e| MigrateError::source(&identity, e))?;
            self.state.clean_source(&mut conn, &identity).await?;
            self.pool.release(conn).await;
            info!(source = %identity, "cleaned job state");
        }
        Ok(())
    }
}

/// One worker's share of a batch: transfer `keys` from `source`, routing
/// each key through the resolver. Owns its connections for the duration.
async fn transfer_chunk(
    pool: Arc<ConnectionPool>,
    resolver: Arc<PlacementResolver>,
    stats: Arc<RunStats>,
    source: Endpoint,
    keys: Vec<Bytes>,
) -> Result<()> {
    let mut src = pool
        .acquire(&source)
        .await
        .map_err(|e| MigrateError::source(&source, e))?;
    let mut targets: HashMap<Endpoint, Connection> = HashMap::new();

    for key in &keys {
        let addr = resolver.resolve(key).clone();
        let target_endpoint = addr.endpoint(source.db);
        if !targets.contains_key(&target_endpoint) {
            let conn = pool
                .acquire(&target_endpoint)
                .await
                .map_err(|e| MigrateError::target(&target_endpoint, e))?;
            targets.insert(target_endpoint.clone(), conn);
        }
        let target = targets
            .get_mut(&target_endpoint)
            .unwrap_or_else(|| unreachable!("target connection just inserted"));

        match transfer_key(&mut src, target, key).await? {
            (TransferOutcome::Copied, bytes) => stats.record_copied(&addr, bytes),
            (TransferOutcome::Skipped, _) => stats.record_skipped(),
        }
    }

    pool.release(src).await;
    for (_, conn) in targets {
        pool.release(conn).await;
    }
    Ok(())
}
