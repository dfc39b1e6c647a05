//! Persisted job state.
//!
//! All run state lives inside the source stores themselves, under reserved
//! key names namespaced by the job prefix, so a migration survives operator
//! restarts with no extra infrastructure. This module owns the key-name
//! schema and the job-scoped singletons: the run lock and the first-run
//! flag, both stored at the job anchor (first source, first database).

use bytes::Bytes;

use crate::client::{ClientError, Connection};
use crate::error::{MigrateError, Result};

/// Key-name schema for one job's persisted state.
///
/// Every reserved key starts with the job prefix, which is also how
/// bookkeeping keys are excluded from snapshots.
#[derive(Debug, Clone)]
pub struct StateKeys {
    prefix: String,
}

impl StateKeys {
    /// Create the schema for a job prefix (`mig:`, `rsk:`, ...).
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The job prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Run-lock key, job-scoped.
    pub fn run_lock(&self) -> String {
        format!("{}run", self.prefix)
    }

    /// First-run flag key, job-scoped.
    pub fn first_run(&self) -> String {
        format!("{}firstrun", self.prefix)
    }

    /// Snapshot list key for one source identity.
    pub fn snapshot_list(&self, identity: &str) -> String {
        format!("{}keylist:{}", self.prefix, identity)
    }

    /// Snapshot-complete flag key for one source identity.
    pub fn snapshot_complete(&self, identity: &str) -> String {
        format!("{}havekeylist:{}", self.prefix, identity)
    }

    /// Checkpoint key for one source identity.
    pub fn checkpoint(&self, identity: &str) -> String {
        format!("{}keymoved:{}", self.prefix, identity)
    }

    /// Whether a data key belongs to this job's bookkeeping and must never
    /// be transferred.
    pub fn is_reserved(&self, key: &[u8]) -> bool {
        key.starts_with(self.prefix.as_bytes())
    }
}

/// Job-scoped mutable state: run lock, first-run flag, cleanup.
#[derive(Debug, Clone)]
pub struct JobState {
    keys: StateKeys,
}

impl JobState {
    /// Create the state accessor for a job prefix.
    pub fn new(keys: StateKeys) -> Self {
        Self { keys }
    }

    /// The key schema.
    pub fn keys(&self) -> &StateKeys {
        &self.keys
    }

    /// Atomically take the run lock. Returns false when another run holds it.
    pub async fn try_acquire(&self, anchor: &mut Connection) -> Result<bool> {
        anchor
            .setnx(self.keys.run_lock().as_bytes(), b"1")
            .await
            .map_err(|e| anchor_err(anchor, e))
    }

    /// Release the run lock unconditionally.
    pub async fn release(&self, anchor: &mut Connection) -> Result<()> {
        anchor
            .del(self.keys.run_lock().as_bytes())
            .await
            .map(|_| ())
            .map_err(|e| anchor_err(anchor, e))
    }

    /// Whether the one-time target flush has already happened.
    pub async fn first_run_done(&self, anchor: &mut Connection) -> Result<bool> {
        let flag = anchor
            .get(self.keys.first_run().as_bytes())
            .await
            .map_err(|e| anchor_err(anchor, e))?;
        Ok(matches!(flag.as_deref(), Some(b"1")))
    }

    /// Record that the one-time target flush has happened.
    pub async fn mark_first_run(&self, anchor: &mut Connection) -> Result<()> {
        anchor
            .set(self.keys.first_run().as_bytes(), b"1")
            .await
            .map_err(|e| anchor_err(anchor, e))
    }

    /// Delete the job-scoped singletons (lock, first-run flag). Part of the
    /// `clean` operation; also the escape hatch for a lock left behind by a
    /// crashed run.
    pub async fn clean_job(&self, anchor: &mut Connection) -> Result<()> {
        for key in [self.keys.run_lock(), self.keys.first_run()] {
            anchor
                .del(key.as_bytes())
                .await
                .map_err(|e| anchor_err(anchor, e))?;
        }
        Ok(())
    }

    /// Delete all per-source state (snapshot, completion flag, checkpoint)
    /// for one source identity, without touching data keys.
    pub async fn clean_source(&self, conn: &mut Connection, identity: &str) -> Result<()> {
        for key in [
            self.keys.snapshot_list(identity),
            self.keys.snapshot_complete(identity),
            self.keys.checkpoint(identity),
        ] {
            conn.del(key.as_bytes())
                .await
                .map_err(|e| anchor_err(conn, e))?;
        }
        Ok(())
    }
}

fn anchor_err(conn: &Connection, e: ClientError) -> MigrateError {
    MigrateError::source(conn.endpoint(), e)
}

/// Parse a persisted counter value (absent means zero).
pub fn parse_counter(value: Option<Bytes>) -> u64 {
    value
        .as_deref()
        .and_then(|b| std::str::from_utf8(b).ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0)
}
