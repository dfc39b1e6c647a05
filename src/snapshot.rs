//! Key-space snapshots.
//!
//! A snapshot is the frozen, ordered list of keys one run of the job will
//! operate over, persisted as a list at the source itself. Keys written to
//! the source after snapshot time are not picked up. A snapshot interrupted
//! before its complete flag is set is discarded and rebuilt from scratch on
//! the next invocation; only batch transfer is resumable.

use bytes::Bytes;
use tracing::{debug, info};

use crate::client::Connection;
use crate::error::{MigrateError, Result};
use crate::state::StateKeys;

/// Keys appended to the snapshot list per round trip.
const SNAPSHOT_WRITE_CHUNK: usize = 512;

/// Persists and reads per-source key snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    keys: StateKeys,
}

impl SnapshotStore {
    /// Create a snapshot store over a job's key schema.
    pub fn new(keys: StateKeys) -> Self {
        Self { keys }
    }

    /// Ensure a complete snapshot exists for the connection's endpoint.
    ///
    /// No-op when the complete flag is already set. Otherwise any partial
    /// list is dropped, all keys currently present are enumerated, the job's
    /// own bookkeeping keys are filtered out, and the rest is persisted in
    /// bounded chunks before the complete flag is set. Returns the snapshot
    /// length.
    pub async fn ensure_snapshot(&self, source: &mut Connection) -> Result<u64> {
        let identity = source.endpoint().identity();
        let list_key = self.keys.snapshot_list(&identity);
        let flag_key = self.keys.snapshot_complete(&identity);

        let complete = source
            .get(flag_key.as_bytes())
            .await
            .map_err(|e| MigrateError::source(&identity, e))?;
        if matches!(complete.as_deref(), Some(b"1")) {
            let len = self.len(source).await?;
            debug!(source = %identity, keys = len, "snapshot already complete");
            return Ok(len);
        }

        info!(source = %identity, "building key snapshot");

        // Partial snapshots are never resumed; start clean.
        source
            .del(list_key.as_bytes())
            .await
            .map_err(|e| MigrateError::source(&identity, e))?;

        let all_keys = source
            .keys("*")
            .await
            .map_err(|e| MigrateError::source(&identity, e))?;

        let mut total: u64 = 0;
        let mut chunk: Vec<Bytes> = Vec::with_capacity(SNAPSHOT_WRITE_CHUNK);
        for key in all_keys {
            if self.keys.is_reserved(&key) {
                continue;
            }
            chunk.push(key);
            if chunk.len() == SNAPSHOT_WRITE_CHUNK {
                source
                    .rpush(list_key.as_bytes(), &chunk)
                    .await
                    .map_err(|e| MigrateError::source(&identity, e))?;
                total += chunk.len() as u64;
                chunk.clear();
            }
        }
        if !chunk.is_empty() {
            source
                .rpush(list_key.as_bytes(), &chunk)
                .await
                .map_err(|e| MigrateError::source(&identity, e))?;
            total += chunk.len() as u64;
        }

        source
            .set(flag_key.as_bytes(), b"1")
            .await
            .map_err(|e| MigrateError::source(&identity, e))?;

        info!(source = %identity, keys = total, "snapshot complete");
        Ok(total)
    }

    /// Length of the persisted snapshot (0 when absent).
    pub async fn len(&self, source: &mut Connection) -> Result<u64> {
        let identity = source.endpoint().identity();
        let list_key = self.keys.snapshot_list(&identity);
        let len = source
            .llen(list_key.as_bytes())
            .await
            .map_err(|e| MigrateError::source(&identity, e))?;
        Ok(len.max(0) as u64)
    }

    /// Whether the complete flag is set.
    pub async fn is_complete(&self, source: &mut Connection) -> Result<bool> {
        let identity = source.endpoint().identity();
        let flag = source
            .get(self.keys.snapshot_complete(&identity).as_bytes())
            .await
            .map_err(|e| MigrateError::source(&identity, e))?;
        Ok(matches!(flag.as_deref(), Some(b"1")))
    }

    /// Fetch snapshot entries for the half-open window `[start, end)`.
    pub async fn window(
        &self,
        source: &mut Connection,
        start: u64,
        end: u64,
    ) -> Result<Vec<Bytes>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let identity = source.endpoint().identity();
        let list_key = self.keys.snapshot_list(&identity);
        // LRANGE's stop index is inclusive.
        source
            .lrange(list_key.as_bytes(), start as i64, end as i64 - 1)
            .await
            .map_err(|e| MigrateError::source(&identity, e))
    }
}
