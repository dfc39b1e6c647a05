//! Transfer checkpoints.
//!
//! A checkpoint is a single non-negative integer per source identity: the
//! number of snapshot entries already transferred. It only advances after a
//! whole batch has been durably written, so everything below the checkpoint
//! is guaranteed transferred and a crash mid-batch replays the same window.

use crate::client::Connection;
use crate::error::{MigrateError, Result};
use crate::state::{parse_counter, StateKeys};

/// Reads and advances per-source checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    keys: StateKeys,
}

impl CheckpointStore {
    /// Create a checkpoint store over a job's key schema.
    pub fn new(keys: StateKeys) -> Self {
        Self { keys }
    }

    /// Current checkpoint for the connection's endpoint (0 when absent).
    pub async fn read(&self, source: &mut Connection) -> Result<u64> {
        let identity = source.endpoint().identity();
        let raw = source
            .get(self.keys.checkpoint(&identity).as_bytes())
            .await
            .map_err(|e| MigrateError::source(&identity, e))?;
        Ok(parse_counter(raw))
    }

    /// Persist a new checkpoint. Callers guarantee monotonicity: `new_value`
    /// is never below the stored checkpoint.
    pub async fn advance(&self, source: &mut Connection, new_value: u64) -> Result<()> {
        let identity = source.endpoint().identity();
        source
            .set(
                self.keys.checkpoint(&identity).as_bytes(),
                new_value.to_string().as_bytes(),
            )
            .await
            .map_err(|e| MigrateError::source(&identity, e))
    }

    /// Number of snapshot entries eligible for transfer: the snapshot length,
    /// minus the reserved final entry under the legacy boundary convention.
    pub fn eligible(&self, snapshot_len: u64, reserve_final_key: bool) -> u64 {
        if reserve_final_key {
            snapshot_len.saturating_sub(1)
        } else {
            snapshot_len
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eligible_without_reservation() {
        let store = CheckpointStore::new(StateKeys::new("mig:"));
        assert_eq!(store.eligible(10, false), 10);
        assert_eq!(store.eligible(0, false), 0);
    }

    #[test]
    fn test_eligible_with_legacy_reservation() {
        let store = CheckpointStore::new(StateKeys::new("mig:"));
        assert_eq!(store.eligible(10, true), 9);
        // An empty snapshot never underflows.
        assert_eq!(store.eligible(0, true), 0);
    }
}
