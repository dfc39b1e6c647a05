//! Run statistics.
//!
//! Shared counters updated by transfer workers and reported once per run.
//! Counters are monotonic within a run and reset by constructing a fresh
//! [`RunStats`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::endpoint::Address;

/// Live counters for one run, shared across workers.
#[derive(Debug)]
pub struct RunStats {
    keys_copied: AtomicU64,
    keys_skipped: AtomicU64,
    bytes_copied: AtomicU64,
    per_target: Mutex<BTreeMap<Address, u64>>,
    started: Instant,
}

/// Point-in-time view of [`RunStats`], suitable for reports.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    /// Keys written to a target.
    pub keys_copied: u64,
    /// Keys absent or expired at transfer time.
    pub keys_skipped: u64,
    /// Approximate payload bytes written.
    pub bytes_copied: u64,
    /// Keys written per target address (`host:port`).
    pub per_target: BTreeMap<String, u64>,
    /// Wall-clock seconds since the run started.
    pub elapsed_secs: f64,
    /// Copy throughput over the run so far.
    pub keys_per_sec: f64,
}

impl RunStats {
    /// Start counting from now.
    pub fn new() -> Self {
        Self {
            keys_copied: AtomicU64::new(0),
            keys_skipped: AtomicU64::new(0),
            bytes_copied: AtomicU64::new(0),
            per_target: Mutex::new(BTreeMap::new()),
            started: Instant::now(),
        }
    }

    /// Record one key written to `target`.
    pub fn record_copied(&self, target: &Address, bytes: u64) {
        self.keys_copied.fetch_add(1, Ordering::Relaxed);
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
        *self.per_target.lock().entry(target.clone()).or_insert(0) += 1;
    }

    /// Record one key skipped because it vanished before transfer.
    pub fn record_skipped(&self) {
        self.keys_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    pub fn report(&self) -> ProgressReport {
        let keys_copied = self.keys_copied.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        ProgressReport {
            keys_copied,
            keys_skipped: self.keys_skipped.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            per_target: self
                .per_target
                .lock()
                .iter()
                .map(|(addr, n)| (addr.to_string(), *n))
                .collect(),
            elapsed_secs: elapsed,
            keys_per_sec: if elapsed > 0.0 {
                keys_copied as f64 / elapsed
            } else {
                0.0
            },
        }
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}
