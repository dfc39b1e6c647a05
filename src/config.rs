//! Job configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::endpoint::Address;
use crate::error::MigrateError;

/// Reserved-key prefix for the direct copy/migrate variant.
pub const DIRECT_PREFIX: &str = "mig:";

/// Reserved-key prefix for the hash-sharded variant.
pub const SHARD_PREFIX: &str = "rsk:";

/// Default number of keys transferred per run.
pub const DEFAULT_BATCH_SIZE: u64 = 10_000;

/// Default number of concurrent transfer workers per batch.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Where keys go: one fixed target, or a numbered shard cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementSpec {
    /// Every key goes to the single configured target.
    Direct(Address),
    /// Keys are distributed over nodes numbered `1..=N` by CRC-32 of the
    /// key bytes. N is fixed for the lifetime of the job.
    Sharded(BTreeMap<u32, Address>),
}

impl PlacementSpec {
    /// All distinct target addresses (flush and pooling iterate these).
    pub fn target_addresses(&self) -> Vec<&Address> {
        match self {
            PlacementSpec::Direct(addr) => vec![addr],
            PlacementSpec::Sharded(nodes) => nodes.values().collect(),
        }
    }
}

/// Configuration for one migration job.
///
/// A job identity is the combination of the key `prefix` and the source
/// endpoints; all persisted state (snapshots, checkpoints, the run lock)
/// lives under that namespace inside the source stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Source store addresses. Each is processed independently.
    pub sources: Vec<Address>,
    /// Target placement policy.
    pub placement: PlacementSpec,
    /// Database indices to migrate, applied to every source and target.
    pub databases: Vec<u32>,
    /// Maximum number of keys transferred per source per run.
    pub batch_size: u64,
    /// Concurrent transfer workers within one batch.
    pub parallelism: usize,
    /// Reserved-key prefix namespacing all persisted job state.
    pub prefix: String,
    /// Legacy boundary convention: leave the final snapshot entry out of the
    /// transferable range. Off by default; bookkeeping keys are already
    /// filtered at snapshot time.
    pub reserve_final_key: bool,
    /// Destructively flush every target database once, on the job's first
    /// run. Assumes the targets are empty or disposable.
    pub flush_on_first_run: bool,
}

impl JobConfig {
    /// Direct copy/migrate configuration with variant defaults.
    pub fn direct(source: Address, target: Address, databases: Vec<u32>) -> Self {
        Self {
            sources: vec![source],
            placement: PlacementSpec::Direct(target),
            databases,
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            prefix: DIRECT_PREFIX.to_string(),
            reserve_final_key: false,
            flush_on_first_run: true,
        }
    }

    /// Hash-sharded configuration with variant defaults.
    pub fn sharded(
        sources: Vec<Address>,
        nodes: BTreeMap<u32, Address>,
        databases: Vec<u32>,
    ) -> Self {
        Self {
            sources,
            placement: PlacementSpec::Sharded(nodes),
            databases,
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            prefix: SHARD_PREFIX.to_string(),
            reserve_final_key: false,
            flush_on_first_run: true,
        }
    }

    /// Validate the configuration. Fails before any run state is touched.
    pub fn validate(&self) -> Result<(), MigrateError> {
        if self.sources.is_empty() {
            return Err(MigrateError::Config("no source endpoints given".into()));
        }
        if self.databases.is_empty() {
            return Err(MigrateError::Config("no database indices given".into()));
        }
        if self.batch_size == 0 {
            return Err(MigrateError::Config("batch size must be positive".into()));
        }
        if self.parallelism == 0 {
            return Err(MigrateError::Config("parallelism must be positive".into()));
        }
        if self.prefix.is_empty() {
            return Err(MigrateError::Config("job key prefix must not be empty".into()));
        }
        match &self.placement {
            PlacementSpec::Direct(target) => {
                if self.sources.iter().any(|s| s == target) {
                    return Err(MigrateError::Config(format!(
                        "source and target are the same server: {}",
                        target
                    )));
                }
            }
            PlacementSpec::Sharded(nodes) => {
                if nodes.is_empty() {
                    return Err(MigrateError::Config("no target nodes given".into()));
                }
                // Placement is (crc32 % N) + 1, so the node numbers must be
                // exactly 1..=N.
                let n = nodes.len() as u32;
                for expected in 1..=n {
                    if !nodes.contains_key(&expected) {
                        return Err(MigrateError::Config(format!(
                            "target nodes must be numbered node_1..node_{}, missing node_{}",
                            n, expected
                        )));
                    }
                }
                // A source that reappears as a shard node would have its
                // data and job state destroyed by the one-time flush.
                for (number, addr) in nodes {
                    if self.sources.contains(addr) {
                        return Err(MigrateError::Config(format!(
                            "source and target node_{} are the same server: {}",
                            number, addr
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// The job anchor: first source, first database. The run lock and the
    /// first-run flag are stored there.
    pub fn anchor(&self) -> crate::endpoint::Endpoint {
        self.sources[0].endpoint(self.databases[0])
    }
}
