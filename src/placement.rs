//! Key placement.
//!
//! Decides which target address a key is written to. The direct policy is an
//! identity mapping; the sharded policy routes by CRC-32 of the raw key
//! bytes, `(crc32(key) mod N) + 1`, over nodes numbered `1..=N`. The sharded
//! mapping is deterministic and stateless but NOT resize-safe: changing N
//! between runs of the same job reassigns keys inconsistently with prior
//! runs. N is a hard precondition fixed for the job's lifetime.

use std::collections::BTreeMap;

use crate::config::PlacementSpec;
use crate::endpoint::Address;

/// Maps a key to exactly one target address.
#[derive(Debug, Clone)]
pub enum PlacementResolver {
    /// Every key goes to the single configured target.
    Direct(Address),
    /// Keys hash over nodes numbered `1..=N`.
    Sharded {
        /// Node number → address; validated contiguous at config time.
        nodes: BTreeMap<u32, Address>,
    },
}

impl PlacementResolver {
    /// Build a resolver from a validated placement spec.
    pub fn from_spec(spec: &PlacementSpec) -> Self {
        match spec {
            PlacementSpec::Direct(addr) => PlacementResolver::Direct(addr.clone()),
            PlacementSpec::Sharded(nodes) => PlacementResolver::Sharded {
                nodes: nodes.clone(),
            },
        }
    }

    /// The 1-based node number a key hashes to, for N nodes.
    pub fn shard_node(key: &[u8], node_count: u32) -> u32 {
        (crc32fast::hash(key) % node_count) + 1
    }

    /// Resolve the target address for a key. Pure: the same key always maps
    /// to the same address for a fixed node set.
    pub fn resolve(&self, key: &[u8]) -> &Address {
        match self {
            PlacementResolver::Direct(addr) => addr,
            PlacementResolver::Sharded { nodes } => {
                let node = Self::shard_node(key, nodes.len() as u32);
                // Contiguity of 1..=N is enforced by JobConfig::validate.
                nodes
                    .get(&node)
                    .unwrap_or_else(|| unreachable!("node {} missing from validated shard map", node))
            }
        }
    }
}
