use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{GateError, Result};

/// Virtual nodes placed on the ring per shard. More points smooth out the
/// key distribution across shards.
const DEFAULT_VIRTUAL_NODES: usize = 160;

/// Consistent-hash ring mapping store keys to shard indices.
///
/// All operations for one key always target the same shard, which is what
/// preserves single-key atomicity at the store. The ring is immutable after
/// construction; topology changes build a new ring, and routing is
/// recomputed per operation from whatever ring is current.
#[derive(Debug, Clone)]
pub struct HashRing {
    points: BTreeMap<u64, usize>,
    shard_count: usize,
}

impl HashRing {
    pub fn new(shard_count: usize) -> Result<Self> {
        Self::with_virtual_nodes(shard_count, DEFAULT_VIRTUAL_NODES)
    }

    pub fn with_virtual_nodes(shard_count: usize, virtual_nodes: usize) -> Result<Self> {
        if shard_count == 0 {
            return Err(GateError::Config(
                "hash ring requires at least one shard".to_string(),
            ));
        }
        if virtual_nodes == 0 {
            return Err(GateError::Config(
                "hash ring requires at least one virtual node per shard".to_string(),
            ));
        }

        let mut points = BTreeMap::new();
        for shard in 0..shard_count {
            for vnode in 0..virtual_nodes {
                let point = hash_point(format!("shard-{}-vnode-{}", shard, vnode).as_bytes());
                points.insert(point, shard);
            }
        }

        Ok(Self {
            points,
            shard_count,
        })
    }

    /// Route a store key to its shard index.
    pub fn route(&self, key: &str) -> usize {
        let point = hash_point(key.as_bytes());
        match self.points.range(point..).next() {
            Some((_, &shard)) => shard,
            // Wrap around the ring.
            None => *self
                .points
                .values()
                .next()
                .expect("ring is never empty after construction"),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }
}

/// Stable ring position for a byte string.
///
/// SHA-256 keeps routing identical across gateway instances and process
/// restarts, which std's default hasher does not guarantee.
fn hash_point(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    u64::from_be_bytes(digest[..8].try_into().expect("digest is at least 8 bytes"))
}
