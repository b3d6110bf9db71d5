//! Placement resolution and target recalculation.
//!
//! `MapPlacement` is the resolver used when the caller does not supply one:
//! it hashes the placement key onto a shard and reads the shard's replica list
//! straight out of the map. `recalc_target` is what the submission path and
//! the map reactor run for every op and linger.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::types::{
    ClusterMap, NodeId, ObjectId, ObjectLocator, Placement, PlacementResolver, PoolNotFound,
    ShardId,
};

fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Resolver that reads placement directly from the pool descriptors.
#[derive(Clone, Copy, Debug, Default)]
pub struct MapPlacement;

impl PlacementResolver for MapPlacement {
    fn resolve(
        &self,
        oid: &ObjectId,
        locator: &ObjectLocator,
        map: &ClusterMap,
    ) -> Result<Placement, PoolNotFound> {
        let pool = map.pool(locator.pool).ok_or(PoolNotFound(locator.pool))?;
        let shard_count = u64::from(pool.shard_count.max(1));
        let seed = (hash_key(locator.placement_key(oid).as_bytes()) % shard_count) as u32;
        let acting = pool.shards.get(&seed).cloned().unwrap_or_default();
        Ok(Placement {
            shard: ShardId {
                pool: locator.pool,
                seed,
            },
            acting,
        })
    }
}

/// Where an op or linger is currently addressed.
#[derive(Clone, Debug)]
pub(super) struct OpTarget {
    pub(super) oid: ObjectId,
    pub(super) locator: ObjectLocator,
    pub(super) shard: Option<ShardId>,
    /// Ordered replica list; position 0 is the primary.
    pub(super) acting: Vec<NodeId>,
    /// Node the next attempt goes to. `None` means homeless.
    pub(super) node: Option<NodeId>,
    /// Reads may be served by any up replica.
    pub(super) balance_reads: bool,
    pub(super) used_replica: bool,
    /// Set once any map has resolved the pool for this target.
    pub(super) pool_seen: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum RecalcResult {
    NoAction,
    NeedResend,
    PoolDne,
}

impl OpTarget {
    pub(super) fn new(oid: ObjectId, locator: ObjectLocator, balance_reads: bool) -> Self {
        Self {
            oid,
            locator,
            shard: None,
            acting: Vec::new(),
            node: None,
            balance_reads,
            used_replica: false,
            pool_seen: false,
        }
    }

    /// Forget the resolved node so the next recalculation reports a change.
    pub(super) fn make_homeless(&mut self) {
        self.node = None;
        self.used_replica = false;
    }
}

/// Primary if it is up; with `balance_reads` any up replica, spread by tid.
fn pick_node(acting: &[NodeId], map: &ClusterMap, balance_reads: bool, tid: u64) -> Option<NodeId> {
    if balance_reads {
        let up: Vec<NodeId> = acting.iter().copied().filter(|n| map.is_up(*n)).collect();
        if up.is_empty() {
            return None;
        }
        return Some(up[(tid % up.len() as u64) as usize]);
    }
    acting.first().copied().filter(|n| map.is_up(*n))
}

/// Recompute `target` against `map`. The target is updated in place whenever
/// the shard, the ordered acting list or the chosen node differ.
pub(super) fn recalc_target(
    target: &mut OpTarget,
    map: &ClusterMap,
    resolver: &dyn PlacementResolver,
    tid: u64,
) -> RecalcResult {
    let placement = match resolver.resolve(&target.oid, &target.locator, map) {
        Ok(placement) => placement,
        Err(_) => return RecalcResult::PoolDne,
    };
    target.pool_seen = true;

    let node = pick_node(&placement.acting, map, target.balance_reads, tid);
    let changed = target.shard != Some(placement.shard)
        || target.acting != placement.acting
        || target.node != node;
    if !changed {
        return RecalcResult::NoAction;
    }

    target.used_replica = node.is_some() && node != placement.acting.first().copied();
    target.shard = Some(placement.shard);
    target.acting = placement.acting;
    target.node = node;
    RecalcResult::NeedResend
}
