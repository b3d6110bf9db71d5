//! Shared types for the object router.
//!
//! Identifiers, the versioned cluster map, request/reply messages and the two
//! external collaborator traits (placement and transport) live here so the
//! engine, the simulator and the test harnesses share one vocabulary.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::operation::SubOp;

/// Request id. Assigned at submission, strictly increasing, never reused.
pub type Tid = u64;
/// Linger registration id (independent id space from `Tid`).
pub type LingerId = u64;
/// Storage node identifier.
pub type NodeId = u64;
/// Pool identifier.
pub type PoolId = u64;
/// Cluster map version.
pub type Epoch = u64;

/// Result code a storage node returns when a replica refuses a read that must
/// be served by the primary.
pub const RESULT_AGAIN: i32 = -11;

/// Placement unit inside a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub pool: PoolId,
    pub seed: u32,
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seed)
    }
}

/// Object name within a pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjectId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pool plus an optional placement key that replaces the object name when
/// hashing onto a shard (lets related objects share a shard).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocator {
    pub pool: PoolId,
    #[serde(default)]
    pub key: Option<String>,
}

impl ObjectLocator {
    pub fn new(pool: PoolId) -> Self {
        Self { pool, key: None }
    }

    pub fn with_key(pool: PoolId, key: impl Into<String>) -> Self {
        Self {
            pool,
            key: Some(key.into()),
        }
    }

    /// Key used for placement hashing.
    pub fn placement_key<'a>(&'a self, oid: &'a ObjectId) -> &'a str {
        self.key.as_deref().unwrap_or(oid.as_str())
    }

    /// Drop an explicit key that merely repeats the object name.
    pub(crate) fn normalized(mut self, oid: &ObjectId) -> Self {
        if self.key.as_deref() == Some(oid.as_str()) {
            self.key = None;
        }
        self
    }
}

/// Request flag bits. Callers combine the constants; the router adds the
/// global flags at submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpFlags(pub u32);

impl OpFlags {
    pub const READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    /// Allow the read to be served by any replica in the acting set.
    pub const BALANCE_READS: u32 = 1 << 2;
    /// Send writes even while the cluster is flagged full.
    pub const FULL_FORCE: u32 = 1 << 3;
    /// Skip the storage-side in-memory ack; only report durable commit.
    pub const ONDISK_ONLY: u32 = 1 << 4;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn insert(&mut self, bits: u32) {
        self.0 |= bits;
    }

    pub fn remove(&mut self, bits: u32) {
        self.0 &= !bits;
    }

    pub const fn is_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub const fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl std::ops::BitOr for OpFlags {
    type Output = OpFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        OpFlags(self.0 | rhs.0)
    }
}

/// Cluster-wide flags carried by the map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapFlags {
    #[serde(default)]
    pub full: bool,
    #[serde(default)]
    pub pause_read: bool,
    #[serde(default)]
    pub pause_write: bool,
}

/// Storage node entry in the cluster map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub addr: String,
    pub up: bool,
}

/// Pool descriptor. `shards` maps a shard seed to its ordered replica list
/// (primary first).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDesc {
    pub name: String,
    pub shard_count: u32,
    #[serde(default)]
    pub shards: BTreeMap<u32, Vec<NodeId>>,
    #[serde(default)]
    pub snaps: BTreeMap<u64, String>,
}

impl PoolDesc {
    /// Pool whose every shard maps onto the same acting set.
    pub fn uniform(name: impl Into<String>, shard_count: u32, acting: Vec<NodeId>) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count).map(|seed| (seed, acting.clone())).collect();
        Self {
            name: name.into(),
            shard_count,
            shards,
            snaps: BTreeMap::new(),
        }
    }
}

/// One version of the cluster map. Immutable once published; the router
/// swaps whole maps rather than editing one in place.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMap {
    pub epoch: Epoch,
    #[serde(default)]
    pub flags: MapFlags,
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, NodeInfo>,
    #[serde(default)]
    pub pools: BTreeMap<PoolId, PoolDesc>,
}

impl ClusterMap {
    /// Map used before the first real map arrives.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn decode(payload: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(payload).context("decode cluster map")
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).context("encode cluster map")
    }

    pub fn pool(&self, pool: PoolId) -> Option<&PoolDesc> {
        self.pools.get(&pool)
    }

    pub fn pool_by_name(&self, name: &str) -> Option<PoolId> {
        self.pools
            .iter()
            .find(|(_, desc)| desc.name == name)
            .map(|(id, _)| *id)
    }

    pub fn is_up(&self, node: NodeId) -> bool {
        self.nodes.get(&node).map(|n| n.up).unwrap_or(false)
    }

    pub fn node_addr(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(&node).map(|n| n.addr.as_str())
    }
}

/// Output of the placement resolver: a shard and its ordered acting set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub shard: ShardId,
    pub acting: Vec<NodeId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("pool {0} does not exist")]
pub struct PoolNotFound(pub PoolId);

/// Maps an object onto a shard and the nodes serving it.
///
/// The router treats this as an opaque, pure function of its inputs.
pub trait PlacementResolver: Send + Sync + 'static {
    fn resolve(
        &self,
        oid: &ObjectId,
        locator: &ObjectLocator,
        map: &ClusterMap,
    ) -> Result<Placement, PoolNotFound>;
}

/// Request addressed to one storage node.
#[derive(Clone, Debug, PartialEq)]
pub struct OpRequest {
    pub tid: Tid,
    pub attempt: u32,
    pub client_incarnation: u32,
    pub map_epoch: Epoch,
    pub oid: ObjectId,
    pub locator: ObjectLocator,
    pub shard: ShardId,
    pub flags: OpFlags,
    pub priority: i32,
    pub ops: Vec<SubOp>,
    pub indata: Bytes,
    pub linger_id: Option<LingerId>,
}

/// Per-sub-op result carried in a reply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SubOpOutput {
    pub rval: i32,
    #[serde(skip)]
    pub data: Bytes,
}

/// `ack`: applied in memory on the replicas; `ondisk`: durably committed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplyFlags {
    pub ack: bool,
    pub ondisk: bool,
}

impl ReplyFlags {
    pub const ACK: ReplyFlags = ReplyFlags {
        ack: true,
        ondisk: false,
    };
    pub const ONDISK: ReplyFlags = ReplyFlags {
        ack: false,
        ondisk: true,
    };
    pub const BOTH: ReplyFlags = ReplyFlags {
        ack: true,
        ondisk: true,
    };
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpReply {
    pub tid: Tid,
    pub attempt: u32,
    pub result: i32,
    pub flags: ReplyFlags,
    pub map_epoch: Epoch,
    pub version: u64,
    pub outputs: Vec<SubOpOutput>,
}

impl OpReply {
    /// Successful reply to `req` with empty sub-op outputs.
    pub fn ok(req: &OpRequest, flags: ReplyFlags) -> Self {
        Self {
            tid: req.tid,
            attempt: req.attempt,
            result: 0,
            flags,
            map_epoch: req.map_epoch,
            version: 0,
            outputs: vec![SubOpOutput::default(); req.ops.len()],
        }
    }

    /// Failed reply to `req`.
    pub fn error(req: &OpRequest, code: i32) -> Self {
        Self {
            result: code,
            outputs: Vec::new(),
            ..Self::ok(req, ReplyFlags::BOTH)
        }
    }
}

/// Pool management operation kinds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PoolOpKind {
    Create { name: String, crush_rule: u8 },
    Delete { pool: PoolId },
    Rename { pool: PoolId, name: String },
    CreateSnap { pool: PoolId, snap_name: String },
    DeleteSnap { pool: PoolId, snap_id: u64 },
}

/// Request addressed to the cluster leader rather than a storage node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminRequest {
    Pool { tid: Tid, op: PoolOpKind },
    PoolStats { tid: Tid, pools: Vec<String> },
    Statfs { tid: Tid },
}

impl AdminRequest {
    pub fn tid(&self) -> Tid {
        match self {
            AdminRequest::Pool { tid, .. }
            | AdminRequest::PoolStats { tid, .. }
            | AdminRequest::Statfs { tid } => *tid,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolOpReply {
    pub tid: Tid,
    pub result: i32,
    /// Map epoch in which the change becomes visible.
    pub epoch: Epoch,
    pub data: Bytes,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStat {
    pub num_objects: u64,
    pub num_bytes: u64,
    pub num_rd: u64,
    pub num_wr: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStatReply {
    pub tid: Tid,
    pub stats: BTreeMap<String, PoolStat>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatfs {
    pub kb: u64,
    pub kb_used: u64,
    pub kb_avail: u64,
    pub num_objects: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatfsReply {
    pub tid: Tid,
    pub stats: ClusterStatfs,
}

/// Outbound half of the network layer.
///
/// Every method returns promptly; replies and map updates come back through
/// the `Objecter` dispatch entry points. Implementations must not call back
/// into the router synchronously, since these methods run under its lock.
pub trait Transport: Send + Sync + 'static {
    /// Open (or re-open after a reset) the channel to a storage node.
    fn connect(&self, node: NodeId, addr: &str) -> anyhow::Result<()>;

    fn disconnect(&self, node: NodeId);

    fn send_op(&self, node: NodeId, req: OpRequest) -> anyhow::Result<()>;

    fn send_admin(&self, req: AdminRequest) -> anyhow::Result<()>;

    /// Subscribe to maps starting at `epoch`.
    fn request_map(&self, epoch: Epoch) -> anyhow::Result<()>;

    /// Ask the map authority for its newest epoch; the answer arrives through
    /// `Objecter::handle_map_version`. Answers must be delivered in the order
    /// the probes were sent.
    fn request_map_version(&self) -> anyhow::Result<()>;

    /// Liveness probe for a node with laggy requests.
    fn ping(&self, _node: NodeId) -> anyhow::Result<()> {
        Ok(())
    }
}
