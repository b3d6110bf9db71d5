//! Shared helpers for integration tests.
//!
//! `RecordingTransport` captures everything the router sends so a test can
//! play the cluster by hand: inspect requests, then feed back replies and
//! maps through the router's dispatch entry points.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use holo_objecter::objecter::{
    AdminRequest, ClusterMap, Completion, Epoch, MapFlags, NodeId, NodeInfo, Objecter,
    ObjecterConfig, ObjecterError, OpRequest, PoolDesc, PoolId, Tid, Transport,
};

/// Everything the router handed to the transport, in order.
#[derive(Clone, Debug, Default)]
pub struct Recorded {
    pub sent: Vec<(NodeId, OpRequest)>,
    pub admin: Vec<AdminRequest>,
    pub map_requests: Vec<Epoch>,
    pub version_probes: usize,
    pub connects: Vec<(NodeId, String)>,
    pub disconnects: Vec<NodeId>,
    pub pings: Vec<NodeId>,
}

#[derive(Default)]
pub struct RecordingTransport {
    inner: Mutex<Recorded>,
    fail_sends: Mutex<bool>,
}

impl RecordingTransport {
    pub fn snapshot(&self) -> Recorded {
        self.inner.lock().unwrap().clone()
    }

    /// Requests sent so far, draining the log.
    pub fn take_sent(&self) -> Vec<(NodeId, OpRequest)> {
        std::mem::take(&mut self.inner.lock().unwrap().sent)
    }

    pub fn sent(&self) -> Vec<(NodeId, OpRequest)> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Every attempt sent for `tid`, oldest first.
    pub fn attempts_for(&self, tid: Tid) -> Vec<(NodeId, OpRequest)> {
        self.sent()
            .into_iter()
            .filter(|(_, req)| req.tid == tid)
            .collect()
    }

    /// Latest attempt sent for `tid`.
    pub fn last_for(&self, tid: Tid) -> (NodeId, OpRequest) {
        self.attempts_for(tid)
            .pop()
            .unwrap_or_else(|| panic!("nothing sent for tid {tid}"))
    }

    pub fn admin(&self) -> Vec<AdminRequest> {
        self.inner.lock().unwrap().admin.clone()
    }

    pub fn map_requests(&self) -> Vec<Epoch> {
        self.inner.lock().unwrap().map_requests.clone()
    }

    pub fn version_probes(&self) -> usize {
        self.inner.lock().unwrap().version_probes
    }

    /// Make `send_op` fail until reset.
    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock().unwrap() = fail;
    }
}

impl Transport for RecordingTransport {
    fn connect(&self, node: NodeId, addr: &str) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .connects
            .push((node, addr.to_string()));
        Ok(())
    }

    fn disconnect(&self, node: NodeId) {
        self.inner.lock().unwrap().disconnects.push(node);
    }

    fn send_op(&self, node: NodeId, req: OpRequest) -> anyhow::Result<()> {
        if *self.fail_sends.lock().unwrap() {
            anyhow::bail!("link to node {node} is down");
        }
        self.inner.lock().unwrap().sent.push((node, req));
        Ok(())
    }

    fn send_admin(&self, req: AdminRequest) -> anyhow::Result<()> {
        self.inner.lock().unwrap().admin.push(req);
        Ok(())
    }

    fn request_map(&self, epoch: Epoch) -> anyhow::Result<()> {
        self.inner.lock().unwrap().map_requests.push(epoch);
        Ok(())
    }

    fn request_map_version(&self) -> anyhow::Result<()> {
        self.inner.lock().unwrap().version_probes += 1;
        Ok(())
    }

    fn ping(&self, node: NodeId) -> anyhow::Result<()> {
        self.inner.lock().unwrap().pings.push(node);
        Ok(())
    }
}

pub fn router(config: ObjecterConfig) -> (Arc<Objecter>, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let objecter = Arc::new(Objecter::new(config, transport.clone()));
    (objecter, transport)
}

/// Builder for small hand-written maps. Every pool has a single shard, so an
/// object's acting set is the pool's acting set.
#[derive(Clone, Debug)]
pub struct MapBuilder {
    map: ClusterMap,
}

impl MapBuilder {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            map: ClusterMap {
                epoch,
                ..ClusterMap::default()
            },
        }
    }

    /// Nodes `ids`, all up, at `10.0.0.<id>:6800`.
    pub fn nodes(mut self, ids: &[NodeId]) -> Self {
        for id in ids {
            self.map.nodes.insert(
                *id,
                NodeInfo {
                    addr: addr(*id),
                    up: true,
                },
            );
        }
        self
    }

    pub fn down(mut self, id: NodeId) -> Self {
        if let Some(info) = self.map.nodes.get_mut(&id) {
            info.up = false;
        }
        self
    }

    pub fn moved(mut self, id: NodeId, new_addr: &str) -> Self {
        if let Some(info) = self.map.nodes.get_mut(&id) {
            info.addr = new_addr.to_string();
        }
        self
    }

    pub fn pool(mut self, id: PoolId, name: &str, acting: &[NodeId]) -> Self {
        self.map
            .pools
            .insert(id, PoolDesc::uniform(name, 1, acting.to_vec()));
        self
    }

    pub fn flags(mut self, flags: MapFlags) -> Self {
        self.map.flags = flags;
        self
    }

    pub fn build(self) -> ClusterMap {
        self.map
    }

    /// Same map published under another epoch.
    pub fn build_at(mut self, epoch: Epoch) -> ClusterMap {
        self.map.epoch = epoch;
        self.map
    }
}

pub fn addr(id: NodeId) -> String {
    format!("10.0.0.{id}:6800")
}

/// Completion that appends every result it receives to a shared log.
pub fn recorder<T: Send + 'static>() -> (Completion<T>, Arc<Mutex<Vec<Result<T, ObjecterError>>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let completion = Completion::callback(move |result| sink.lock().unwrap().push(result));
    (completion, log)
}

/// Count of results per error kind ("ok" for successes).
pub fn outcome_kinds<T>(log: &Mutex<Vec<Result<T, ObjecterError>>>) -> BTreeMap<&'static str, usize> {
    let mut kinds = BTreeMap::new();
    for result in log.lock().unwrap().iter() {
        let kind = match result {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        *kinds.entry(kind).or_default() += 1;
    }
    kinds
}
