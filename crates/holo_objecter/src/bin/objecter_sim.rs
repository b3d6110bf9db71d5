//! In-process cluster simulator for the object router.
//!
//! A simulated cluster answers object and admin requests from memory while a
//! churn task publishes new maps (nodes going down and up, primaries moving)
//! and resets sessions. Several clients drive a read/write workload through
//! one `Objecter`; at the end the router counters and any leftover requests
//! are printed as JSON.

use std::collections::{BTreeMap, HashMap};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use holo_objecter::objecter::{
    AdminRequest, ClusterMap, ClusterStatfs, Completion, Epoch, NodeId, NodeInfo, ObjectLocator,
    ObjectOperation, Objecter, ObjecterConfig, OpCode, OpReply, OpRequest, OpSpec, PoolDesc,
    PoolId, PoolOpKind, PoolOpReply, PoolStat, PoolStatReply, ReplyFlags, StatfsReply,
    SubOpOutput, Transport,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, Mutex};
use tokio::time;

/// CLI options for one simulation run.
#[derive(Parser, Debug)]
#[command(name = "objecter-sim")]
struct Args {
    /// Storage nodes in the simulated cluster.
    #[arg(long, env = "HOLO_OBJECTER_NODES", default_value_t = 5)]
    nodes: u64,

    /// Replicas per shard (primary included).
    #[arg(long, env = "HOLO_OBJECTER_REPLICAS", default_value_t = 3)]
    replicas: usize,

    /// Shards in the data pool.
    #[arg(long, env = "HOLO_OBJECTER_SHARDS", default_value_t = 16)]
    shards: u32,

    /// Concurrent workload clients.
    #[arg(long, env = "HOLO_OBJECTER_CLIENTS", default_value_t = 8)]
    clients: usize,

    /// Requests each client keeps in flight.
    #[arg(long, env = "HOLO_OBJECTER_WINDOW", default_value_t = 4)]
    window: usize,

    /// Distinct object names.
    #[arg(long, default_value_t = 256)]
    objects: usize,

    /// Percentage of requests that are writes.
    #[arg(long, default_value_t = 50)]
    write_pct: u8,

    /// Payload size for writes.
    #[arg(long, default_value_t = 4096)]
    write_size: usize,

    #[arg(long, env = "HOLO_OBJECTER_DURATION", default_value = "10s")]
    duration: humantime::Duration,

    /// How often the cluster publishes a new map.
    #[arg(long, env = "HOLO_OBJECTER_CHURN_INTERVAL", default_value = "500ms")]
    churn_interval: humantime::Duration,

    /// Chance (percent) that a churn step also resets a session.
    #[arg(long, default_value_t = 20)]
    reset_pct: u8,

    /// Per-request deadline on the client side.
    #[arg(long, default_value = "30s")]
    op_timeout: humantime::Duration,

    /// Seed for workload and churn randomness (0 picks one).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// JSON router config; defaults are used when absent.
    #[arg(long, env = "HOLO_OBJECTER_CONFIG")]
    config: Option<PathBuf>,
}

const DATA_POOL: PoolId = 1;

/// Traffic from the router to the simulated cluster.
#[derive(Debug)]
enum Outbound {
    Op { node: NodeId, req: OpRequest },
    Admin(AdminRequest),
    MapRequest(Epoch),
    MapVersion,
}

/// `Transport` that hands every message to the responder task.
struct SimTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SimTransport {
    fn push(&self, msg: Outbound) -> anyhow::Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| anyhow::anyhow!("simulated cluster has stopped"))
    }
}

impl Transport for SimTransport {
    fn connect(&self, node: NodeId, addr: &str) -> anyhow::Result<()> {
        tracing::trace!(node, addr, "sim connect");
        Ok(())
    }

    fn disconnect(&self, node: NodeId) {
        tracing::trace!(node, "sim disconnect");
    }

    fn send_op(&self, node: NodeId, req: OpRequest) -> anyhow::Result<()> {
        self.push(Outbound::Op { node, req })
    }

    fn send_admin(&self, req: AdminRequest) -> anyhow::Result<()> {
        self.push(Outbound::Admin(req))
    }

    fn request_map(&self, epoch: Epoch) -> anyhow::Result<()> {
        self.push(Outbound::MapRequest(epoch))
    }

    fn request_map_version(&self) -> anyhow::Result<()> {
        self.push(Outbound::MapVersion)
    }
}

/// Authoritative cluster state: the map history head plus object contents.
struct SimCluster {
    map: ClusterMap,
    replicas: usize,
    rotation: usize,
    objects: HashMap<(PoolId, String), Bytes>,
    next_pool: PoolId,
}

impl SimCluster {
    fn new(nodes: u64, replicas: usize, shards: u32) -> Self {
        let mut map = ClusterMap {
            epoch: 1,
            ..ClusterMap::default()
        };
        for node in 1..=nodes {
            map.nodes.insert(
                node,
                NodeInfo {
                    addr: format!("127.0.0.1:{}", 6800 + node),
                    up: true,
                },
            );
        }
        map.pools
            .insert(DATA_POOL, PoolDesc::uniform("data", shards, Vec::new()));
        let mut cluster = Self {
            map,
            replicas,
            rotation: 0,
            objects: HashMap::new(),
            next_pool: DATA_POOL + 1,
        };
        cluster.remap();
        cluster
    }

    /// Rebuild every shard's acting set from the nodes currently up.
    fn remap(&mut self) {
        let up: Vec<NodeId> = self
            .map
            .nodes
            .iter()
            .filter(|(_, info)| info.up)
            .map(|(id, _)| *id)
            .collect();
        let width = self.replicas.min(up.len());
        for pool in self.map.pools.values_mut() {
            for seed in 0..pool.shard_count {
                let acting = if up.is_empty() {
                    Vec::new()
                } else {
                    let start = (seed as usize + self.rotation) % up.len();
                    (0..width).map(|i| up[(start + i) % up.len()]).collect()
                };
                pool.shards.insert(seed, acting);
            }
        }
    }

    /// Publish the next epoch after a random topology change.
    fn churn(&mut self, rng: &mut SmallRng) -> ClusterMap {
        let down: Vec<NodeId> = self
            .map
            .nodes
            .iter()
            .filter(|(_, info)| !info.up)
            .map(|(id, _)| *id)
            .collect();
        match rng.gen_range(0..3) {
            0 if !down.is_empty() => {
                let node = down[rng.gen_range(0..down.len())];
                if let Some(info) = self.map.nodes.get_mut(&node) {
                    info.up = true;
                }
                tracing::info!(node, "sim: node up");
            }
            1 if down.is_empty() && self.map.nodes.len() > 1 => {
                let node = rng.gen_range(1..=self.map.nodes.len() as u64);
                if let Some(info) = self.map.nodes.get_mut(&node) {
                    info.up = false;
                }
                tracing::info!(node, "sim: node down");
            }
            _ => {
                self.rotation += 1;
                tracing::info!(rotation = self.rotation, "sim: primaries moved");
            }
        }
        self.bump()
    }

    fn bump(&mut self) -> ClusterMap {
        self.remap();
        self.map.epoch += 1;
        self.map.clone()
    }

    fn serves(&self, node: NodeId, req: &OpRequest) -> bool {
        self.map.is_up(node)
            && self
                .map
                .pool(req.shard.pool)
                .and_then(|pool| pool.shards.get(&req.shard.seed))
                .is_some_and(|acting| acting.contains(&node))
    }

    fn execute(&mut self, req: &OpRequest) -> OpReply {
        let key = (req.locator.pool, req.oid.0.clone());
        let mut outputs = Vec::with_capacity(req.ops.len());
        let mut result = 0;
        for op in &req.ops {
            let out = match op.code {
                OpCode::Write | OpCode::WriteFull | OpCode::Append => {
                    self.objects.insert(key.clone(), op.indata.clone());
                    SubOpOutput::default()
                }
                OpCode::Delete => {
                    self.objects.remove(&key);
                    SubOpOutput::default()
                }
                OpCode::Read | OpCode::SparseRead => match self.objects.get(&key) {
                    Some(data) => SubOpOutput {
                        rval: 0,
                        data: data.clone(),
                    },
                    None => {
                        result = -2;
                        SubOpOutput {
                            rval: -2,
                            data: Bytes::new(),
                        }
                    }
                },
                _ => SubOpOutput::default(),
            };
            outputs.push(out);
        }
        let mut reply = OpReply::ok(req, ReplyFlags::BOTH);
        reply.map_epoch = self.map.epoch;
        reply.result = result;
        reply.outputs = outputs;
        reply
    }

    fn pool_op(&mut self, op: &PoolOpKind) -> i32 {
        match op {
            PoolOpKind::Create { name, .. } => {
                if self.map.pool_by_name(name).is_some() {
                    return -17;
                }
                let id = self.next_pool;
                self.next_pool += 1;
                self.map.pools.insert(id, PoolDesc::uniform(name.clone(), 4, Vec::new()));
            }
            PoolOpKind::Delete { pool } => {
                if self.map.pools.remove(pool).is_none() {
                    return -2;
                }
            }
            PoolOpKind::Rename { pool, name } => match self.map.pools.get_mut(pool) {
                Some(desc) => desc.name = name.clone(),
                None => return -2,
            },
            PoolOpKind::CreateSnap { pool, snap_name } => match self.map.pools.get_mut(pool) {
                Some(desc) => {
                    let id = desc.snaps.keys().next_back().map_or(1, |last| last + 1);
                    desc.snaps.insert(id, snap_name.clone());
                }
                None => return -2,
            },
            PoolOpKind::DeleteSnap { pool, snap_id } => match self.map.pools.get_mut(pool) {
                Some(desc) => {
                    desc.snaps.remove(snap_id);
                }
                None => return -2,
            },
        }
        0
    }

    fn pool_stats(&self, names: &[String]) -> BTreeMap<String, PoolStat> {
        let mut stats = BTreeMap::new();
        for (id, desc) in &self.map.pools {
            if !names.is_empty() && !names.contains(&desc.name) {
                continue;
            }
            let mut stat = PoolStat::default();
            for ((pool, _), data) in &self.objects {
                if pool == id {
                    stat.num_objects += 1;
                    stat.num_bytes += data.len() as u64;
                }
            }
            stats.insert(desc.name.clone(), stat);
        }
        stats
    }

    fn statfs(&self) -> ClusterStatfs {
        let used: u64 = self.objects.values().map(|d| d.len() as u64).sum::<u64>() / 1024;
        let kb = 1 << 30;
        ClusterStatfs {
            kb,
            kb_used: used,
            kb_avail: kb - used,
            num_objects: self.objects.len() as u64,
        }
    }
}

async fn publish(objecter: &Objecter, map: &ClusterMap) -> anyhow::Result<()> {
    let payload = map.encode()?;
    objecter
        .handle_map(map.epoch, &payload)
        .await
        .with_context(|| format!("apply map epoch {}", map.epoch))?;
    Ok(())
}

/// Answer router traffic from the simulated cluster until the channel closes.
async fn run_responder(
    objecter: Arc<Objecter>,
    cluster: Arc<Mutex<SimCluster>>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> anyhow::Result<()> {
    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Op { node, req } => {
                let reply = {
                    let mut cluster = cluster.lock().await;
                    if !cluster.serves(node, &req) {
                        tracing::debug!(tid = req.tid, node, "sim: dropping request to non-member");
                        continue;
                    }
                    cluster.execute(&req)
                };
                objecter.handle_reply(reply).await;
            }
            Outbound::Admin(AdminRequest::Pool { tid, op }) => {
                let (result, map) = {
                    let mut cluster = cluster.lock().await;
                    let result = cluster.pool_op(&op);
                    let map = (result == 0).then(|| cluster.bump());
                    (result, map)
                };
                let epoch = map.as_ref().map_or(0, |m| m.epoch);
                objecter
                    .handle_pool_op_reply(PoolOpReply {
                        tid,
                        result,
                        epoch,
                        data: Bytes::new(),
                    })
                    .await;
                if let Some(map) = map {
                    publish(&objecter, &map).await?;
                }
            }
            Outbound::Admin(AdminRequest::PoolStats { tid, pools }) => {
                let stats = cluster.lock().await.pool_stats(&pools);
                objecter
                    .handle_pool_stat_reply(PoolStatReply { tid, stats })
                    .await;
            }
            Outbound::Admin(AdminRequest::Statfs { tid }) => {
                let stats = cluster.lock().await.statfs();
                objecter.handle_statfs_reply(StatfsReply { tid, stats }).await;
            }
            Outbound::MapRequest(epoch) => {
                let map = cluster.lock().await.map.clone();
                if map.epoch >= epoch {
                    publish(&objecter, &map).await?;
                }
            }
            Outbound::MapVersion => {
                let epoch = cluster.lock().await.map.epoch;
                objecter.handle_map_version(epoch).await;
            }
        }
    }
    Ok(())
}

/// Publish maps and reset sessions until `deadline`.
async fn run_churn(
    objecter: Arc<Objecter>,
    cluster: Arc<Mutex<SimCluster>>,
    interval: Duration,
    reset_pct: u8,
    seed: u64,
    deadline: time::Instant,
) -> anyhow::Result<u64> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut ticker = time::interval(interval);
    ticker.tick().await;
    let mut published = 0u64;
    while time::Instant::now() < deadline {
        ticker.tick().await;
        let map = cluster.lock().await.churn(&mut rng);
        publish(&objecter, &map).await?;
        published += 1;
        if rng.gen_range(0..100) < u32::from(reset_pct) {
            let node = rng.gen_range(1..=map.nodes.len() as u64);
            tracing::info!(node, "sim: session reset");
            objecter.handle_session_reset(node).await;
        }
    }
    // Leave the cluster healthy so stragglers can finish.
    let map = {
        let mut cluster = cluster.lock().await;
        for info in cluster.map.nodes.values_mut() {
            info.up = true;
        }
        cluster.bump()
    };
    publish(&objecter, &map).await?;
    Ok(published + 1)
}

#[derive(Debug, Default, serde::Serialize)]
struct ClientReport {
    reads: u64,
    writes: u64,
    not_found: u64,
    errors: BTreeMap<String, u64>,
    timeouts: u64,
}

#[allow(clippy::too_many_arguments)]
async fn run_client(
    objecter: Arc<Objecter>,
    client_id: usize,
    objects: usize,
    write_pct: u8,
    write_size: usize,
    window: usize,
    op_timeout: Duration,
    seed: u64,
    deadline: time::Instant,
) -> ClientReport {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut report = ClientReport::default();
    let mut inflight = FuturesUnordered::new();
    let payload = Bytes::from(vec![client_id as u8; write_size]);

    loop {
        while inflight.len() < window.max(1) && time::Instant::now() < deadline {
            let name = format!("obj_{}", rng.gen_range(0..objects.max(1)));
            let is_write = rng.gen_range(0..100) < u32::from(write_pct);
            let mut operation = ObjectOperation::new();
            let spec = if is_write {
                operation.write_full(payload.clone());
                OpSpec::mutate(name, ObjectLocator::new(DATA_POOL), operation)
            } else {
                operation.read(0, write_size as u64);
                OpSpec::read(name, ObjectLocator::new(DATA_POOL), operation)
            };
            let objecter = objecter.clone();
            inflight.push(async move {
                let result = time::timeout(op_timeout, objecter.operate(spec)).await;
                (is_write, result)
            });
        }
        let Some((is_write, result)) = inflight.next().await else {
            break;
        };
        match result {
            Ok(Ok(outcome)) => {
                if is_write {
                    report.writes += 1;
                } else {
                    report.reads += 1;
                    if outcome.result < 0 {
                        report.not_found += 1;
                    }
                }
            }
            Ok(Err(err)) => {
                *report.errors.entry(err.kind().to_string()).or_default() += 1;
            }
            Err(_) => report.timeouts += 1,
        }
    }
    report
}

/// Create a scratch pool, write into it, delete it, and check that a request
/// aimed at the deleted pool fails instead of hanging.
async fn exercise_pool_lifecycle(
    objecter: &Objecter,
    timeout: Duration,
) -> anyhow::Result<serde_json::Value> {
    let (created, rx) = Completion::channel();
    objecter.create_pool("scratch", 0, created).await?;
    time::timeout(timeout, rx)
        .await
        .context("create pool timed out")?
        .context("create pool dropped")??;
    let pool = objecter
        .current_map()
        .await
        .pool_by_name("scratch")
        .context("scratch pool missing from map")?;

    let mut write = ObjectOperation::new();
    write.write_full(Bytes::from_static(b"scratch"));
    let spec = OpSpec::mutate("scratch_obj", ObjectLocator::new(pool), write);
    let write_result = time::timeout(timeout, objecter.operate(spec))
        .await
        .context("scratch write timed out")?;

    let (deleted, rx) = Completion::channel();
    objecter.delete_pool(pool, deleted).await?;
    time::timeout(timeout, rx)
        .await
        .context("delete pool timed out")?
        .context("delete pool dropped")??;

    let mut read = ObjectOperation::new();
    read.read(0, 7);
    let spec = OpSpec::read("scratch_obj", ObjectLocator::new(pool), read);
    let orphan_result = time::timeout(timeout, objecter.operate(spec))
        .await
        .context("read of deleted pool timed out")?;
    tracing::info!(pool, orphan = ?orphan_result, "pool lifecycle checked");

    Ok(serde_json::json!({
        "pool": pool,
        "write": write_result.map(|o| o.result).map_err(|e| e.kind()),
        "read_after_delete": orphan_result.map(|o| o.result).map_err(|e| e.kind()),
    }))
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the simulation.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.nodes > 0, "--nodes must be > 0");
    anyhow::ensure!(args.replicas > 0, "--replicas must be > 0");
    anyhow::ensure!(args.write_pct <= 100, "--write-pct must be <= 100");
    anyhow::ensure!(args.reset_pct <= 100, "--reset-pct must be <= 100");

    let config = match &args.config {
        Some(path) => ObjecterConfig::load(path)?,
        None => ObjecterConfig::default(),
    };
    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    tracing::info!(seed, nodes = args.nodes, clients = args.clients, "starting simulation");

    let (tx, rx) = mpsc::unbounded_channel();
    let objecter = Arc::new(Objecter::new(config, Arc::new(SimTransport { tx })));
    let cluster = Arc::new(Mutex::new(SimCluster::new(
        args.nodes,
        args.replicas,
        args.shards,
    )));
    let responder = tokio::spawn(run_responder(objecter.clone(), cluster.clone(), rx));
    let ticker = objecter.spawn_ticker();

    let initial = cluster.lock().await.map.clone();
    publish(&objecter, &initial).await?;

    let start = time::Instant::now();
    let duration: Duration = args.duration.into();
    let deadline = start + duration;
    let churn = tokio::spawn(run_churn(
        objecter.clone(),
        cluster.clone(),
        args.churn_interval.into(),
        args.reset_pct,
        seed ^ 0x5eed,
        deadline,
    ));

    let op_timeout: Duration = args.op_timeout.into();
    let mut clients = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        // Mix the base seed with the client id for deterministic per-client RNG.
        let seed = seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        clients.push(tokio::spawn(run_client(
            objecter.clone(),
            client_id,
            args.objects,
            args.write_pct,
            args.write_size,
            args.window,
            op_timeout,
            seed,
            deadline,
        )));
    }

    let mut total = ClientReport::default();
    for client in clients {
        let report = client.await.context("client task panicked")?;
        total.reads += report.reads;
        total.writes += report.writes;
        total.not_found += report.not_found;
        total.timeouts += report.timeouts;
        for (kind, count) in report.errors {
            *total.errors.entry(kind).or_default() += count;
        }
    }
    let maps_published = churn.await.context("churn task panicked")??;
    let pool_lifecycle = exercise_pool_lifecycle(&objecter, op_timeout).await?;

    let (stat_tx, stat_rx) = Completion::channel();
    objecter.get_pool_stats(Vec::new(), stat_tx).await?;
    let pool_stats = time::timeout(Duration::from_secs(5), stat_rx)
        .await
        .ok()
        .and_then(|r| r.ok())
        .and_then(|r| r.ok());

    let stats = objecter.stats().await;
    let leftovers = objecter.dump_requests().await;
    objecter.shutdown().await;
    ticker.abort();
    drop(objecter);
    responder.abort();

    let summary = serde_json::json!({
        "seed": seed,
        "elapsed_ms": start.elapsed().as_millis() as u64,
        "maps_published": maps_published,
        "clients": total,
        "router": stats,
        "pool_stats": pool_stats,
        "pool_lifecycle": pool_lifecycle,
        "outstanding": leftovers,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
