//! The object router: submission, dispatch and map reaction.
//!
//! All tables live in one `State` behind one `tokio::sync::Mutex`. Every entry
//! point locks it, mutates, collects caller continuations into
//! `State::deferred`, and runs them only after the guard is dropped. The only
//! path that waits while holding a request is budget admission in `submit`,
//! which releases the lock while it is parked on `budget_notify`.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::completion::{recv_completion, run_deferred, Completion, OpOutcome, OpResult};
use super::config::ObjecterConfig;
use super::error::ObjecterError;
use super::linger::LingerInfo;
use super::operation::{budget_cost, combined_indata, OpSpec};
use super::placement::{recalc_target, MapPlacement, OpTarget, RecalcResult};
use super::state::{Continuation, Op, Parked, ResendReason, State};
use super::throttle::AdmissionMode;
use super::types::{
    ClusterMap, Epoch, LingerId, MapFlags, NodeId, ObjectId, OpFlags, OpReply, OpRequest,
    PlacementResolver, PoolId, ShardId, SubOpOutput, Tid, Transport, RESULT_AGAIN,
};

/// Snapshot of one outstanding op.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OpInfo {
    pub tid: Tid,
    pub oid: ObjectId,
    pub pool: PoolId,
    pub shard: Option<ShardId>,
    pub acting: Vec<NodeId>,
    /// Session the op is attached to; `None` while homeless.
    pub node: Option<NodeId>,
    pub attempts: u32,
    pub paused: bool,
    pub budgeted: bool,
    pub map_epoch: Epoch,
    pub linger_id: Option<LingerId>,
}

impl OpInfo {
    fn from_op(op: &Op) -> Self {
        Self {
            tid: op.tid,
            oid: op.target.oid.clone(),
            pool: op.target.locator.pool,
            shard: op.target.shard,
            acting: op.target.acting.clone(),
            node: op.session,
            attempts: op.attempts,
            paused: op.paused,
            budgeted: op.budgeted,
            map_epoch: op.map_epoch,
            linger_id: op.linger_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub node: NodeId,
    pub addr: String,
    pub incarnation: u32,
    pub last_sent_epoch: Epoch,
    pub ops: Vec<Tid>,
    pub lingers: Vec<LingerId>,
}

/// Counters exposed for monitoring and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ObjecterStats {
    pub epoch: Epoch,
    pub ops: usize,
    pub homeless_ops: usize,
    pub paused_ops: usize,
    pub unacked_ops: usize,
    pub uncommitted_ops: usize,
    pub parked_ops: usize,
    pub lingers: usize,
    pub registered_lingers: usize,
    /// Lingers with a registration request in flight.
    pub registering_lingers: usize,
    pub sessions: usize,
    pub pool_ops: usize,
    pub pool_stat_ops: usize,
    pub statfs_ops: usize,
    pub map_waiters: usize,
    pub inflight_bytes: u64,
    pub inflight_ops: u64,
    pub resends_map_change: u64,
    pub resends_session_reset: u64,
    pub resends_replica_retry: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Re-registrations of an already registered linger that failed.
    pub linger_reregister_failures: u64,
}

/// What one maintenance pass found and did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub laggy_ops: Vec<Tid>,
    pub pinged: Vec<NodeId>,
    pub map_timeouts: Vec<Tid>,
    pub admin_timeouts: Vec<Tid>,
    pub homeless_ops: usize,
}

/// Client-side request router for one cluster.
pub struct Objecter {
    config: ObjecterConfig,
    placement: Arc<dyn PlacementResolver>,
    pub(super) transport: Arc<dyn Transport>,
    state: Mutex<State>,
    budget_notify: Notify,
}

impl Objecter {
    pub fn new(config: ObjecterConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_placement(config, transport, Arc::new(MapPlacement))
    }

    pub fn with_placement(
        config: ObjecterConfig,
        transport: Arc<dyn Transport>,
        placement: Arc<dyn PlacementResolver>,
    ) -> Self {
        let state = State::new(
            config.max_inflight_bytes,
            config.max_inflight_ops,
            config.client_incarnation,
        );
        Self {
            config,
            placement,
            transport,
            state: Mutex::new(state),
            budget_notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &ObjecterConfig {
        &self.config
    }

    /// Run `f` under the router lock, then run the continuations it queued.
    pub(super) async fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let (result, deferred) = {
            let mut state = self.state.lock().await;
            let result = f(&mut *state);
            (result, std::mem::take(&mut state.deferred))
        };
        run_deferred(deferred);
        result
    }

    pub(super) fn placement(&self) -> &dyn PlacementResolver {
        self.placement.as_ref()
    }

    /// Submit an object request and return its tid.
    ///
    /// Waits for budget headroom unless the request (or the config) selects
    /// `AdmissionMode::Reject`. Errors returned here mean the request was
    /// never admitted; its continuations are dropped unused.
    pub async fn submit(&self, spec: OpSpec) -> Result<Tid, ObjecterError> {
        let is_write = spec.is_write();
        let OpSpec {
            oid,
            locator,
            operation,
            mut flags,
            priority,
            should_resend,
            on_ack,
            on_commit,
            admission,
            map_timeout,
        } = spec;
        let mode = admission.unwrap_or(self.config.admission);
        let (ops, out_handlers) = operation.into_parts();
        let cost = budget_cost(&ops);

        let mut state = loop {
            let notified = self.budget_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut state = self.state.lock().await;
            if state.shutdown {
                return Err(ObjecterError::Shutdown);
            }
            if state.budget.try_take(cost) {
                break state;
            }
            let (used_bytes, used_ops) = state.budget.in_use();
            if mode == AdmissionMode::Reject {
                return Err(ObjecterError::BudgetExceeded {
                    bytes: used_bytes,
                    ops: used_ops,
                });
            }
            tracing::debug!(cost, used_bytes, used_ops, "waiting for inflight budget");
            drop(state);
            notified.await;
        };

        flags.insert(state.global_op_flags);
        if is_write {
            flags.insert(OpFlags::WRITE);
        }
        let balance_reads = flags.contains(OpFlags::BALANCE_READS) && !is_write;
        let tid = state.next_tid();
        let op = Op {
            tid,
            target: OpTarget::new(oid, locator, balance_reads),
            session: None,
            indata: combined_indata(&ops),
            ops,
            out_handlers,
            flags,
            priority,
            should_resend,
            attempts: 0,
            on_ack: on_ack.map(Continuation::Caller),
            on_commit: on_commit.map(Continuation::Caller),
            map_epoch: 0,
            paused: false,
            budgeted: true,
            budget_cost: cost,
            linger_id: None,
            sent_at: None,
            map_deadline: map_timeout.map(|timeout| Instant::now() + timeout),
        };
        state.ops.insert(tid, op);
        tracing::debug!(tid, cost, write = is_write, "op submitted");
        self.place_new_op(&mut state, tid);

        let deferred = std::mem::take(&mut state.deferred);
        drop(state);
        run_deferred(deferred);
        Ok(tid)
    }

    /// Submit and wait for the terminal outcome: commit for writes, ack for
    /// reads. Any continuations already set on `spec` are replaced.
    pub async fn operate(&self, mut spec: OpSpec) -> OpResult {
        let (completion, rx) = Completion::channel();
        if spec.is_write() {
            spec.on_ack = None;
            spec.on_commit = Some(completion);
        } else {
            spec.on_ack = Some(completion);
            spec.on_commit = None;
        }
        self.submit(spec).await?;
        recv_completion(rx).await
    }

    /// Drop an outstanding op without invoking its continuations. Cancelling
    /// a linger's registration request removes the linger with it, as
    /// `unregister_linger` does.
    pub async fn cancel(&self, tid: Tid) -> Result<(), ObjecterError> {
        self.with_state(|state| -> Result<(), ObjecterError> {
            let linger_id = state
                .ops
                .get(&tid)
                .ok_or(ObjecterError::UnknownRequest(tid))?
                .linger_id;
            if let Some(id) = linger_id {
                if self.detach_linger(state, id).is_some() {
                    tracing::debug!(tid, linger_id = id, "setup request cancelled, linger removed");
                }
            }
            // Dropping the record drops its continuations unrun.
            drop(self.finish_op(state, tid));
            state.cancelled += 1;
            tracing::debug!(tid, "op cancelled");
            Ok(())
        })
        .await
    }

    /// Reply from a storage node.
    pub async fn handle_reply(&self, reply: OpReply) {
        self.with_state(|state| self.handle_reply_locked(state, reply))
            .await
    }

    fn handle_reply_locked(&self, state: &mut State, reply: OpReply) {
        if reply.map_epoch > state.map.epoch {
            let want = state.map.epoch + 1;
            self.request_map(state, want);
        }
        let tid = reply.tid;
        let map = state.map.clone();
        let Some(op) = state.ops.get_mut(&tid) else {
            tracing::debug!(tid, "reply for unknown op");
            return;
        };
        if reply.attempt != op.attempts {
            tracing::debug!(
                tid,
                attempt = reply.attempt,
                latest = op.attempts,
                "dropping reply to stale attempt"
            );
            return;
        }

        if reply.result == RESULT_AGAIN && op.target.used_replica {
            tracing::debug!(tid, "replica refused read, retrying on primary");
            op.target.balance_reads = false;
            let pool = op.target.locator.pool;
            match recalc_target(&mut op.target, &map, self.placement(), tid) {
                RecalcResult::PoolDne => {
                    self.fail_op(state, tid, ObjecterError::TargetPoolRemoved { pool })
                }
                _ => self.resend_op(state, tid, ResendReason::ReplicaRetry),
            }
            return;
        }

        for (idx, handler) in std::mem::take(&mut op.out_handlers).into_iter().enumerate() {
            if let Some(handler) = handler {
                let out = reply.outputs.get(idx).cloned().unwrap_or(SubOpOutput {
                    rval: reply.result,
                    data: Bytes::new(),
                });
                state.deferred.push(Box::new(move || handler(out.rval, out.data)));
            }
        }

        let failed = reply.result < 0;
        let ack = if failed || reply.flags.ack || reply.flags.ondisk {
            op.on_ack.take()
        } else {
            None
        };
        let commit = if failed || reply.flags.ondisk {
            op.on_commit.take()
        } else {
            None
        };
        let done = op.on_ack.is_none() && op.on_commit.is_none();
        let result = if failed {
            Err(ObjecterError::Remote { code: reply.result })
        } else {
            Ok(OpOutcome {
                result: reply.result,
                outputs: reply.outputs,
                version: reply.version,
                reply_epoch: reply.map_epoch,
            })
        };

        if done {
            self.finish_op(state, tid);
            if failed {
                state.failed += 1;
            } else {
                state.completed += 1;
            }
            tracing::debug!(tid, result = reply.result, "op finished");
        }
        if let Some(continuation) = ack {
            self.deliver(state, continuation, result.clone());
        }
        if let Some(continuation) = commit {
            self.deliver(state, continuation, result);
        }
    }

    /// Map update from the transport. Returns whether the map was applied.
    pub async fn handle_map(&self, epoch: Epoch, payload: &[u8]) -> anyhow::Result<bool> {
        let map = ClusterMap::decode(payload)?;
        anyhow::ensure!(
            map.epoch == epoch,
            "map payload carries epoch {} but was announced as {epoch}",
            map.epoch
        );
        Ok(self.apply_map(map).await)
    }

    /// Install `map` if it is newer than the current one and re-target every
    /// op and linger against it.
    pub async fn apply_map(&self, map: ClusterMap) -> bool {
        self.with_state(|state| self.apply_map_locked(state, map))
            .await
    }

    fn apply_map_locked(&self, state: &mut State, map: ClusterMap) -> bool {
        let previous = state.map.epoch;
        if map.epoch <= previous {
            tracing::debug!(epoch = map.epoch, current = previous, "ignoring stale map");
            return false;
        }
        if state.shutdown {
            return false;
        }
        let skipped = previous > 0 && map.epoch > previous + 1;
        tracing::info!(epoch = map.epoch, previous, skipped, "applying cluster map");
        state.map = Arc::new(map);
        let map = state.map.clone();
        if state.map_requested.is_some_and(|epoch| epoch <= map.epoch) {
            state.map_requested = None;
        }

        let mut resend_ops = BTreeSet::new();
        let mut resend_lingers = BTreeSet::new();
        self.reconcile_sessions(state, &map, &mut resend_ops, &mut resend_lingers);

        let mut removed_ops = Vec::new();
        let tids: Vec<Tid> = state.ops.keys().copied().collect();
        for tid in tids {
            let Some(op) = state.ops.get_mut(&tid) else {
                continue;
            };
            // Setup requests follow their linger.
            if op.linger_id.is_some() {
                continue;
            }
            match recalc_target(&mut op.target, &map, self.placement(), tid) {
                RecalcResult::NeedResend => {
                    state.check_latest_map_ops.remove(&tid);
                    resend_ops.insert(tid);
                }
                RecalcResult::NoAction => {
                    let sent = op.attempts > 0 && op.session.is_some();
                    if op.paused || (skipped && sent) {
                        resend_ops.insert(tid);
                    }
                }
                RecalcResult::PoolDne if op.target.pool_seen => {
                    removed_ops.push((tid, op.target.locator.pool));
                }
                RecalcResult::PoolDne => {
                    state.check_latest_map_ops.entry(tid).or_default();
                }
            }
        }

        let mut removed_lingers = Vec::new();
        let ids: Vec<LingerId> = state.lingers.keys().copied().collect();
        for id in ids {
            let Some(linger) = state.lingers.get_mut(&id) else {
                continue;
            };
            match recalc_target(&mut linger.target, &map, self.placement(), id) {
                RecalcResult::NeedResend => {
                    state.check_latest_map_lingers.remove(&id);
                    resend_lingers.insert(id);
                }
                RecalcResult::NoAction => {
                    let setup_paused = linger
                        .register_tid
                        .and_then(|tid| state.ops.get(&tid))
                        .is_some_and(|op| op.paused);
                    if setup_paused || (skipped && linger.session.is_some()) {
                        resend_lingers.insert(id);
                    }
                }
                RecalcResult::PoolDne if linger.target.pool_seen => {
                    removed_lingers.push((id, linger.target.locator.pool));
                }
                RecalcResult::PoolDne => {
                    state.check_latest_map_lingers.entry(id).or_default();
                }
            }
        }

        for (tid, pool) in removed_ops {
            tracing::info!(tid, pool, epoch = map.epoch, "target pool removed, failing op");
            self.fail_op(state, tid, ObjecterError::TargetPoolRemoved { pool });
        }
        for (id, pool) in removed_lingers {
            tracing::info!(linger_id = id, pool, epoch = map.epoch, "target pool removed, failing linger");
            self.fail_linger(state, id, ObjecterError::TargetPoolRemoved { pool });
        }
        for id in resend_lingers {
            self.resend_linger(state, id, ResendReason::MapChange);
        }
        for tid in resend_ops {
            self.resend_op(state, tid, ResendReason::MapChange);
        }

        self.settle_parked(state);
        self.finish_applied_pool_ops(state);
        state.drain_map_waiters();
        true
    }

    /// Close sessions to nodes that went down, reopen those whose address
    /// moved, and collect the members that need a resend.
    fn reconcile_sessions(
        &self,
        state: &mut State,
        map: &ClusterMap,
        resend_ops: &mut BTreeSet<Tid>,
        resend_lingers: &mut BTreeSet<LingerId>,
    ) {
        for node in state.sessions.nodes() {
            let Some(current_addr) = state.sessions.get(node).map(|s| s.addr.clone()) else {
                continue;
            };
            match map.nodes.get(&node).filter(|info| info.up) {
                None => {
                    let Some(session) = state.sessions.close(node, self.transport.as_ref()) else {
                        continue;
                    };
                    tracing::info!(node, epoch = map.epoch, "node down, detaching its requests");
                    for tid in session.ops {
                        if let Some(op) = state.ops.get_mut(&tid) {
                            op.session = None;
                            op.paused = true;
                            op.target.make_homeless();
                        }
                    }
                    for id in session.lingers {
                        if let Some(linger) = state.lingers.get_mut(&id) {
                            linger.session = None;
                            linger.target.make_homeless();
                        }
                    }
                }
                Some(info) if info.addr != current_addr => {
                    state
                        .sessions
                        .reopen(node, &info.addr, self.transport.as_ref());
                    if let Some(session) = state.sessions.get(node) {
                        for tid in &session.ops {
                            match state.ops.get(tid).and_then(|op| op.linger_id) {
                                Some(id) => resend_lingers.insert(id),
                                None => resend_ops.insert(*tid),
                            };
                        }
                        resend_lingers.extend(session.lingers.iter().copied());
                    }
                }
                Some(_) => {}
            }
        }
    }

    /// Answer to the oldest outstanding newest-epoch probe.
    pub async fn handle_map_version(&self, newest: Epoch) {
        self.with_state(|state| {
            if state.probes_answered < state.probes_sent {
                state.probes_answered += 1;
            }
            let answered = state.probes_answered;
            tracing::debug!(
                newest,
                current = state.map.epoch,
                answered,
                "map version probe answered"
            );
            let parked = state
                .check_latest_map_ops
                .values_mut()
                .chain(state.check_latest_map_lingers.values_mut());
            for entry in parked {
                if entry.newest.is_none() && entry.probe.is_some_and(|seq| seq <= answered) {
                    entry.newest = Some(newest);
                }
            }
            self.settle_parked(state);
            if newest > state.map.epoch {
                let want = state.map.epoch + 1;
                self.request_map(state, want);
            }
        })
        .await
    }

    /// Resolve ops and lingers parked on an unknown pool. An entry fails
    /// once the newest epoch reported by its own probe is applied; entries
    /// still behind that epoch keep the map subscription open.
    fn settle_parked(&self, state: &mut State) {
        if !state.has_parked() {
            return;
        }
        let epoch = state.map.epoch;
        let settled_ops: Vec<Tid> = state
            .check_latest_map_ops
            .iter()
            .filter(|(_, parked)| parked.settled_by(epoch))
            .map(|(tid, _)| *tid)
            .collect();
        let settled_lingers: Vec<LingerId> = state
            .check_latest_map_lingers
            .iter()
            .filter(|(_, parked)| parked.settled_by(epoch))
            .map(|(id, _)| *id)
            .collect();
        for tid in settled_ops {
            state.check_latest_map_ops.remove(&tid);
            let Some(pool) = state.ops.get(&tid).map(|op| op.target.locator.pool) else {
                continue;
            };
            tracing::info!(tid, pool, epoch, "pool absent from newest map, failing op");
            self.fail_op(state, tid, ObjecterError::TargetPoolRemoved { pool });
        }
        for id in settled_lingers {
            state.check_latest_map_lingers.remove(&id);
            let Some(pool) = state.lingers.get(&id).map(|l| l.target.locator.pool) else {
                continue;
            };
            tracing::info!(linger_id = id, pool, epoch, "pool absent from newest map, failing linger");
            self.fail_linger(state, id, ObjecterError::TargetPoolRemoved { pool });
        }

        let behind = state
            .check_latest_map_ops
            .values()
            .chain(state.check_latest_map_lingers.values())
            .any(|parked| parked.behind(epoch));
        if behind {
            self.request_map(state, epoch + 1);
        }
        self.probe_map_version(state);
    }

    /// Send one newest-epoch probe covering every parked entry that is not
    /// yet waiting on a probe sent after it was parked.
    pub(super) fn probe_map_version(&self, state: &mut State) {
        let unprobed = state
            .check_latest_map_ops
            .values()
            .chain(state.check_latest_map_lingers.values())
            .any(|parked| parked.probe.is_none());
        if !unprobed {
            return;
        }
        if let Err(err) = self.transport.request_map_version() {
            tracing::warn!(error = ?err, "map version probe failed");
            return;
        }
        state.probes_sent += 1;
        let seq = state.probes_sent;
        let parked = state
            .check_latest_map_ops
            .values_mut()
            .chain(state.check_latest_map_lingers.values_mut());
        for entry in parked.filter(|entry| entry.probe.is_none()) {
            entry.probe = Some(seq);
        }
    }

    /// Subscribe to maps from `epoch` unless an earlier subscription covers it.
    pub(super) fn request_map(&self, state: &mut State, epoch: Epoch) {
        if state.map_requested.is_some_and(|requested| requested <= epoch) {
            return;
        }
        match self.transport.request_map(epoch) {
            Ok(()) => {
                tracing::debug!(epoch, "requested map");
                state.map_requested = Some(epoch);
            }
            Err(err) => tracing::warn!(error = ?err, epoch, "map request failed"),
        }
    }

    /// Invoke `on_map` once a map with at least `epoch` is installed.
    pub async fn wait_for_map(&self, epoch: Epoch, on_map: Completion<Epoch>) {
        self.with_state(|state| {
            if state.shutdown {
                state.deferred.push(on_map.deferred(Err(ObjecterError::Shutdown)));
                return;
            }
            let current = state.map.epoch;
            if current >= epoch {
                state.deferred.push(on_map.deferred(Ok(current)));
                return;
            }
            state
                .map_waiters
                .entry(epoch)
                .or_default()
                .push(Box::new(move |result| on_map.complete(result)));
            self.request_map(state, current + 1);
        })
        .await
    }

    pub async fn wait_for_epoch(&self, epoch: Epoch) -> Result<Epoch, ObjecterError> {
        let (completion, rx) = Completion::channel();
        self.wait_for_map(epoch, completion).await;
        recv_completion(rx).await
    }

    /// The local end tore down and re-established the channel to `node`.
    pub async fn handle_session_reset(&self, node: NodeId) {
        self.with_state(|state| self.reset_session(state, node, false))
            .await
    }

    /// The remote end reset the channel to `node` first.
    pub async fn handle_remote_reset(&self, node: NodeId) {
        self.with_state(|state| self.reset_session(state, node, true))
            .await
    }

    fn reset_session(&self, state: &mut State, node: NodeId, remote: bool) {
        let Some(addr) = state.sessions.get(node).map(|s| s.addr.clone()) else {
            tracing::debug!(node, remote, "reset for node without a session");
            return;
        };
        tracing::info!(node, remote, "session reset, resending its requests");
        state.sessions.reopen(node, &addr, self.transport.as_ref());
        let Some((ops, lingers)) = state
            .sessions
            .get(node)
            .map(|s| (s.ops.clone(), s.lingers.clone()))
        else {
            return;
        };
        for id in lingers {
            self.resend_linger(state, id, ResendReason::SessionReset);
        }
        for tid in ops {
            let Some(op) = state.ops.get(&tid) else {
                continue;
            };
            if op.linger_id.is_some() {
                continue;
            }
            if !op.should_resend && op.attempts > 0 {
                self.fail_op(
                    state,
                    tid,
                    ObjecterError::TransportFailure(format!("session to node {node} was reset")),
                );
                continue;
            }
            self.resend_op(state, tid, ResendReason::SessionReset);
        }
    }

    /// First placement of a freshly submitted op.
    fn place_new_op(&self, state: &mut State, tid: Tid) {
        let map = state.map.clone();
        let Some(op) = state.ops.get_mut(&tid) else {
            return;
        };
        match recalc_target(&mut op.target, &map, self.placement(), tid) {
            RecalcResult::PoolDne => {
                tracing::debug!(
                    tid,
                    pool = op.target.locator.pool,
                    epoch = map.epoch,
                    "pool unknown, parking op until the newest map is known"
                );
                op.paused = true;
                state.check_latest_map_ops.insert(tid, Parked::default());
                self.probe_map_version(state);
            }
            _ => {
                self.assign_session(state, tid);
                if !self.send_op(state, tid) && state.ops.get(&tid).is_some_and(|op| op.session.is_none()) {
                    self.request_map(state, map.epoch + 1);
                }
            }
        }
    }

    /// Move the op's session membership to match its resolved target.
    pub(super) fn assign_session(&self, state: &mut State, tid: Tid) {
        let Some(op) = state.ops.get_mut(&tid) else {
            return;
        };
        let target = op.target.node;
        if op.session == target {
            return;
        }
        if let Some(old) = op.session.take() {
            state.sessions.detach_op(old, tid);
        }
        if let Some(node) = target {
            let addr = state.map.node_addr(node).unwrap_or_default();
            state.sessions.open(node, addr, self.transport.as_ref());
            state.sessions.attach_op(node, tid);
            op.session = Some(node);
        }
    }

    fn should_pause(&self, flags: MapFlags, op_flags: OpFlags) -> bool {
        let full = self.config.honor_full && flags.full && !op_flags.contains(OpFlags::FULL_FORCE);
        (op_flags.is_read() && flags.pause_read)
            || (op_flags.is_write() && (flags.pause_write || full))
    }

    /// Send the op's next attempt. Returns false if it stayed unsent
    /// (homeless, paused, or failed on a send error).
    pub(super) fn send_op(&self, state: &mut State, tid: Tid) -> bool {
        let epoch = state.map.epoch;
        let map_flags = state.map.flags;
        let incarnation = state.client_incarnation;
        let Some(op) = state.ops.get_mut(&tid) else {
            return false;
        };
        let (Some(node), Some(shard)) = (op.session, op.target.shard) else {
            op.paused = true;
            tracing::debug!(tid, epoch, "op is homeless");
            return false;
        };
        if self.should_pause(map_flags, op.flags) {
            op.paused = true;
            tracing::debug!(tid, node, epoch, "op paused by cluster flags");
            return false;
        }
        op.paused = false;
        op.attempts += 1;
        op.map_epoch = epoch;
        op.sent_at = Some(Instant::now());
        let req = OpRequest {
            tid,
            attempt: op.attempts,
            client_incarnation: incarnation,
            map_epoch: epoch,
            oid: op.target.oid.clone(),
            locator: op.target.locator.clone(),
            shard,
            flags: op.flags,
            priority: op.priority,
            ops: op.ops.clone(),
            indata: op.indata.clone(),
            linger_id: op.linger_id,
        };
        let should_resend = op.should_resend;
        if let Some(session) = state.sessions.get_mut(node) {
            session.last_sent_epoch = session.last_sent_epoch.max(epoch);
        }
        tracing::debug!(tid, node, attempt = req.attempt, epoch, "sending op");
        if let Err(err) = self.transport.send_op(node, req) {
            tracing::warn!(error = ?err, tid, node, "send op failed");
            if !should_resend {
                self.fail_op(
                    state,
                    tid,
                    ObjecterError::TransportFailure(format!("{err:#}")),
                );
                return false;
            }
        }
        true
    }

    pub(super) fn resend_op(&self, state: &mut State, tid: Tid, reason: ResendReason) {
        let Some(previous) = state.ops.get(&tid).map(|op| op.attempts) else {
            return;
        };
        self.assign_session(state, tid);
        if self.send_op(state, tid) && previous > 0 {
            state.resends.record(reason);
            tracing::debug!(tid, reason = ?reason, "op resent");
        }
    }

    /// Remove an op from every table and credit its budget. Continuations
    /// still on the returned record have not been run.
    pub(super) fn finish_op(&self, state: &mut State, tid: Tid) -> Option<Op> {
        let mut op = state.ops.remove(&tid)?;
        if let Some(node) = op.session {
            state.sessions.detach_op(node, tid);
        }
        state.check_latest_map_ops.remove(&tid);
        if op.budgeted {
            state.budget.put(op.budget_cost);
            op.budgeted = false;
            self.budget_notify.notify_waiters();
        }
        Some(op)
    }

    /// Finish an op and complete its remaining continuations with `err`.
    pub(super) fn fail_op(&self, state: &mut State, tid: Tid, err: ObjecterError) {
        let Some(mut op) = self.finish_op(state, tid) else {
            return;
        };
        state.failed += 1;
        tracing::debug!(tid, error = %err, "op failed");
        if let Some(continuation) = op.on_ack.take() {
            self.deliver(state, continuation, Err(err.clone()));
        }
        if let Some(continuation) = op.on_commit.take() {
            self.deliver(state, continuation, Err(err));
        }
    }

    fn deliver(&self, state: &mut State, continuation: Continuation, result: OpResult) {
        match continuation {
            Continuation::Caller(completion) => state.deferred.push(completion.deferred(result)),
            Continuation::LingerAck(id) => self.linger_ack(state, id, result),
            Continuation::LingerCommit(id) => self.linger_commit(state, id, result),
        }
    }

    /// Periodic maintenance; see `spawn_ticker`.
    pub async fn tick(&self) -> TickReport {
        self.with_state(|state| self.tick_locked(state)).await
    }

    fn tick_locked(&self, state: &mut State) -> TickReport {
        let mut report = TickReport::default();
        if state.shutdown {
            return report;
        }
        let now = Instant::now();
        let laggy = self.config.laggy_threshold();
        let epoch = state.map.epoch;
        let mut laggy_nodes = BTreeSet::new();
        let mut homeless = 0usize;
        for op in state.ops.values() {
            match (op.session, op.sent_at) {
                (Some(node), Some(sent)) if !op.paused => {
                    if now.saturating_duration_since(sent) >= laggy {
                        report.laggy_ops.push(op.tid);
                        laggy_nodes.insert(node);
                    }
                }
                (None, _) => {
                    homeless += 1;
                    if op.map_deadline.is_some_and(|deadline| deadline <= now) {
                        report.map_timeouts.push(op.tid);
                    }
                }
                _ => {}
            }
        }

        if !report.laggy_ops.is_empty() {
            tracing::warn!(laggy = report.laggy_ops.len(), epoch, "ops outstanding past laggy threshold");
        }
        for node in laggy_nodes {
            if let Err(err) = self.transport.ping(node) {
                tracing::warn!(error = ?err, node, "ping failed");
            }
            report.pinged.push(node);
        }
        for tid in &report.map_timeouts {
            tracing::warn!(tid, epoch, "no map placed op before its deadline");
            self.fail_op(state, *tid, ObjecterError::MapTimeout { epoch });
        }
        if let Some(timeout) = self.config.admin_op_timeout() {
            report.admin_timeouts = self.expire_admin_ops(state, now, timeout);
        }

        // Retry probes whose send failed.
        self.probe_map_version(state);

        report.homeless_ops = homeless - report.map_timeouts.len();
        if report.homeless_ops > 0 {
            // Re-subscribe in case an earlier request was lost.
            state.map_requested = None;
            self.request_map(state, epoch + 1);
        }
        report
    }

    /// Run `tick` every configured interval until the router is dropped or
    /// shut down.
    pub fn spawn_ticker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.tick_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(objecter) = weak.upgrade() else {
                    break;
                };
                if objecter.is_shut_down().await {
                    break;
                }
                let report = objecter.tick().await;
                if !report.map_timeouts.is_empty() || !report.admin_timeouts.is_empty() {
                    tracing::debug!(
                        map_timeouts = report.map_timeouts.len(),
                        admin_timeouts = report.admin_timeouts.len(),
                        "tick expired requests"
                    );
                }
            }
        })
    }

    /// Close sessions with no ops or lingers attached.
    pub async fn reap_sessions(&self) -> Vec<NodeId> {
        self.with_state(|state| state.sessions.reap(self.transport.as_ref()))
            .await
    }

    pub async fn add_global_op_flags(&self, bits: u32) {
        self.with_state(|state| state.global_op_flags |= bits).await
    }

    pub async fn clear_global_op_flags(&self, bits: u32) {
        self.with_state(|state| state.global_op_flags &= !bits).await
    }

    pub async fn set_client_incarnation(&self, incarnation: u32) {
        self.with_state(|state| state.client_incarnation = incarnation)
            .await
    }

    /// Current map. The returned epoch stays valid after newer maps arrive.
    pub async fn current_map(&self) -> Arc<ClusterMap> {
        self.state.lock().await.map.clone()
    }

    pub async fn op_info(&self, tid: Tid) -> Option<OpInfo> {
        self.state.lock().await.ops.get(&tid).map(OpInfo::from_op)
    }

    pub async fn session_info(&self, node: NodeId) -> Option<SessionInfo> {
        let state = self.state.lock().await;
        state.sessions.get(node).map(|s| SessionInfo {
            node: s.node,
            addr: s.addr.clone(),
            incarnation: s.incarnation,
            last_sent_epoch: s.last_sent_epoch,
            ops: s.ops.iter().copied().collect(),
            lingers: s.lingers.iter().copied().collect(),
        })
    }

    pub async fn stats(&self) -> ObjecterStats {
        let state = self.state.lock().await;
        let (inflight_bytes, inflight_ops) = state.budget.in_use();
        let ops = state.ops.values();
        ObjecterStats {
            epoch: state.map.epoch,
            ops: state.ops.len(),
            homeless_ops: ops.clone().filter(|op| op.session.is_none()).count(),
            paused_ops: ops.clone().filter(|op| op.paused).count(),
            unacked_ops: ops.clone().filter(|op| op.on_ack.is_some()).count(),
            uncommitted_ops: ops.filter(|op| op.on_commit.is_some()).count(),
            parked_ops: state.check_latest_map_ops.len(),
            lingers: state.lingers.len(),
            registered_lingers: state.lingers.values().filter(|l| l.registered).count(),
            registering_lingers: state.awaiting_map_check.len(),
            sessions: state.sessions.len(),
            pool_ops: state.pool_ops.len(),
            pool_stat_ops: state.pool_stat_ops.len(),
            statfs_ops: state.statfs_ops.len(),
            map_waiters: state.map_waiters.values().map(Vec::len).sum(),
            inflight_bytes,
            inflight_ops,
            resends_map_change: state.resends.map_change,
            resends_session_reset: state.resends.session_reset,
            resends_replica_retry: state.resends.replica_retry,
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
            linger_reregister_failures: state.linger_reregister_failures,
        }
    }

    /// Every table as JSON, for debugging endpoints and the simulator.
    pub async fn dump_requests(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let sessions: Vec<SessionInfo> = state
            .sessions
            .iter()
            .map(|s| SessionInfo {
                node: s.node,
                addr: s.addr.clone(),
                incarnation: s.incarnation,
                last_sent_epoch: s.last_sent_epoch,
                ops: s.ops.iter().copied().collect(),
                lingers: s.lingers.iter().copied().collect(),
            })
            .collect();
        serde_json::json!({
            "epoch": state.map.epoch,
            "ops": state.ops.values().map(OpInfo::from_op).collect::<Vec<_>>(),
            "lingers": state.lingers.values().map(LingerInfo::from_linger).collect::<Vec<_>>(),
            "sessions": sessions,
            "pool_ops": state.pool_ops.values().map(|op| &op.request).collect::<Vec<_>>(),
            "pool_stat_ops": state.pool_stat_ops.values().map(|op| &op.request).collect::<Vec<_>>(),
            "statfs_ops": state.statfs_ops.values().map(|op| &op.request).collect::<Vec<_>>(),
        })
    }

    /// True while any op, linger or admin request is outstanding.
    pub async fn is_active(&self) -> bool {
        let state = self.state.lock().await;
        !state.ops.is_empty() || !state.lingers.is_empty() || state.admin_len() > 0
    }

    pub async fn is_shut_down(&self) -> bool {
        self.state.lock().await.shutdown
    }

    /// Fail everything outstanding with `Shutdown` and close all sessions.
    pub async fn shutdown(&self) {
        self.with_state(|state| {
            if state.shutdown {
                return;
            }
            tracing::info!(
                ops = state.ops.len(),
                lingers = state.lingers.len(),
                admin = state.admin_len(),
                "shutting down object router"
            );
            state.shutdown = true;
            let tids: Vec<Tid> = state.ops.keys().copied().collect();
            for tid in tids {
                self.fail_op(state, tid, ObjecterError::Shutdown);
            }
            let ids: Vec<LingerId> = state.lingers.keys().copied().collect();
            for id in ids {
                self.fail_linger(state, id, ObjecterError::Shutdown);
            }
            self.fail_admin_ops(state, ObjecterError::Shutdown);
            for waiter in std::mem::take(&mut state.map_waiters).into_values().flatten() {
                state
                    .deferred
                    .push(Box::new(move || waiter(Err(ObjecterError::Shutdown))));
            }
            state.check_latest_map_ops.clear();
            state.check_latest_map_lingers.clear();
            state.sessions.close_all(self.transport.as_ref());
        })
        .await;
        self.budget_notify.notify_waiters();
    }
}
