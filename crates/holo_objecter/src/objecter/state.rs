//! Mutable router state (protected by the single mutex in the engine).
//!
//! Ops and lingers live in id-keyed tables; sessions refer to them by id, and
//! a linger's setup request refers back to its linger by id, so nothing here
//! holds a reference into another table.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;

use super::completion::{Completion, Deferred, MapWaiter, OpOutcome};
use super::error::ObjecterError;
use super::operation::{SubOp, SubOpHandler};
use super::placement::OpTarget;
use super::session::SessionRegistry;
use super::throttle::Budget;
use super::types::{
    AdminRequest, ClusterMap, ClusterStatfs, Epoch, LingerId, NodeId, OpFlags, PoolStat, Tid,
};

/// Why a request is being sent again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResendReason {
    /// A newer map moved the target or skipped epochs.
    MapChange,
    /// The channel to the node was torn down and re-established.
    SessionReset,
    /// A replica refused a balanced read; retry on the primary.
    ReplicaRetry,
}

#[derive(Clone, Copy, Debug, Default)]
pub(super) struct ResendCounters {
    pub(super) map_change: u64,
    pub(super) session_reset: u64,
    pub(super) replica_retry: u64,
}

impl ResendCounters {
    pub(super) fn record(&mut self, reason: ResendReason) {
        match reason {
            ResendReason::MapChange => self.map_change += 1,
            ResendReason::SessionReset => self.session_reset += 1,
            ResendReason::ReplicaRetry => self.replica_retry += 1,
        }
    }
}

/// Where an op's ack or commit result goes.
pub(super) enum Continuation {
    Caller(Completion<OpOutcome>),
    LingerAck(LingerId),
    LingerCommit(LingerId),
}

/// One outstanding object request.
pub(super) struct Op {
    pub(super) tid: Tid,
    pub(super) target: OpTarget,
    /// Node whose session lists this op; `None` while homeless.
    pub(super) session: Option<NodeId>,
    pub(super) ops: Vec<SubOp>,
    pub(super) indata: Bytes,
    pub(super) out_handlers: Vec<Option<SubOpHandler>>,
    pub(super) flags: OpFlags,
    pub(super) priority: i32,
    pub(super) should_resend: bool,
    pub(super) attempts: u32,
    pub(super) on_ack: Option<Continuation>,
    pub(super) on_commit: Option<Continuation>,
    /// Epoch of the map the latest attempt was sent under.
    pub(super) map_epoch: Epoch,
    pub(super) paused: bool,
    pub(super) budgeted: bool,
    pub(super) budget_cost: u64,
    pub(super) linger_id: Option<LingerId>,
    pub(super) sent_at: Option<Instant>,
    pub(super) map_deadline: Option<Instant>,
}

/// Failure callback for a linger that has no registration continuation left.
pub type LingerErrorHandler = Box<dyn FnOnce(ObjecterError) + Send + 'static>;

/// A registration that outlives one request (watch/notify).
pub(super) struct LingerOp {
    pub(super) id: LingerId,
    pub(super) target: OpTarget,
    pub(super) session: Option<NodeId>,
    pub(super) ops: Vec<SubOp>,
    pub(super) indata: Bytes,
    pub(super) flags: OpFlags,
    /// A setup request is outstanding.
    pub(super) registering: bool,
    /// At least one setup request has committed.
    pub(super) registered: bool,
    pub(super) register_tid: Option<Tid>,
    pub(super) on_reg_ack: Option<Completion<OpOutcome>>,
    pub(super) on_reg_commit: Option<Completion<OpOutcome>>,
    pub(super) on_error: Option<LingerErrorHandler>,
}

/// Newest-epoch probe bookkeeping for one parked op or linger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct Parked {
    /// Sequence number of the first probe sent after the entry was parked.
    pub(super) probe: Option<u64>,
    /// Newest epoch reported by the answer to that probe.
    pub(super) newest: Option<Epoch>,
}

impl Parked {
    /// The newest map is applied and the pool is still missing.
    pub(super) fn settled_by(&self, epoch: Epoch) -> bool {
        self.newest.is_some_and(|newest| epoch >= newest)
    }

    pub(super) fn behind(&self, epoch: Epoch) -> bool {
        self.newest.is_some_and(|newest| newest > epoch)
    }
}

/// Pool, stat or statfs request addressed to the cluster leader.
pub(super) struct AdminOp<T> {
    pub(super) request: AdminRequest,
    pub(super) on_finish: Completion<T>,
    pub(super) started: Instant,
    /// Reply epoch and result of a pool op the leader already applied,
    /// held until the local map reaches that epoch.
    pub(super) applied: Option<(Epoch, T)>,
}

pub(super) struct State {
    pub(super) map: Arc<ClusterMap>,
    pub(super) last_tid: Tid,
    pub(super) last_linger_id: LingerId,
    pub(super) ops: BTreeMap<Tid, Op>,
    pub(super) lingers: BTreeMap<LingerId, LingerOp>,
    pub(super) sessions: SessionRegistry,
    pub(super) budget: Budget,
    pub(super) pool_ops: BTreeMap<Tid, AdminOp<Bytes>>,
    pub(super) pool_stat_ops: BTreeMap<Tid, AdminOp<BTreeMap<String, PoolStat>>>,
    pub(super) statfs_ops: BTreeMap<Tid, AdminOp<ClusterStatfs>>,
    /// Ops whose pool no map has shown yet, waiting on the version probe.
    pub(super) check_latest_map_ops: BTreeMap<Tid, Parked>,
    pub(super) check_latest_map_lingers: BTreeMap<LingerId, Parked>,
    /// Lingers with a setup request in flight.
    pub(super) awaiting_map_check: BTreeSet<LingerId>,
    pub(super) map_waiters: BTreeMap<Epoch, Vec<MapWaiter>>,
    /// Version probes sent and answered. Answers arrive in send order.
    pub(super) probes_sent: u64,
    pub(super) probes_answered: u64,
    pub(super) map_requested: Option<Epoch>,
    pub(super) global_op_flags: u32,
    pub(super) client_incarnation: u32,
    pub(super) resends: ResendCounters,
    pub(super) completed: u64,
    pub(super) failed: u64,
    pub(super) cancelled: u64,
    pub(super) linger_reregister_failures: u64,
    pub(super) shutdown: bool,
    /// Continuations collected under the lock; run after it is released.
    pub(super) deferred: Vec<Deferred>,
}

impl State {
    pub(super) fn new(max_bytes: u64, max_ops: u64, client_incarnation: u32) -> Self {
        Self {
            map: Arc::new(ClusterMap::empty()),
            last_tid: 0,
            last_linger_id: 0,
            ops: BTreeMap::new(),
            lingers: BTreeMap::new(),
            sessions: SessionRegistry::default(),
            budget: Budget::new(max_bytes, max_ops),
            pool_ops: BTreeMap::new(),
            pool_stat_ops: BTreeMap::new(),
            statfs_ops: BTreeMap::new(),
            check_latest_map_ops: BTreeMap::new(),
            check_latest_map_lingers: BTreeMap::new(),
            awaiting_map_check: BTreeSet::new(),
            map_waiters: BTreeMap::new(),
            probes_sent: 0,
            probes_answered: 0,
            map_requested: None,
            global_op_flags: 0,
            client_incarnation,
            resends: ResendCounters::default(),
            completed: 0,
            failed: 0,
            cancelled: 0,
            linger_reregister_failures: 0,
            shutdown: false,
            deferred: Vec::new(),
        }
    }

    pub(super) fn next_tid(&mut self) -> Tid {
        self.last_tid += 1;
        self.last_tid
    }

    pub(super) fn next_linger_id(&mut self) -> LingerId {
        self.last_linger_id += 1;
        self.last_linger_id
    }

    pub(super) fn admin_len(&self) -> usize {
        self.pool_ops.len() + self.pool_stat_ops.len() + self.statfs_ops.len()
    }

    /// Parked ops and lingers waiting on the newest-epoch probe.
    pub(super) fn has_parked(&self) -> bool {
        !self.check_latest_map_ops.is_empty() || !self.check_latest_map_lingers.is_empty()
    }

    /// Queue every waiter whose epoch has been reached.
    pub(super) fn drain_map_waiters(&mut self) {
        let epoch = self.map.epoch;
        let later = self.map_waiters.split_off(&(epoch + 1));
        let ready = std::mem::replace(&mut self.map_waiters, later);
        for waiter in ready.into_values().flatten() {
            self.deferred.push(Box::new(move || waiter(Ok(epoch))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::objecter::completion::run_deferred;

    #[test]
    fn tids_and_linger_ids_are_independent_and_increasing() {
        let mut state = State::new(0, 0, 0);
        assert_eq!(state.next_tid(), 1);
        assert_eq!(state.next_tid(), 2);
        assert_eq!(state.next_linger_id(), 1);
        assert_eq!(state.next_tid(), 3);
    }

    #[test]
    fn only_satisfied_map_waiters_are_drained() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut state = State::new(0, 0, 0);
        for epoch in [3, 5, 8] {
            let sink = seen.clone();
            state
                .map_waiters
                .entry(epoch)
                .or_default()
                .push(Box::new(move |r: Result<Epoch, ObjecterError>| {
                    sink.lock().unwrap().push((epoch, r))
                }));
        }
        state.map = Arc::new(ClusterMap {
            epoch: 5,
            ..ClusterMap::default()
        });
        state.drain_map_waiters();
        run_deferred(std::mem::take(&mut state.deferred));
        assert_eq!(*seen.lock().unwrap(), vec![(3, Ok(5)), (5, Ok(5))]);
        assert_eq!(state.map_waiters.keys().copied().collect::<Vec<_>>(), vec![8]);
    }
}
