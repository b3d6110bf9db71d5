//! Pool management and statistics requests.
//!
//! These go to the cluster leader instead of a placement-resolved node, so
//! they skip targeting entirely. They share the router lock and tid space,
//! are resent whenever the admin channel resets, and can time out.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::completion::{Completion, Deferred};
use super::engine::Objecter;
use super::error::ObjecterError;
use super::state::{AdminOp, State};
use super::types::{
    AdminRequest, ClusterStatfs, PoolId, PoolOpKind, PoolOpReply, PoolStat, PoolStatReply,
    StatfsReply, Tid,
};

fn expire<T: Send + 'static>(
    table: &mut BTreeMap<Tid, AdminOp<T>>,
    now: Instant,
    timeout: Duration,
    deferred: &mut Vec<Deferred>,
) -> Vec<Tid> {
    let expired: Vec<Tid> = table
        .iter()
        .filter(|(_, op)| op.applied.is_none())
        .filter(|(_, op)| now.saturating_duration_since(op.started) >= timeout)
        .map(|(tid, _)| *tid)
        .collect();
    for tid in &expired {
        if let Some(op) = table.remove(tid) {
            deferred.push(op.on_finish.deferred(Err(ObjecterError::OpTimeout)));
        }
    }
    expired
}

fn drain<T: Send + 'static>(
    table: &mut BTreeMap<Tid, AdminOp<T>>,
    err: &ObjecterError,
    deferred: &mut Vec<Deferred>,
) {
    for op in std::mem::take(table).into_values() {
        deferred.push(op.on_finish.deferred(Err(err.clone())));
    }
}

impl Objecter {
    pub async fn create_pool(
        &self,
        name: &str,
        crush_rule: u8,
        on_finish: Completion<Bytes>,
    ) -> Result<Tid, ObjecterError> {
        let name = name.to_string();
        self.with_state(|state| -> Result<Tid, ObjecterError> {
            if state.map.pool_by_name(&name).is_some() {
                return Err(ObjecterError::PoolExists { name });
            }
            self.start_pool_op(state, PoolOpKind::Create { name, crush_rule }, on_finish)
        })
        .await
    }

    pub async fn delete_pool(
        &self,
        pool: PoolId,
        on_finish: Completion<Bytes>,
    ) -> Result<Tid, ObjecterError> {
        self.with_state(|state| -> Result<Tid, ObjecterError> {
            Self::require_pool(state, pool)?;
            self.start_pool_op(state, PoolOpKind::Delete { pool }, on_finish)
        })
        .await
    }

    pub async fn rename_pool(
        &self,
        pool: PoolId,
        name: &str,
        on_finish: Completion<Bytes>,
    ) -> Result<Tid, ObjecterError> {
        let name = name.to_string();
        self.with_state(|state| -> Result<Tid, ObjecterError> {
            Self::require_pool(state, pool)?;
            if state.map.pool_by_name(&name).is_some() {
                return Err(ObjecterError::PoolExists { name });
            }
            self.start_pool_op(state, PoolOpKind::Rename { pool, name }, on_finish)
        })
        .await
    }

    pub async fn create_pool_snap(
        &self,
        pool: PoolId,
        snap_name: &str,
        on_finish: Completion<Bytes>,
    ) -> Result<Tid, ObjecterError> {
        let snap_name = snap_name.to_string();
        self.with_state(|state| -> Result<Tid, ObjecterError> {
            Self::require_pool(state, pool)?;
            self.start_pool_op(state, PoolOpKind::CreateSnap { pool, snap_name }, on_finish)
        })
        .await
    }

    pub async fn delete_pool_snap(
        &self,
        pool: PoolId,
        snap_id: u64,
        on_finish: Completion<Bytes>,
    ) -> Result<Tid, ObjecterError> {
        self.with_state(|state| -> Result<Tid, ObjecterError> {
            Self::require_pool(state, pool)?;
            self.start_pool_op(state, PoolOpKind::DeleteSnap { pool, snap_id }, on_finish)
        })
        .await
    }

    /// Per-pool usage for the named pools (all pools if empty).
    pub async fn get_pool_stats(
        &self,
        pools: Vec<String>,
        on_finish: Completion<BTreeMap<String, PoolStat>>,
    ) -> Result<Tid, ObjecterError> {
        self.with_state(|state| -> Result<Tid, ObjecterError> {
            let tid = Self::admin_tid(state)?;
            let request = AdminRequest::PoolStats { tid, pools };
            self.send_admin(&request);
            state.pool_stat_ops.insert(
                tid,
                AdminOp {
                    request,
                    on_finish,
                    started: Instant::now(),
                    applied: None,
                },
            );
            Ok(tid)
        })
        .await
    }

    /// Cluster-wide capacity and usage.
    pub async fn get_fs_stats(
        &self,
        on_finish: Completion<ClusterStatfs>,
    ) -> Result<Tid, ObjecterError> {
        self.with_state(|state| -> Result<Tid, ObjecterError> {
            let tid = Self::admin_tid(state)?;
            let request = AdminRequest::Statfs { tid };
            self.send_admin(&request);
            state.statfs_ops.insert(
                tid,
                AdminOp {
                    request,
                    on_finish,
                    started: Instant::now(),
                    applied: None,
                },
            );
            Ok(tid)
        })
        .await
    }

    /// Completes immediately unless the reply names an epoch we have not
    /// seen. Such an op stays in the pool op table, holding its result, until
    /// that map is applied.
    pub async fn handle_pool_op_reply(&self, reply: PoolOpReply) {
        self.with_state(|state| {
            let current = state.map.epoch;
            let Some(waiting) = state.pool_ops.get(&reply.tid).map(|op| op.applied.is_some())
            else {
                tracing::debug!(tid = reply.tid, "reply for unknown pool op");
                return;
            };
            if waiting {
                tracing::debug!(tid = reply.tid, "duplicate pool op reply");
                return;
            }
            if reply.result >= 0 && reply.epoch > current {
                tracing::debug!(
                    tid = reply.tid,
                    epoch = reply.epoch,
                    current,
                    "pool op applied, waiting for its map"
                );
                if let Some(op) = state.pool_ops.get_mut(&reply.tid) {
                    op.applied = Some((reply.epoch, reply.data));
                }
                self.request_map(state, current + 1);
                return;
            }
            let Some(op) = state.pool_ops.remove(&reply.tid) else {
                return;
            };
            if reply.result < 0 {
                state.failed += 1;
                let err = ObjecterError::Remote { code: reply.result };
                state.deferred.push(op.on_finish.deferred(Err(err)));
            } else {
                state.completed += 1;
                state.deferred.push(op.on_finish.deferred(Ok(reply.data)));
            }
        })
        .await
    }

    /// Complete pool ops whose reply epoch the current map has reached.
    pub(super) fn finish_applied_pool_ops(&self, state: &mut State) {
        let epoch = state.map.epoch;
        let ready: Vec<Tid> = state
            .pool_ops
            .iter()
            .filter(|(_, op)| op.applied.as_ref().is_some_and(|(want, _)| *want <= epoch))
            .map(|(tid, _)| *tid)
            .collect();
        for tid in ready {
            let Some(op) = state.pool_ops.remove(&tid) else {
                continue;
            };
            let Some((_, data)) = op.applied else {
                continue;
            };
            tracing::debug!(tid, epoch, "pool op visible in map");
            state.completed += 1;
            state.deferred.push(op.on_finish.deferred(Ok(data)));
        }
    }

    pub async fn handle_pool_stat_reply(&self, reply: PoolStatReply) {
        self.with_state(|state| {
            let Some(op) = state.pool_stat_ops.remove(&reply.tid) else {
                tracing::debug!(tid = reply.tid, "reply for unknown pool stat request");
                return;
            };
            state.completed += 1;
            state.deferred.push(op.on_finish.deferred(Ok(reply.stats)));
        })
        .await
    }

    pub async fn handle_statfs_reply(&self, reply: StatfsReply) {
        self.with_state(|state| {
            let Some(op) = state.statfs_ops.remove(&reply.tid) else {
                tracing::debug!(tid = reply.tid, "reply for unknown statfs request");
                return;
            };
            state.completed += 1;
            state.deferred.push(op.on_finish.deferred(Ok(reply.stats)));
        })
        .await
    }

    /// The channel to the cluster leader was re-established: resend every
    /// outstanding admin request in tid order.
    pub async fn handle_admin_reset(&self) {
        self.with_state(|state| {
            let mut requests: BTreeMap<Tid, AdminRequest> = BTreeMap::new();
            // Ops already applied by the leader only wait for their map.
            requests.extend(
                state
                    .pool_ops
                    .iter()
                    .filter(|(_, op)| op.applied.is_none())
                    .map(|(t, op)| (*t, op.request.clone())),
            );
            requests.extend(state.pool_stat_ops.iter().map(|(t, op)| (*t, op.request.clone())));
            requests.extend(state.statfs_ops.iter().map(|(t, op)| (*t, op.request.clone())));
            tracing::info!(count = requests.len(), "admin session reset, resending requests");
            for request in requests.values() {
                self.send_admin(request);
            }
        })
        .await
    }

    /// Fail admin requests outstanding for longer than `timeout`.
    pub(super) fn expire_admin_ops(
        &self,
        state: &mut State,
        now: Instant,
        timeout: Duration,
    ) -> Vec<Tid> {
        let mut expired = expire(&mut state.pool_ops, now, timeout, &mut state.deferred);
        expired.extend(expire(&mut state.pool_stat_ops, now, timeout, &mut state.deferred));
        expired.extend(expire(&mut state.statfs_ops, now, timeout, &mut state.deferred));
        expired.sort_unstable();
        if !expired.is_empty() {
            tracing::warn!(count = expired.len(), "admin requests timed out");
            state.failed += expired.len() as u64;
        }
        expired
    }

    pub(super) fn fail_admin_ops(&self, state: &mut State, err: ObjecterError) {
        drain(&mut state.pool_ops, &err, &mut state.deferred);
        drain(&mut state.pool_stat_ops, &err, &mut state.deferred);
        drain(&mut state.statfs_ops, &err, &mut state.deferred);
    }

    fn admin_tid(state: &mut State) -> Result<Tid, ObjecterError> {
        if state.shutdown {
            return Err(ObjecterError::Shutdown);
        }
        Ok(state.next_tid())
    }

    fn require_pool(state: &State, pool: PoolId) -> Result<(), ObjecterError> {
        if state.map.pool(pool).is_none() {
            return Err(ObjecterError::PoolNotFound {
                pool: pool.to_string(),
            });
        }
        Ok(())
    }

    fn start_pool_op(
        &self,
        state: &mut State,
        op: PoolOpKind,
        on_finish: Completion<Bytes>,
    ) -> Result<Tid, ObjecterError> {
        let tid = Self::admin_tid(state)?;
        let request = AdminRequest::Pool { tid, op };
        tracing::debug!(tid, request = ?request, "sending pool op");
        self.send_admin(&request);
        state.pool_ops.insert(
            tid,
            AdminOp {
                request,
                on_finish,
                started: Instant::now(),
                applied: None,
            },
        );
        Ok(tid)
    }

    fn send_admin(&self, request: &AdminRequest) {
        if let Err(err) = self.transport.send_admin(request.clone()) {
            tracing::warn!(error = ?err, tid = request.tid(), "send admin request failed");
        }
    }
}
