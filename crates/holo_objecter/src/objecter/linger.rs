//! Linger (watch/notify) registrations.
//!
//! A linger owns its target and is re-registered, under the same id, every
//! time its placement moves or its session resets. Each registration attempt
//! is an ordinary op in the op table whose continuations point back at the
//! linger by id; replacing an attempt silently cancels the previous one.

use serde::Serialize;

use super::completion::{Completion, OpOutcome, OpResult};
use super::engine::Objecter;
use super::error::ObjecterError;
use super::operation::{combined_indata, ObjectOperation};
use super::placement::{recalc_target, OpTarget, RecalcResult};
use super::state::{
    Continuation, LingerErrorHandler, LingerOp, Op, Parked, ResendReason, State,
};
use super::types::{LingerId, NodeId, ObjectId, ObjectLocator, OpFlags, PoolId, ShardId, Tid};

/// Everything needed to register a linger.
pub struct LingerSpec {
    pub oid: ObjectId,
    pub locator: ObjectLocator,
    pub operation: ObjectOperation,
    pub flags: OpFlags,
    pub on_reg_ack: Option<Completion<OpOutcome>>,
    pub on_reg_commit: Option<Completion<OpOutcome>>,
    /// Called if the linger fails once no registration continuation is left
    /// to report it (for example its pool is deleted after it registered).
    pub on_error: Option<LingerErrorHandler>,
}

impl LingerSpec {
    pub fn new(oid: impl Into<ObjectId>, locator: ObjectLocator, operation: ObjectOperation) -> Self {
        let oid = oid.into();
        let flags = if operation.is_write() {
            OpFlags::WRITE
        } else {
            OpFlags::READ
        };
        Self {
            locator: locator.normalized(&oid),
            oid,
            operation,
            flags: OpFlags::from_bits(flags),
            on_reg_ack: None,
            on_reg_commit: None,
            on_error: None,
        }
    }

    /// Watch registration identified by `cookie`.
    pub fn watch(oid: impl Into<ObjectId>, locator: ObjectLocator, cookie: u64) -> Self {
        let mut operation = ObjectOperation::new();
        operation.watch(cookie, 0, true);
        Self::new(oid, locator, operation)
    }

    pub fn on_ack(mut self, completion: Completion<OpOutcome>) -> Self {
        self.on_reg_ack = Some(completion);
        self
    }

    pub fn on_commit(mut self, completion: Completion<OpOutcome>) -> Self {
        self.on_reg_commit = Some(completion);
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ObjecterError) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// Snapshot of one linger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LingerInfo {
    pub id: LingerId,
    pub oid: ObjectId,
    pub pool: PoolId,
    pub shard: Option<ShardId>,
    pub acting: Vec<NodeId>,
    pub node: Option<NodeId>,
    pub registering: bool,
    pub registered: bool,
    pub register_tid: Option<Tid>,
}

impl LingerInfo {
    pub(super) fn from_linger(linger: &LingerOp) -> Self {
        Self {
            id: linger.id,
            oid: linger.target.oid.clone(),
            pool: linger.target.locator.pool,
            shard: linger.target.shard,
            acting: linger.target.acting.clone(),
            node: linger.session,
            registering: linger.registering,
            registered: linger.registered,
            register_tid: linger.register_tid,
        }
    }
}

impl Objecter {
    /// Create a linger and send its first registration.
    pub async fn register_linger(&self, spec: LingerSpec) -> Result<LingerId, ObjecterError> {
        let LingerSpec {
            oid,
            locator,
            operation,
            mut flags,
            on_reg_ack,
            on_reg_commit,
            on_error,
        } = spec;
        let (ops, _) = operation.into_parts();
        self.with_state(|state| -> Result<LingerId, ObjecterError> {
            if state.shutdown {
                return Err(ObjecterError::Shutdown);
            }
            let id = state.next_linger_id();
            flags.insert(state.global_op_flags);
            let mut target = OpTarget::new(oid, locator, false);
            let placed = recalc_target(&mut target, &state.map, self.placement(), id);
            state.lingers.insert(
                id,
                LingerOp {
                    id,
                    target,
                    session: None,
                    indata: combined_indata(&ops),
                    ops,
                    flags,
                    registering: false,
                    registered: false,
                    register_tid: None,
                    on_reg_ack,
                    on_reg_commit,
                    on_error,
                },
            );
            if placed == RecalcResult::PoolDne {
                tracing::debug!(linger_id = id, "pool unknown, parking linger");
                state.check_latest_map_lingers.insert(id, Parked::default());
                self.probe_map_version(state);
            } else {
                self.send_linger(state, id);
            }
            Ok(id)
        })
        .await
    }

    /// Remove a linger without invoking any of its continuations. An
    /// outstanding registration request is cancelled with it.
    pub async fn unregister_linger(&self, id: LingerId) -> Result<(), ObjecterError> {
        self.with_state(|state| -> Result<(), ObjecterError> {
            let linger = self
                .detach_linger(state, id)
                .ok_or(ObjecterError::UnknownRequest(id))?;
            tracing::debug!(linger_id = id, registered = linger.registered, "linger unregistered");
            Ok(())
        })
        .await
    }

    pub async fn linger_info(&self, id: LingerId) -> Option<LingerInfo> {
        self.with_state(|state| state.lingers.get(&id).map(LingerInfo::from_linger))
            .await
    }

    /// Send a fresh registration for `id` to its current target, replacing
    /// any registration still in flight.
    pub(super) fn send_linger(&self, state: &mut State, id: LingerId) {
        let Some(linger) = state.lingers.get(&id) else {
            return;
        };
        let previous_tid = linger.register_tid;
        let previous_session = linger.session;
        let target = linger.target.clone();
        let ops = linger.ops.clone();
        let indata = linger.indata.clone();
        let flags = linger.flags;

        if let Some(tid) = previous_tid {
            drop(self.finish_op(state, tid));
        }
        if previous_session != target.node {
            if let Some(node) = previous_session {
                state.sessions.detach_linger(node, id);
            }
            if let Some(node) = target.node {
                let addr = state.map.node_addr(node).unwrap_or_default();
                state.sessions.open(node, addr, self.transport.as_ref());
                state.sessions.attach_linger(node, id);
            }
        }

        let tid = state.next_tid();
        if let Some(linger) = state.lingers.get_mut(&id) {
            linger.session = target.node;
            linger.registering = true;
            linger.register_tid = Some(tid);
        }
        state.awaiting_map_check.insert(id);
        tracing::debug!(linger_id = id, tid, node = ?target.node, "sending linger registration");
        state.ops.insert(
            tid,
            Op {
                tid,
                target,
                session: None,
                ops,
                indata,
                out_handlers: Vec::new(),
                flags,
                priority: 0,
                should_resend: false,
                attempts: 0,
                on_ack: Some(Continuation::LingerAck(id)),
                on_commit: Some(Continuation::LingerCommit(id)),
                map_epoch: 0,
                paused: false,
                budgeted: false,
                budget_cost: 0,
                linger_id: Some(id),
                sent_at: None,
                map_deadline: None,
            },
        );
        self.assign_session(state, tid);
        self.send_op(state, tid);
    }

    pub(super) fn resend_linger(&self, state: &mut State, id: LingerId, reason: ResendReason) {
        let Some(linger) = state.lingers.get(&id) else {
            return;
        };
        if linger.registered || linger.registering {
            state.resends.record(reason);
        }
        tracing::debug!(linger_id = id, reason = ?reason, "re-registering linger");
        self.send_linger(state, id);
    }

    pub(super) fn linger_ack(&self, state: &mut State, id: LingerId, result: OpResult) {
        match result {
            Ok(outcome) => {
                let Some(linger) = state.lingers.get_mut(&id) else {
                    return;
                };
                if let Some(completion) = linger.on_reg_ack.take() {
                    state.deferred.push(completion.deferred(Ok(outcome)));
                }
            }
            Err(err) => self.linger_register_failed(state, id, err),
        }
    }

    pub(super) fn linger_commit(&self, state: &mut State, id: LingerId, result: OpResult) {
        match result {
            Ok(outcome) => {
                let Some(linger) = state.lingers.get_mut(&id) else {
                    return;
                };
                linger.registering = false;
                linger.registered = true;
                linger.register_tid = None;
                if let Some(completion) = linger.on_reg_commit.take() {
                    state.deferred.push(completion.deferred(Ok(outcome)));
                }
                state.awaiting_map_check.remove(&id);
                tracing::debug!(linger_id = id, "linger registration committed");
            }
            Err(err) => self.linger_register_failed(state, id, err),
        }
    }

    /// A first registration failing removes the linger; a failed
    /// re-registration leaves it registered until the next map or reset.
    fn linger_register_failed(&self, state: &mut State, id: LingerId, err: ObjecterError) {
        let Some(linger) = state.lingers.get_mut(&id) else {
            return;
        };
        // Ack and commit both carry the failure; the first one handles it.
        if !linger.registering {
            return;
        }
        linger.registering = false;
        linger.register_tid = None;
        let registered = linger.registered;
        state.awaiting_map_check.remove(&id);
        if registered {
            state.linger_reregister_failures += 1;
            tracing::warn!(linger_id = id, error = %err, "linger re-registration failed");
            return;
        }
        self.fail_linger(state, id, err);
    }

    /// Remove the linger from every table, cancelling its in-flight
    /// registration. Continuations on the returned record have not run.
    pub(super) fn detach_linger(&self, state: &mut State, id: LingerId) -> Option<LingerOp> {
        let mut linger = state.lingers.remove(&id)?;
        if let Some(node) = linger.session {
            state.sessions.detach_linger(node, id);
        }
        state.awaiting_map_check.remove(&id);
        state.check_latest_map_lingers.remove(&id);
        if let Some(tid) = linger.register_tid.take() {
            drop(self.finish_op(state, tid));
        }
        Some(linger)
    }

    /// Remove the linger and report `err` exactly once: to the pending
    /// registration continuations, or else to `on_error`.
    pub(super) fn fail_linger(&self, state: &mut State, id: LingerId, err: ObjecterError) {
        let Some(mut linger) = self.detach_linger(state, id) else {
            return;
        };
        tracing::info!(linger_id = id, error = %err, "linger failed");
        let mut reported = false;
        if let Some(completion) = linger.on_reg_ack.take() {
            state.deferred.push(completion.deferred(Err(err.clone())));
            reported = true;
        }
        if let Some(completion) = linger.on_reg_commit.take() {
            state.deferred.push(completion.deferred(Err(err.clone())));
            reported = true;
        }
        if !reported {
            if let Some(on_error) = linger.on_error.take() {
                state.deferred.push(Box::new(move || on_error(err)));
            }
        }
    }
}
