//! Per-destination session registry.
//!
//! A session records which ops and lingers are currently addressed to one
//! storage node. Membership is kept as id sets; the op and linger records
//! themselves live only in the router tables.

use std::collections::{BTreeMap, BTreeSet};

use super::types::{Epoch, LingerId, NodeId, Tid, Transport};

#[derive(Clone, Debug)]
pub(super) struct Session {
    pub(super) node: NodeId,
    pub(super) addr: String,
    /// Bumped every time the channel is re-established.
    pub(super) incarnation: u32,
    pub(super) ops: BTreeSet<Tid>,
    pub(super) lingers: BTreeSet<LingerId>,
    /// Highest map epoch any request on this session was sent under.
    pub(super) last_sent_epoch: Epoch,
}

impl Session {
    pub(super) fn is_idle(&self) -> bool {
        self.ops.is_empty() && self.lingers.is_empty()
    }
}

#[derive(Debug, Default)]
pub(super) struct SessionRegistry {
    sessions: BTreeMap<NodeId, Session>,
}

impl SessionRegistry {
    pub(super) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(super) fn get(&self, node: NodeId) -> Option<&Session> {
        self.sessions.get(&node)
    }

    pub(super) fn get_mut(&mut self, node: NodeId) -> Option<&mut Session> {
        self.sessions.get_mut(&node)
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub(super) fn nodes(&self) -> Vec<NodeId> {
        self.sessions.keys().copied().collect()
    }

    /// Session for `node`, connecting first if none exists yet.
    pub(super) fn open(
        &mut self,
        node: NodeId,
        addr: &str,
        transport: &dyn Transport,
    ) -> &mut Session {
        self.sessions.entry(node).or_insert_with(|| {
            if let Err(err) = transport.connect(node, addr) {
                tracing::warn!(error = ?err, node, addr, "session connect failed");
            } else {
                tracing::info!(node, addr, "session opened");
            }
            Session {
                node,
                addr: addr.to_string(),
                incarnation: 0,
                ops: BTreeSet::new(),
                lingers: BTreeSet::new(),
                last_sent_epoch: 0,
            }
        })
    }

    /// Re-establish the channel to `node` keeping its members.
    pub(super) fn reopen(&mut self, node: NodeId, addr: &str, transport: &dyn Transport) -> bool {
        let Some(session) = self.sessions.get_mut(&node) else {
            return false;
        };
        transport.disconnect(node);
        if let Err(err) = transport.connect(node, addr) {
            tracing::warn!(error = ?err, node, addr, "session reconnect failed");
        }
        session.addr = addr.to_string();
        session.incarnation = session.incarnation.wrapping_add(1);
        tracing::info!(node, addr, incarnation = session.incarnation, "session reopened");
        true
    }

    /// Tear down the session and hand back its former members.
    pub(super) fn close(&mut self, node: NodeId, transport: &dyn Transport) -> Option<Session> {
        let session = self.sessions.remove(&node)?;
        transport.disconnect(node);
        tracing::info!(
            node,
            ops = session.ops.len(),
            lingers = session.lingers.len(),
            "session closed"
        );
        Some(session)
    }

    pub(super) fn attach_op(&mut self, node: NodeId, tid: Tid) {
        if let Some(session) = self.sessions.get_mut(&node) {
            session.ops.insert(tid);
        }
    }

    pub(super) fn detach_op(&mut self, node: NodeId, tid: Tid) {
        if let Some(session) = self.sessions.get_mut(&node) {
            session.ops.remove(&tid);
        }
    }

    pub(super) fn attach_linger(&mut self, node: NodeId, id: LingerId) {
        if let Some(session) = self.sessions.get_mut(&node) {
            session.lingers.insert(id);
        }
    }

    pub(super) fn detach_linger(&mut self, node: NodeId, id: LingerId) {
        if let Some(session) = self.sessions.get_mut(&node) {
            session.lingers.remove(&id);
        }
    }

    /// Close every session with no members. Returns the closed nodes.
    pub(super) fn reap(&mut self, transport: &dyn Transport) -> Vec<NodeId> {
        let idle: Vec<NodeId> = self
            .sessions
            .values()
            .filter(|s| s.is_idle())
            .map(|s| s.node)
            .collect();
        for node in &idle {
            self.close(*node, transport);
        }
        idle
    }

    /// Close everything (shutdown).
    pub(super) fn close_all(&mut self, transport: &dyn Transport) {
        for node in self.nodes() {
            self.close(node, transport);
        }
    }
}
