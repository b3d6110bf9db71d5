//! Inflight admission budget.
//!
//! Two counters (bytes and op count) debited when a request enters the op
//! table and credited when it leaves. The counters live inside the router
//! state and are only touched under its lock; blocked submitters wait on a
//! `Notify` owned by the engine.

use serde::{Deserialize, Serialize};

/// What a submitter does when the budget has no headroom.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Suspend until replies free enough budget.
    #[default]
    Block,
    /// Fail immediately with `BudgetExceeded`.
    Reject,
}

/// One bounded counter. A `max` of zero disables the limit.
#[derive(Clone, Debug)]
pub(crate) struct Throttle {
    name: &'static str,
    max: u64,
    current: u64,
}

impl Throttle {
    pub(crate) fn new(name: &'static str, max: u64) -> Self {
        Self {
            name,
            max,
            current: 0,
        }
    }

    /// Cost actually charged. Oversized requests are charged the whole
    /// budget so they can pass once everything else has drained.
    pub(crate) fn clamp(&self, cost: u64) -> u64 {
        if self.max == 0 {
            cost
        } else {
            cost.min(self.max)
        }
    }

    pub(crate) fn has_room(&self, cost: u64) -> bool {
        self.max == 0 || self.current.saturating_add(self.clamp(cost)) <= self.max
    }

    pub(crate) fn take(&mut self, cost: u64) {
        self.current = self.current.saturating_add(self.clamp(cost));
    }

    pub(crate) fn put(&mut self, cost: u64) {
        let cost = self.clamp(cost);
        debug_assert!(
            self.current >= cost,
            "{} throttle underflow: current={} put={}",
            self.name,
            self.current,
            cost
        );
        self.current = self.current.saturating_sub(cost);
    }

    pub(crate) fn current(&self) -> u64 {
        self.current
    }
}

/// Byte and op-count throttles debited together.
#[derive(Clone, Debug)]
pub(crate) struct Budget {
    bytes: Throttle,
    ops: Throttle,
}

impl Budget {
    pub(crate) fn new(max_bytes: u64, max_ops: u64) -> Self {
        Self {
            bytes: Throttle::new("inflight_bytes", max_bytes),
            ops: Throttle::new("inflight_ops", max_ops),
        }
    }

    /// Debit `cost` bytes and one op if both counters have room.
    pub(crate) fn try_take(&mut self, cost: u64) -> bool {
        if !self.bytes.has_room(cost) || !self.ops.has_room(1) {
            return false;
        }
        self.bytes.take(cost);
        self.ops.take(1);
        true
    }

    pub(crate) fn put(&mut self, cost: u64) {
        self.bytes.put(cost);
        self.ops.put(1);
    }

    /// Outstanding (bytes, ops).
    pub(crate) fn in_use(&self) -> (u64, u64) {
        (self.bytes.current(), self.ops.current())
    }
}
