//! Compound object operations and request specs.
//!
//! An `ObjectOperation` is an ordered list of sub-ops applied atomically to
//! one object. Each sub-op may carry an output handler that receives its
//! result code and output buffer when the reply arrives.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::Serialize;

use super::completion::{Completion, OpOutcome};
use super::throttle::AdmissionMode;
use super::types::{ObjectId, ObjectLocator, OpFlags};

/// Handler run with a sub-op's result code and output data.
pub type SubOpHandler = Box<dyn FnOnce(i32, Bytes) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCode {
    Read,
    SparseRead,
    Stat,
    GetXattr,
    GetXattrs,
    CmpXattr,
    AssertVersion,
    Write,
    WriteFull,
    Append,
    Zero,
    Truncate,
    Delete,
    Create,
    SetXattr,
    RmXattr,
    Call,
    Watch,
    Notify,
    NotifyAck,
}

impl OpCode {
    pub fn is_write(self) -> bool {
        matches!(
            self,
            OpCode::Write
                | OpCode::WriteFull
                | OpCode::Append
                | OpCode::Zero
                | OpCode::Truncate
                | OpCode::Delete
                | OpCode::Create
                | OpCode::SetXattr
                | OpCode::RmXattr
                | OpCode::Call
                | OpCode::Watch
        )
    }

    fn is_data_read(self) -> bool {
        matches!(self, OpCode::Read | OpCode::SparseRead)
    }

    fn is_attr_read(self) -> bool {
        matches!(self, OpCode::GetXattr | OpCode::GetXattrs | OpCode::CmpXattr)
    }
}

/// One step of a compound operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubOp {
    pub code: OpCode,
    pub offset: u64,
    pub length: u64,
    /// Attribute name, or `class.method` for `Call`.
    pub name: Option<String>,
    /// Cookie for watch/notify; expected version for `AssertVersion`.
    pub arg: u64,
    pub indata: Bytes,
}

impl SubOp {
    fn new(code: OpCode) -> Self {
        Self {
            code,
            offset: 0,
            length: 0,
            name: None,
            arg: 0,
            indata: Bytes::new(),
        }
    }
}

/// Bytes a request is charged against the inflight budget.
///
/// Writes cost their payload, data reads the extent they ask for, attribute
/// reads the attribute name and value; everything else is free.
pub fn budget_cost(ops: &[SubOp]) -> u64 {
    ops.iter()
        .map(|op| {
            if op.code.is_write() {
                op.indata.len() as u64
            } else if op.code.is_data_read() {
                op.length
            } else if op.code.is_attr_read() {
                op.name.as_ref().map(|n| n.len() as u64).unwrap_or(0) + op.indata.len() as u64
            } else {
                0
            }
        })
        .sum()
}

/// Concatenation of every sub-op input buffer, in order.
pub(crate) fn combined_indata(ops: &[SubOp]) -> Bytes {
    let total = ops.iter().map(|op| op.indata.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for op in ops {
        buf.extend_from_slice(&op.indata);
    }
    buf.freeze()
}

/// Size and modification time returned by a `Stat` sub-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ObjectStat {
    pub size: u64,
    pub mtime_ms: u64,
}

impl ObjectStat {
    /// Big-endian `size | mtime_ms`.
    pub fn decode(data: Bytes) -> Option<Self> {
        let size = u64::from_be_bytes(data.get(0..8)?.try_into().ok()?);
        let mtime_ms = u64::from_be_bytes(data.get(8..16)?.try_into().ok()?);
        Some(Self { size, mtime_ms })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.size.to_be_bytes());
        out.extend_from_slice(&self.mtime_ms.to_be_bytes());
        Bytes::from(out)
    }
}

/// Builder for a compound operation on one object.
#[derive(Default)]
pub struct ObjectOperation {
    ops: Vec<SubOp>,
    handlers: Vec<Option<SubOpHandler>>,
}

impl ObjectOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[SubOp] {
        &self.ops
    }

    pub fn is_write(&self) -> bool {
        self.ops.iter().any(|op| op.code.is_write())
    }

    fn push(&mut self, op: SubOp, handler: Option<SubOpHandler>) -> &mut Self {
        self.ops.push(op);
        self.handlers.push(handler);
        self
    }

    fn data(code: OpCode, offset: u64, length: u64, indata: Bytes) -> SubOp {
        SubOp {
            offset,
            length,
            indata,
            ..SubOp::new(code)
        }
    }

    pub fn read(&mut self, offset: u64, length: u64) -> &mut Self {
        self.push(Self::data(OpCode::Read, offset, length, Bytes::new()), None)
    }

    pub fn read_with<F>(&mut self, offset: u64, length: u64, handler: F) -> &mut Self
    where
        F: FnOnce(i32, Bytes) + Send + 'static,
    {
        self.push(
            Self::data(OpCode::Read, offset, length, Bytes::new()),
            Some(Box::new(handler)),
        )
    }

    pub fn sparse_read(&mut self, offset: u64, length: u64) -> &mut Self {
        self.push(Self::data(OpCode::SparseRead, offset, length, Bytes::new()), None)
    }

    pub fn write(&mut self, offset: u64, data: Bytes) -> &mut Self {
        let len = data.len() as u64;
        self.push(Self::data(OpCode::Write, offset, len, data), None)
    }

    pub fn write_full(&mut self, data: Bytes) -> &mut Self {
        let len = data.len() as u64;
        self.push(Self::data(OpCode::WriteFull, 0, len, data), None)
    }

    pub fn append(&mut self, data: Bytes) -> &mut Self {
        let len = data.len() as u64;
        self.push(Self::data(OpCode::Append, 0, len, data), None)
    }

    pub fn zero(&mut self, offset: u64, length: u64) -> &mut Self {
        self.push(Self::data(OpCode::Zero, offset, length, Bytes::new()), None)
    }

    pub fn truncate(&mut self, offset: u64) -> &mut Self {
        self.push(Self::data(OpCode::Truncate, offset, 0, Bytes::new()), None)
    }

    pub fn remove(&mut self) -> &mut Self {
        self.push(SubOp::new(OpCode::Delete), None)
    }

    pub fn create(&mut self, exclusive: bool) -> &mut Self {
        let op = SubOp {
            arg: u64::from(exclusive),
            ..SubOp::new(OpCode::Create)
        };
        self.push(op, None)
    }

    /// Stat the object; the handler gets the decoded size and mtime, or the
    /// negative result code.
    pub fn stat<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnOnce(Result<ObjectStat, i32>) + Send + 'static,
    {
        let handler: SubOpHandler = Box::new(move |rval, data| {
            if rval < 0 {
                handler(Err(rval));
                return;
            }
            match ObjectStat::decode(data) {
                Some(stat) => handler(Ok(stat)),
                None => handler(Err(-5)),
            }
        });
        self.push(SubOp::new(OpCode::Stat), Some(handler))
    }

    pub fn getxattr<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: FnOnce(i32, Bytes) + Send + 'static,
    {
        let op = SubOp {
            name: Some(name.to_string()),
            ..SubOp::new(OpCode::GetXattr)
        };
        self.push(op, Some(Box::new(handler)))
    }

    pub fn setxattr(&mut self, name: &str, value: Bytes) -> &mut Self {
        let op = SubOp {
            name: Some(name.to_string()),
            length: value.len() as u64,
            indata: value,
            ..SubOp::new(OpCode::SetXattr)
        };
        self.push(op, None)
    }

    pub fn rmxattr(&mut self, name: &str) -> &mut Self {
        let op = SubOp {
            name: Some(name.to_string()),
            ..SubOp::new(OpCode::RmXattr)
        };
        self.push(op, None)
    }

    /// Invoke a storage-side object class method.
    pub fn call(&mut self, class: &str, method: &str, input: Bytes) -> &mut Self {
        let op = SubOp {
            name: Some(format!("{class}.{method}")),
            length: input.len() as u64,
            indata: input,
            ..SubOp::new(OpCode::Call)
        };
        self.push(op, None)
    }

    /// Register (`register = true`) or drop a watch identified by `cookie`.
    pub fn watch(&mut self, cookie: u64, version: u64, register: bool) -> &mut Self {
        let op = SubOp {
            arg: cookie,
            offset: version,
            length: u64::from(register),
            ..SubOp::new(OpCode::Watch)
        };
        self.push(op, None)
    }

    pub fn notify(&mut self, cookie: u64, version: u64, payload: Bytes) -> &mut Self {
        let op = SubOp {
            arg: cookie,
            offset: version,
            length: payload.len() as u64,
            indata: payload,
            ..SubOp::new(OpCode::Notify)
        };
        self.push(op, None)
    }

    pub fn notify_ack(&mut self, notify_id: u64, version: u64) -> &mut Self {
        let op = SubOp {
            arg: notify_id,
            offset: version,
            ..SubOp::new(OpCode::NotifyAck)
        };
        self.push(op, None)
    }

    pub fn assert_version(&mut self, version: u64) -> &mut Self {
        let op = SubOp {
            arg: version,
            ..SubOp::new(OpCode::AssertVersion)
        };
        self.push(op, None)
    }

    pub(crate) fn into_parts(self) -> (Vec<SubOp>, Vec<Option<SubOpHandler>>) {
        (self.ops, self.handlers)
    }
}

/// Everything needed to submit one object request.
pub struct OpSpec {
    pub oid: ObjectId,
    pub locator: ObjectLocator,
    pub operation: ObjectOperation,
    pub flags: OpFlags,
    pub priority: i32,
    /// Resend after transport resets; when false a reset fails the request.
    pub should_resend: bool,
    pub on_ack: Option<Completion<OpOutcome>>,
    pub on_commit: Option<Completion<OpOutcome>>,
    /// Overrides the configured admission mode.
    pub admission: Option<AdmissionMode>,
    /// Fail with `MapTimeout` if no map places the request within this long.
    pub map_timeout: Option<Duration>,
}

impl OpSpec {
    fn new(oid: ObjectId, locator: ObjectLocator, operation: ObjectOperation, flags: u32) -> Self {
        let locator = locator.normalized(&oid);
        Self {
            oid,
            locator,
            operation,
            flags: OpFlags::from_bits(flags),
            priority: 0,
            should_resend: true,
            on_ack: None,
            on_commit: None,
            admission: None,
            map_timeout: None,
        }
    }

    pub fn read(oid: impl Into<ObjectId>, locator: ObjectLocator, operation: ObjectOperation) -> Self {
        Self::new(oid.into(), locator, operation, OpFlags::READ)
    }

    pub fn mutate(
        oid: impl Into<ObjectId>,
        locator: ObjectLocator,
        operation: ObjectOperation,
    ) -> Self {
        Self::new(oid.into(), locator, operation, OpFlags::WRITE)
    }

    pub fn is_write(&self) -> bool {
        self.flags.is_write() || self.operation.is_write()
    }

    pub fn on_ack(mut self, completion: Completion<OpOutcome>) -> Self {
        self.on_ack = Some(completion);
        self
    }

    pub fn on_commit(mut self, completion: Completion<OpOutcome>) -> Self {
        self.on_commit = Some(completion);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn flags(mut self, bits: u32) -> Self {
        self.flags.insert(bits);
        self
    }

    pub fn balance_reads(self) -> Self {
        self.flags(OpFlags::BALANCE_READS)
    }

    pub fn no_resend(mut self) -> Self {
        self.should_resend = false;
        self
    }

    pub fn admission(mut self, mode: AdmissionMode) -> Self {
        self.admission = Some(mode);
        self
    }

    pub fn map_timeout(mut self, timeout: Duration) -> Self {
        self.map_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn budget_cost_follows_sub_op_mode() {
        let mut op = ObjectOperation::new();
        op.write(0, Bytes::from_static(b"0123456789"))
            .read(0, 4096)
            .getxattr("owner", |_, _| {})
            .stat(|_| {})
            .remove();
        assert_eq!(budget_cost(op.ops()), 10 + 4096 + 5);
    }

    #[test]
    fn combined_indata_concatenates_in_order() {
        let mut op = ObjectOperation::new();
        op.write(0, Bytes::from_static(b"ab"))
            .setxattr("k", Bytes::from_static(b"cd"))
            .append(Bytes::from_static(b"ef"));
        assert_eq!(combined_indata(op.ops()), Bytes::from_static(b"abcdef"));
        assert!(op.is_write());
    }

    #[test]
    fn stat_handler_decodes_payload() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let mut op = ObjectOperation::new();
        op.stat(move |r| *sink.lock().unwrap() = Some(r));
        let (_, mut handlers) = op.into_parts();
        let handler = handlers[0].take().expect("stat installs a handler");
        let stat = ObjectStat {
            size: 42,
            mtime_ms: 1_700_000,
        };
        handler(0, stat.encode());
        assert_eq!(*seen.lock().unwrap(), Some(Ok(stat)));
    }

    #[test]
    fn stat_handler_reports_short_payload() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let mut op = ObjectOperation::new();
        op.stat(move |r| *sink.lock().unwrap() = Some(r));
        let (_, mut handlers) = op.into_parts();
        (handlers[0].take().expect("handler"))(0, Bytes::from_static(b"short"));
        assert_eq!(*seen.lock().unwrap(), Some(Err(-5)));
    }

    #[test]
    fn spec_normalizes_redundant_locator_key() {
        let spec = OpSpec::read("obj", ObjectLocator::with_key(2, "obj"), ObjectOperation::new());
        assert_eq!(spec.locator.key, None);
        assert!(!spec.is_write());
        assert!(spec.should_resend);
    }
}
