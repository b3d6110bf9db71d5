//! Object router module wiring.
//!
//! `engine` owns the router and its dispatch entry points, `state` holds the
//! op/linger/admin tables behind the router lock, `placement` and `session`
//! compute targets and track per-node membership, `linger` and `admin` extend
//! the engine with watch registrations and leader-directed requests, and
//! `types` defines the shared messages and collaborator traits.

mod admin;
mod completion;
mod config;
mod engine;
mod error;
mod linger;
mod operation;
mod placement;
mod session;
mod state;
mod throttle;
mod types;

pub use completion::{Completion, OpOutcome, OpResult};
pub use config::ObjecterConfig;
pub use engine::{ObjecterStats, Objecter, OpInfo, SessionInfo, TickReport};
pub use error::ObjecterError;
pub use linger::{LingerInfo, LingerSpec};
pub use operation::{budget_cost, ObjectOperation, ObjectStat, OpCode, OpSpec, SubOp, SubOpHandler};
pub use placement::MapPlacement;
pub use state::{LingerErrorHandler, ResendReason};
pub use throttle::AdmissionMode;
pub use types::{
    AdminRequest, ClusterMap, ClusterStatfs, Epoch, LingerId, MapFlags, NodeId, NodeInfo,
    ObjectId, ObjectLocator, OpFlags, OpReply, OpRequest, Placement, PlacementResolver, PoolDesc,
    PoolId, PoolNotFound, PoolOpKind, PoolOpReply, PoolStat, PoolStatReply, ReplyFlags, ShardId,
    StatfsReply, SubOpOutput, Tid, Transport, RESULT_AGAIN,
};
