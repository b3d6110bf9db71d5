//! Router configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::throttle::AdmissionMode;

/// Tunables for one `Objecter`. Unknown fields are rejected; missing ones take
/// their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObjecterConfig {
    /// Byte budget shared by all inflight ops. Zero disables the limit.
    pub max_inflight_bytes: u64,
    /// Op-count budget shared by all inflight ops. Zero disables the limit.
    pub max_inflight_ops: u64,
    /// Behaviour when the budget is exhausted, unless a request overrides it.
    pub admission: AdmissionMode,
    /// Hold writes while the cluster map carries the `full` flag.
    pub honor_full: bool,
    pub tick_interval_ms: u64,
    /// Ops unanswered for longer than this are reported laggy by `tick`.
    pub laggy_op_ms: u64,
    /// Pool, stat and statfs requests fail with `OpTimeout` after this long.
    pub admin_op_timeout_ms: Option<u64>,
    /// Stamped on every request so storage nodes can tell client restarts apart.
    pub client_incarnation: u32,
}

impl Default for ObjecterConfig {
    fn default() -> Self {
        Self {
            max_inflight_bytes: 100 * 1024 * 1024,
            max_inflight_ops: 1024,
            admission: AdmissionMode::Block,
            honor_full: true,
            tick_interval_ms: 5_000,
            laggy_op_ms: 10_000,
            admin_op_timeout_ms: None,
            client_incarnation: 0,
        }
    }
}

impl ObjecterConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("parse objecter config")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read objecter config {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn laggy_threshold(&self) -> Duration {
        Duration::from_millis(self.laggy_op_ms)
    }

    pub fn admin_op_timeout(&self) -> Option<Duration> {
        self.admin_op_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = ObjecterConfig::from_json("{}").expect("parse");
        assert_eq!(cfg, ObjecterConfig::default());
        assert_eq!(cfg.tick_interval(), Duration::from_secs(5));
        assert_eq!(cfg.admin_op_timeout(), None);
    }

    #[test]
    fn partial_document_overrides_fields() {
        let cfg = ObjecterConfig::from_json(
            r#"{"max_inflight_ops": 8, "admission": "reject", "admin_op_timeout_ms": 250}"#,
        )
        .expect("parse");
        assert_eq!(cfg.max_inflight_ops, 8);
        assert_eq!(cfg.admission, AdmissionMode::Reject);
        assert_eq!(cfg.admin_op_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(cfg.max_inflight_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn unknown_field_is_an_error() {
        let err = ObjecterConfig::from_json(r#"{"max_inflight": 1}"#).expect_err("typo");
        assert!(format!("{err:#}").contains("parse objecter config"));
    }
}
