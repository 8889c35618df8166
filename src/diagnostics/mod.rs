//! Health and statistics reporting.
//!
//! Components implement [`DiagnosticProvider`] and register with a
//! [`DiagnosticsRegistry`]. Probes are graduated by [`DiagnosticDepth`]: `alive`
//! must stay cheap, `stats_deep` may scan catalogs.

mod registry;

#[cfg(test)]
mod registry_test;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

pub use registry::{DiagnosticsError, DiagnosticsRegistry, DiagnosticsSummary};

/// Cost tier of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticDepth {
    Alive,
    StatsTrack,
    StatsBasic,
    StatsDeep,
}

impl DiagnosticDepth {
    pub const ALL: [DiagnosticDepth; 4] = [
        DiagnosticDepth::Alive,
        DiagnosticDepth::StatsTrack,
        DiagnosticDepth::StatsBasic,
        DiagnosticDepth::StatsDeep,
    ];
}

impl fmt::Display for DiagnosticDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticDepth::Alive => write!(f, "alive"),
            DiagnosticDepth::StatsTrack => write!(f, "stats_track"),
            DiagnosticDepth::StatsBasic => write!(f, "stats_basic"),
            DiagnosticDepth::StatsDeep => write!(f, "stats_deep"),
        }
    }
}

impl FromStr for DiagnosticDepth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alive" => Ok(DiagnosticDepth::Alive),
            "stats_track" => Ok(DiagnosticDepth::StatsTrack),
            "stats_basic" => Ok(DiagnosticDepth::StatsBasic),
            "stats_deep" => Ok(DiagnosticDepth::StatsDeep),
            _ => Err(format!("Unknown diagnostic depth: {}", s)),
        }
    }
}

/// Probe output. Always carries `ok`; everything else is provider specific.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub ok: bool,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl DiagnosticReport {
    pub fn ok() -> Self {
        Self {
            ok: true,
            details: Map::new(),
        }
    }

    pub fn failed() -> Self {
        Self {
            ok: false,
            details: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.details.insert(key.into(), value);
    }
}

/// A fresh id operators can grep for in the server logs.
pub fn new_log_id() -> String {
    Uuid::new_v4().to_string()
}

/// Degraded value reported in place of a failed statistic.
pub fn failure_detail(log_id: &str) -> Value {
    json!({ "error": true, "logId": log_id })
}

/// A component able to report its own health.
#[async_trait]
pub trait DiagnosticProvider: Send + Sync {
    /// Unique name within a registry (e.g. `db`, `storage`).
    fn key(&self) -> String;

    /// When set, the registry samples `stats_track` at this period and logs it.
    fn poll_period(&self) -> Option<Duration> {
        None
    }

    /// Must never fail: errors are folded into the report.
    async fn get_diagnostics(&self, depth: DiagnosticDepth) -> DiagnosticReport;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_parses_and_displays() {
        for depth in DiagnosticDepth::ALL {
            let parsed: DiagnosticDepth = depth.to_string().parse().unwrap();
            assert_eq!(parsed, depth);
        }
        assert!("deepest".parse::<DiagnosticDepth>().is_err());
    }

    #[test]
    fn test_report_flattens_details() {
        let report = DiagnosticReport::ok().with("tables", json!(3));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json, json!({ "ok": true, "tables": 3 }));
    }

    #[test]
    fn test_failure_detail_shape() {
        let detail = failure_detail("abc");
        assert_eq!(detail, json!({ "error": true, "logId": "abc" }));
    }
}
