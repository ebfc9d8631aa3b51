//! Liveness/readiness aggregation: named pass/fail checks plus an explicit
//! ready flag, consumed by the gateway's `/health` and `/ready` handlers.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Fail,
}

/// Latest result for a named probe. Re-registration overwrites; no history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct HealthRegistry {
    started_at: Instant,
    ready: RwLock<bool>,
    checks: RwLock<HashMap<String, CheckResult>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            ready: RwLock::new(false),
            checks: RwLock::new(HashMap::new()),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn set_ready(&self, ready: bool) {
        *self.ready.write() = ready;
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.read()
    }

    /// Run `probe` synchronously and store its result under `name`,
    /// overwriting any prior result for that name.
    pub fn register_check<F>(&self, name: &str, probe: F)
    where
        F: FnOnce() -> (bool, String),
    {
        let (ok, message) = probe();
        let result = CheckResult {
            name: name.to_string(),
            status: if ok { CheckStatus::Ok } else { CheckStatus::Fail },
            message,
            timestamp: Utc::now(),
        };
        self.checks.write().insert(name.to_string(), result);
    }

    /// Copy of the current check map — callers never see the live map.
    pub fn checks_snapshot(&self) -> HashMap<String, CheckResult> {
        self.checks.read().clone()
    }

    pub fn all_passing(&self) -> bool {
        self.checks
            .read()
            .values()
            .all(|c| c.status == CheckStatus::Ok)
    }
}
