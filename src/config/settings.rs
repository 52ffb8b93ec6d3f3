use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable engine policy, read from `.rewind/settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Database target: `memory:` or a JSON file path relative to `.rewind/`.
    pub database: String,
    /// Worker sessions used when the caller does not ask for a number.
    pub default_sessions: usize,
    /// Lock attempts per relation before a rollback gives up.
    pub lock_attempts: u32,
    /// Backoff unit between lock attempts, multiplied by the attempt number.
    pub lock_backoff_ms: u64,
    /// A non-terminal request silent for longer than this is considered abandoned.
    pub stale_after_secs: u64,
    pub cost: CostSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database: "data.json".to_string(),
            default_sessions: 1,
            lock_attempts: 5,
            lock_backoff_ms: 50,
            stale_after_secs: 600,
            cost: CostSettings::default(),
        }
    }
}

impl EngineSettings {
    pub fn lock_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.lock_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostSettings {
    pub per_row_micros: u64,
    pub per_table_micros: u64,
    pub per_sequence_micros: u64,
    /// Extra per-row cost of a logged rollback, which captures its own changes.
    pub logged_row_overhead_micros: u64,
    /// Derive the per-row cost from completed rollbacks when there are any.
    pub calibrate_from_history: bool,
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            per_row_micros: 200,
            per_table_micros: 5_000,
            per_sequence_micros: 500,
            logged_row_overhead_micros: 50,
            calibrate_from_history: true,
        }
    }
}
