//! Engine configuration

use serde::{Deserialize, Serialize};

/// Registration limits for the engine.
///
/// Hosts can embed this in their own configuration; every field has a
/// default so a partial table deserializes cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Smallest accepted time limit for any observer, in milliseconds.
    #[serde(default = "default_min_time_limit_ms")]
    pub min_time_limit_ms: u64,

    /// Cap on registered observers per requesting uid. Applied separately
    /// to app-limit and session-limit observers.
    #[serde(default = "default_max_observers_per_uid")]
    pub max_observers_per_uid: usize,
}

fn default_min_time_limit_ms() -> u64 {
    60_000
}

fn default_max_observers_per_uid() -> usize {
    1_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_time_limit_ms: default_min_time_limit_ms(),
            max_observers_per_uid: default_max_observers_per_uid(),
        }
    }
}
