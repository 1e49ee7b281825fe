//! Configuration for the module bridge.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Entry point name the transform wrapper calls
pub const ENTRY_TRANSFORM: &str = "transform";

/// Entry point name the self-test wrapper calls
pub const ENTRY_SELF_TEST: &str = "selfTest";

/// Configuration for a bridge instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Entry points the module must register before the bridge reports ready.
    ///
    /// This set is fixed host-side knowledge, never derived from the module.
    pub required_entry_points: Vec<String>,

    /// Pause between readiness polls in milliseconds
    pub poll_interval_ms: u64,

    /// Maximum number of readiness polls before giving up
    pub poll_attempts: u32,

    /// Maximum module memory in bytes (default = 256MB)
    pub max_memory: usize,

    /// Enable fuel-based execution limiting
    pub fuel_limit: Option<u64>,

    /// Cranelift optimization level (0-3)
    pub optimization_level: u8,

    /// Export name of the module's entry routine
    pub entry_export: String,

    /// Export name of the module's call dispatcher
    pub dispatch_export: String,

    /// Export name of the module's allocator
    pub alloc_export: String,

    /// Export name of the module's scheduler re-entry point (optional export)
    pub resume_export: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            required_entry_points: vec![ENTRY_TRANSFORM.to_string(), ENTRY_SELF_TEST.to_string()],
            poll_interval_ms: 200,
            poll_attempts: 50, // ~10 seconds total
            max_memory: 256 * 1024 * 1024, // 256 MB
            fuel_limit: None,
            optimization_level: 2,
            entry_export: "_start".to_string(),
            dispatch_export: "invoke".to_string(),
            alloc_export: "malloc".to_string(),
            resume_export: "resume".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Create config for development/debugging
    pub fn development() -> Self {
        Self {
            optimization_level: 0, // Faster compilation
            ..Default::default()
        }
    }

    /// Builder: replace the required entry point set
    pub fn required_entry_points<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_entry_points = names.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: add one required entry point
    pub fn required_entry_point(mut self, name: impl Into<String>) -> Self {
        self.required_entry_points.push(name.into());
        self
    }

    /// Builder: set the readiness poll interval in milliseconds
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Builder: set the readiness poll attempt budget
    pub fn poll_attempts(mut self, attempts: u32) -> Self {
        self.poll_attempts = attempts.max(1);
        self
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set fuel limit
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(3);
        self
    }

    /// Readiness poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
