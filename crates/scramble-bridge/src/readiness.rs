//! Readiness handshake between the host and a starting module.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::registry::EntryPointRegistry;

/// Lifecycle of a bridge instance as seen by callers.
///
/// This is a property of the bridge, not of the module: a module may be
/// running happily while the bridge still waits for it to register the entry
/// points the application needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadinessState {
    /// Image is being fetched and instantiated
    Loading,
    /// Module is running but has not registered every required entry point
    WaitingForEntryPoints,
    /// All required entry points are registered; calls are allowed
    Ready,
    /// Terminal failure; this instance will never serve calls
    Failed(String),
}

impl ReadinessState {
    /// Whether calls are allowed.
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessState::Ready)
    }

    /// Whether the state is terminal.
    pub fn is_failed(&self) -> bool {
        matches!(self, ReadinessState::Failed(_))
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessState::Loading => write!(f, "loading"),
            ReadinessState::WaitingForEntryPoints => write!(f, "waiting for entry points"),
            ReadinessState::Ready => write!(f, "ready"),
            ReadinessState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Polls the entry point registry until the required set is present.
///
/// The module registers entry points asynchronously after startup, so the
/// host cannot tell at instantiation time whether it got a compatible
/// module. The gate checks the registry up to `attempts` times with
/// `interval` between consecutive checks; the first check is immediate.
/// Sleeping is cooperative, other host work proceeds between checks.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    required: Vec<String>,
    interval: Duration,
    attempts: u32,
}

impl ReadinessGate {
    /// Gate for a required entry point set and polling budget.
    pub fn new(required: Vec<String>, interval: Duration, attempts: u32) -> Self {
        Self {
            required,
            interval,
            attempts,
        }
    }

    /// Gate configured from a bridge config.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.required_entry_points.clone(),
            config.poll_interval(),
            config.poll_attempts,
        )
    }

    /// Wait until every required name is registered.
    ///
    /// Returns the number of checks performed. Fails with `ReadyTimeout`
    /// carrying the still-missing names once the attempt budget is spent.
    pub async fn wait(&self, registry: &EntryPointRegistry) -> Result<u32> {
        let mut missing = self.required.clone();
        for attempt in 1..=self.attempts {
            missing = registry.missing(&self.required);
            if missing.is_empty() {
                tracing::debug!(attempt, "all required entry points registered");
                return Ok(attempt);
            }
            tracing::debug!(
                attempt,
                max_attempts = self.attempts,
                ?missing,
                "waiting for entry point registration"
            );
            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        Err(BridgeError::ReadyTimeout {
            missing,
            attempts: self.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EntryToken;
    use std::sync::Arc;

    fn required() -> Vec<String> {
        vec!["transform".to_string(), "selfTest".to_string()]
    }

    #[tokio::test]
    async fn ready_on_first_check_when_already_registered() {
        let registry = EntryPointRegistry::new();
        registry.register("transform", EntryToken(1));
        registry.register("selfTest", EntryToken(2));

        let gate = ReadinessGate::new(required(), Duration::from_millis(200), 50);
        let attempts = gate.wait(&registry).await.expect("gate");
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_when_registration_arrives_mid_budget() {
        let registry = Arc::new(EntryPointRegistry::new());
        let writer = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            writer.register("transform", EntryToken(1));
            writer.register("selfTest", EntryToken(2));
        });

        let gate = ReadinessGate::new(required(), Duration::from_millis(200), 50);
        let attempts = gate.wait(&registry).await.expect("gate");
        // checks at 0ms, 200ms, 400ms, 600ms; registration lands at 500ms
        assert_eq!(attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_spends_exactly_the_budget() {
        let registry = EntryPointRegistry::new();
        let gate = ReadinessGate::new(required(), Duration::from_millis(200), 50);

        let start = tokio::time::Instant::now();
        let err = gate.wait(&registry).await.unwrap_err();
        let elapsed = start.elapsed();

        // 50 checks with 49 sleeps between them
        assert_eq!(elapsed, Duration::from_millis(9800));
        match err {
            BridgeError::ReadyTimeout { missing, attempts } => {
                assert_eq!(attempts, 50);
                assert_eq!(missing, required());
            }
            other => panic!("expected ReadyTimeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_only_missing_names() {
        let registry = EntryPointRegistry::new();
        registry.register("selfTest", EntryToken(2));

        let gate = ReadinessGate::new(required(), Duration::from_millis(10), 3);
        let err = gate.wait(&registry).await.unwrap_err();
        match err {
            BridgeError::ReadyTimeout { missing, attempts } => {
                assert_eq!(attempts, 3);
                assert_eq!(missing, vec!["transform".to_string()]);
            }
            other => panic!("expected ReadyTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_required_set_is_immediately_ready() {
        let registry = EntryPointRegistry::new();
        let gate = ReadinessGate::new(Vec::new(), Duration::from_millis(200), 50);
        assert_eq!(gate.wait(&registry).await.expect("gate"), 1);
    }
}
