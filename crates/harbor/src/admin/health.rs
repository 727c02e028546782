//! Health checks reported by `GET /healthcheck`.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use common::protocol::{HealthCheckResult, HealthResponse};
use tracing::warn;

/// A named check of some dependency or invariant.
///
/// `Ok(None)` and `Ok(Some(message))` are healthy; an error is unhealthy and
/// its message is reported.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> anyhow::Result<Option<String>>;
}

/// Name of the built-in deadlock check.
pub const DEADLOCKS: &str = "deadlocks";

/// Reports threads that `parking_lot` has found deadlocked.
#[derive(Debug, Default)]
pub struct DeadlockHealthCheck;

#[async_trait]
impl HealthCheck for DeadlockHealthCheck {
    async fn check(&self) -> anyhow::Result<Option<String>> {
        let cycles = parking_lot::deadlock::check_deadlock();
        if cycles.is_empty() {
            return Ok(None);
        }
        let threads: Vec<String> = cycles
            .iter()
            .flatten()
            .map(|thread| format!("thread {:?}", thread.thread_id()))
            .collect();
        bail!(
            "{} deadlock cycle(s) involving {}",
            cycles.len(),
            threads.join(", ")
        )
    }
}

/// Run every check in name order.
pub async fn run_checks(checks: &BTreeMap<String, Arc<dyn HealthCheck>>) -> HealthResponse {
    let mut response = HealthResponse::default();
    for (name, check) in checks {
        let result = match check.check().await {
            Ok(None) => HealthCheckResult::healthy(),
            Ok(Some(message)) => HealthCheckResult::healthy_with(message),
            Err(e) => {
                warn!(check = %name, error = %format!("{e:#}"), "health check failed");
                HealthCheckResult::unhealthy(format!("{e:#}"))
            }
        };
        response.checks.insert(name.clone(), result);
    }
    response
}
