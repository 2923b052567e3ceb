//! Health reporting
//!
//! Liveness probes are owned by the caller; this module only gathers component
//! checks into a [`HealthReport`].

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::db::Database;
use crate::repositories::DeadLetterRepository;
use crate::workflow::WorkflowEngine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Operational, but something needs attention
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// Result of checking one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub response_time_ms: u64,
}

impl ComponentHealth {
    fn new(name: &str, status: HealthStatus, message: Option<String>, started: Instant) -> Self {
        Self {
            name: name.to_string(),
            status,
            message,
            response_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Overall health with per-component detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status among the checks
    pub status: HealthStatus,
    pub checks: Vec<ComponentHealth>,
    /// Unix epoch milliseconds
    pub checked_at: i64,
}

impl HealthReport {
    pub fn new(checks: Vec<ComponentHealth>) -> Self {
        let status = if checks.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if checks.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            checks,
            checked_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn check(&self, name: &str) -> Option<&ComponentHealth> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Collects component checks
pub struct HealthChecker;

impl HealthChecker {
    pub async fn check_database(db: &Database) -> ComponentHealth {
        let started = Instant::now();
        match db.health_check().await {
            Ok(()) => ComponentHealth::new("database", HealthStatus::Healthy, None, started),
            Err(e) => ComponentHealth::new(
                "database",
                HealthStatus::Unhealthy,
                Some(e.to_string()),
                started,
            ),
        }
    }

    pub async fn check_checkpoint_store(engine: &WorkflowEngine) -> ComponentHealth {
        let started = Instant::now();
        if engine.checkpoint_store_healthy().await {
            ComponentHealth::new("checkpoint_store", HealthStatus::Healthy, None, started)
        } else {
            ComponentHealth::new(
                "checkpoint_store",
                HealthStatus::Unhealthy,
                Some("checkpoint store unreachable".to_string()),
                started,
            )
        }
    }

    /// An open circuit degrades, it does not take the system down
    pub fn check_circuit(breaker: &CircuitBreaker) -> ComponentHealth {
        let started = Instant::now();
        let snapshot = breaker.snapshot();
        let name = format!("circuit:{}", breaker.name());
        let status = match snapshot.state {
            CircuitState::Closed => HealthStatus::Healthy,
            CircuitState::HalfOpen | CircuitState::Open => HealthStatus::Degraded,
        };
        ComponentHealth::new(&name, status, Some(snapshot.state.as_str().to_string()), started)
    }

    /// Unresolved dead letters need an operator
    pub async fn check_dead_letters(dead_letters: &DeadLetterRepository) -> ComponentHealth {
        let started = Instant::now();
        match dead_letters.list(None, true).await {
            Ok(open) if open.is_empty() => {
                ComponentHealth::new("dead_letters", HealthStatus::Healthy, None, started)
            }
            Ok(open) => ComponentHealth::new(
                "dead_letters",
                HealthStatus::Degraded,
                Some(format!("{} unresolved", open.len())),
                started,
            ),
            Err(e) => ComponentHealth::new(
                "dead_letters",
                HealthStatus::Unhealthy,
                Some(e.to_string()),
                started,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;

    fn component(status: HealthStatus) -> ComponentHealth {
        ComponentHealth::new("c", status, None, Instant::now())
    }

    #[test]
    fn test_report_takes_worst_status() {
        let report = HealthReport::new(vec![component(HealthStatus::Healthy)]);
        assert_eq!(report.status, HealthStatus::Healthy);

        let report = HealthReport::new(vec![
            component(HealthStatus::Healthy),
            component(HealthStatus::Degraded),
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);

        let report = HealthReport::new(vec![
            component(HealthStatus::Degraded),
            component(HealthStatus::Unhealthy),
        ]);
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_database_and_circuit_checks() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(
            HealthChecker::check_database(&db).await.status,
            HealthStatus::Healthy
        );

        let breaker = CircuitBreaker::new("video", CircuitBreakerConfig::default());
        let check = HealthChecker::check_circuit(&breaker);
        assert_eq!(check.name, "circuit:video");
        assert_eq!(check.status, HealthStatus::Healthy);
    }
}
