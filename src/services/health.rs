//! Health reporting for process supervision (systemd/launchd)
//!
//! The daemon is healthy when its state directories are usable. A missing
//! data directory only degrades it, since datasets may be registered in
//! memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Overall daemon health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub active_runs: Vec<String>,
    pub algorithms: Vec<String>,
    pub components: Vec<ComponentHealth>,
}

impl HealthResponse {
    /// Worst component status wins
    pub fn from_components(
        started_at: DateTime<Utc>,
        active_runs: Vec<String>,
        algorithms: Vec<String>,
        components: Vec<ComponentHealth>,
    ) -> Self {
        let status = components
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, |overall, s| match (overall, s) {
                (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => {
                    HealthStatus::Unhealthy
                }
                (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => {
                    HealthStatus::Degraded
                }
                _ => HealthStatus::Healthy,
            });
        let uptime = (Utc::now() - started_at).num_seconds().max(0) as u64;

        Self {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            uptime_seconds: uptime,
            active_runs,
            algorithms,
            components,
        }
    }
}

/// A directory the daemon must be able to write into
pub fn check_writable_dir(name: &str, dir: &Path) -> ComponentHealth {
    let probe = dir.join(format!(".health-{}", uuid::Uuid::new_v4().simple()));
    let result = std::fs::create_dir_all(dir)
        .and_then(|_| std::fs::write(&probe, b"ok"))
        .and_then(|_| std::fs::remove_file(&probe));

    match result {
        Ok(()) => ComponentHealth {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            message: None,
        },
        Err(e) => ComponentHealth {
            name: name.to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(format!("{}: {}", dir.display(), e)),
        },
    }
}

/// A directory the daemon only reads from
pub fn check_readable_dir(name: &str, dir: &Path) -> ComponentHealth {
    if dir.is_dir() {
        ComponentHealth {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            message: None,
        }
    } else {
        ComponentHealth {
            name: name.to_string(),
            status: HealthStatus::Degraded,
            message: Some(format!("{} does not exist", dir.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_component_wins() {
        let healthy = ComponentHealth {
            name: "runs".to_string(),
            status: HealthStatus::Healthy,
            message: None,
        };
        let degraded = check_readable_dir("data", Path::new("/nonexistent/spiced-data"));
        assert_eq!(degraded.status, HealthStatus::Degraded);

        let report = HealthResponse::from_components(
            Utc::now(),
            vec![],
            vec!["random".to_string()],
            vec![healthy.clone(), degraded],
        );
        assert_eq!(report.status, HealthStatus::Degraded);

        let report = HealthResponse::from_components(Utc::now(), vec![], vec![], vec![healthy]);
        assert!(report.status.is_healthy());
    }

    #[test]
    fn test_writable_dir_probe() {
        let dir = std::env::temp_dir().join(format!("spiced-health-{}", uuid::Uuid::new_v4()));
        let health = check_writable_dir("runs", &dir);
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }
}
