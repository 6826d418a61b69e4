use std::time::Duration;

use tokio::task::JoinHandle;

use crate::registry::JobRegistry;
use crate::settings::env_u64;

const DEFAULT_INTERVAL_SEC: u64 = 60;
const DEFAULT_MAX_AGE_MIN: u64 = 60;

/// Periodically kills jobs that outlived `max_age`, catching anything a
/// crashed request handler left behind.
#[derive(Clone, Debug)]
pub struct StaleSweeper {
    registry: JobRegistry,
    interval: Duration,
    max_age: Duration,
}

impl StaleSweeper {
    pub fn new(registry: JobRegistry, interval: Duration, max_age: Duration) -> Self {
        Self {
            registry,
            interval,
            max_age,
        }
    }

    pub fn from_env(registry: JobRegistry) -> Self {
        let interval = Duration::from_secs(
            env_u64("HERALD_SWEEP_INTERVAL_SEC")
                .map(|v| v.clamp(5, 3600))
                .unwrap_or(DEFAULT_INTERVAL_SEC),
        );
        let max_age = Duration::from_secs(
            60 * env_u64("HERALD_JOB_MAX_AGE_MIN")
                .map(|v| v.clamp(1, 7 * 24 * 60))
                .unwrap_or(DEFAULT_MAX_AGE_MIN),
        );
        Self::new(registry, interval, max_age)
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tracing::info!(
            interval_sec = self.interval.as_secs(),
            max_age_sec = self.max_age.as_secs(),
            "stale job sweeper started"
        );
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                self.tick().await;
            }
        })
    }

    pub async fn tick(&self) -> usize {
        let swept = self.registry.sweep_stale(self.max_age).await;
        if !swept.is_empty() {
            tracing::info!(count = swept.len(), "swept stale jobs");
        }
        swept.len()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use herald_job::{JobKind, OwnerId};
    use tokio::process::Command;

    use super::*;
    use crate::process::JobProcess;

    #[tokio::test]
    async fn tick_sweeps_only_old_jobs() {
        let registry = JobRegistry::default();
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "sleep 30"]);
        let p = JobProcess::spawn(&mut cmd).unwrap();
        registry
            .register(OwnerId::new("frank"), JobKind::Scrape, p, None)
            .await;

        let patient = StaleSweeper::new(
            registry.clone(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        assert_eq!(patient.tick().await, 0);
        assert_eq!(registry.len().await, 1);

        let strict = StaleSweeper::new(registry.clone(), Duration::from_secs(60), Duration::ZERO);
        assert_eq!(strict.tick().await, 1);
        assert!(registry.is_empty().await);
    }
}
