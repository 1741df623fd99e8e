//! Orchestrator configuration
//!
//! Defines the listen address, the background loop intervals, checkpointing
//! and which job executor backs the engine.

use std::path::PathBuf;
use std::time::Duration;

/// Longest scheduler period that still observes every minute
const MAX_SCHEDULER_INTERVAL: Duration = Duration::from_secs(60);

/// Which executor the engine submits jobs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorKind {
    /// In-process executor that completes jobs after a fixed delay
    Simulated,
    /// Kubernetes batch jobs driven through `kubectl`
    Kubectl,
}

impl std::str::FromStr for ExecutorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" => Ok(ExecutorKind::Simulated),
            "kubectl" | "kubernetes" => Ok(ExecutorKind::Kubectl),
            other => anyhow::bail!("unknown executor '{}' (expected simulated or kubectl)", other),
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on
    pub bind_addr: String,

    /// File the store is checkpointed to; no checkpointing when unset
    pub checkpoint_file: Option<PathBuf>,

    /// How often the store is written to the checkpoint file
    pub checkpoint_interval: Duration,

    /// How often running jobs are polled for status
    pub poll_interval: Duration,

    /// How often schedules are checked against the clock
    pub scheduler_interval: Duration,

    pub executor: ExecutorKind,

    /// Binary invoked by the kubectl executor
    pub kubectl: String,

    /// Run time of every job under the simulated executor
    pub simulated_job_duration: Duration,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - CONDUIT_BIND_ADDR (default: 0.0.0.0:8080)
    /// - CONDUIT_CHECKPOINT_FILE (default: unset)
    /// - CONDUIT_CHECKPOINT_INTERVAL (seconds, default: 60)
    /// - CONDUIT_POLL_INTERVAL (seconds, default: 10)
    /// - CONDUIT_SCHEDULER_INTERVAL (seconds, default: 60)
    /// - CONDUIT_EXECUTOR (simulated | kubectl, default: simulated)
    /// - CONDUIT_KUBECTL (default: kubectl)
    /// - CONDUIT_SIMULATED_JOB_SECONDS (default: 5)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let bind_addr = std::env::var("CONDUIT_BIND_ADDR").unwrap_or(defaults.bind_addr);

        let checkpoint_file = std::env::var("CONDUIT_CHECKPOINT_FILE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let checkpoint_interval = seconds_var("CONDUIT_CHECKPOINT_INTERVAL")
            .unwrap_or(defaults.checkpoint_interval);

        let poll_interval =
            seconds_var("CONDUIT_POLL_INTERVAL").unwrap_or(defaults.poll_interval);

        let scheduler_interval =
            seconds_var("CONDUIT_SCHEDULER_INTERVAL").unwrap_or(defaults.scheduler_interval);

        let executor = match std::env::var("CONDUIT_EXECUTOR") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.executor,
        };

        let kubectl = std::env::var("CONDUIT_KUBECTL").unwrap_or(defaults.kubectl);

        let simulated_job_duration = seconds_var("CONDUIT_SIMULATED_JOB_SECONDS")
            .unwrap_or(defaults.simulated_job_duration);

        Ok(Self {
            bind_addr,
            checkpoint_file,
            checkpoint_interval,
            poll_interval,
            scheduler_interval,
            executor,
            kubectl,
            simulated_job_duration,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.checkpoint_interval.is_zero() {
            anyhow::bail!("checkpoint_interval must be greater than 0");
        }

        if self.scheduler_interval.is_zero() || self.scheduler_interval > MAX_SCHEDULER_INTERVAL {
            anyhow::bail!("scheduler_interval must be between 1 and 60 seconds");
        }

        if self.executor == ExecutorKind::Kubectl && self.kubectl.trim().is_empty() {
            anyhow::bail!("kubectl binary cannot be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            checkpoint_file: None,
            checkpoint_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(10),
            scheduler_interval: MAX_SCHEDULER_INTERVAL,
            executor: ExecutorKind::Simulated,
            kubectl: "kubectl".to_string(),
            simulated_job_duration: Duration::from_secs(5),
        }
    }
}

fn seconds_var(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.scheduler_interval, Duration::from_secs(60));
        assert_eq!(config.executor, ExecutorKind::Simulated);
        assert!(config.checkpoint_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.poll_interval = Duration::from_secs(1);

        // A slower scheduler could skip whole minutes
        config.scheduler_interval = Duration::from_secs(61);
        assert!(config.validate().is_err());
        config.scheduler_interval = Duration::from_secs(15);
        assert!(config.validate().is_ok());

        config.executor = ExecutorKind::Kubectl;
        config.kubectl = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_executor_kind_parse() {
        assert_eq!("kubectl".parse::<ExecutorKind>().unwrap(), ExecutorKind::Kubectl);
        assert_eq!(" Simulated ".parse::<ExecutorKind>().unwrap(), ExecutorKind::Simulated);
        assert!("docker".parse::<ExecutorKind>().is_err());
    }
}
