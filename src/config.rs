use std::fs;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result, bail};
use serde::{Deserialize, Serialize};

/// Settings of the async [`Engine`](crate::runtime::engine::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the job channel between schedulers and workers.
    pub job_queue_capacity: usize,
    /// A worker gives up after this long without jobs; `None` waits forever.
    pub worker_idle_timeout_ms: Option<u64>,
    /// Multiplier applied to timer durations (tests run timers at a fraction of real time).
    pub timer_scale: f64,
    /// Keep ended instances queryable until `Engine::purge_finished`.
    pub retain_finished_instances: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            job_queue_capacity: 100,
            worker_idle_timeout_ms: None,
            timer_scale: 1.0,
            retain_finished_instances: true,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_file(file_path: &str) -> Result<Self> {
        let content = fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read engine config from {}", file_path))?;
        let config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse engine config from {}", file_path))?;
        config
            .validate()
            .with_context(|| format!("Invalid engine config in {}", file_path))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.timer_scale.is_finite() || self.timer_scale < 0.0 {
            bail!("timer_scale must be a finite number >= 0, got {}", self.timer_scale);
        }
        Ok(())
    }

    pub fn worker_idle_timeout(&self) -> Option<Duration> {
        self.worker_idle_timeout_ms.map(Duration::from_millis)
    }

    /// `due_in` times the timer scale. A scale that is not a positive number
    /// fires at once; a product too large for `Duration` saturates.
    pub fn scaled(&self, due_in: Duration) -> Duration {
        if self.timer_scale.is_nan() || self.timer_scale <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(due_in.as_secs_f64() * self.timer_scale).unwrap_or(Duration::MAX)
    }
}
