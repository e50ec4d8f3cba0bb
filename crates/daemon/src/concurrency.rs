//! Concurrency planning for the stream checker
//!
//! Derives the global probe ceiling and channel parallelism from CPU core
//! count and configuration, and defines the backoff used while waiting for
//! an admission slot.

use crate::config::Config;
use std::time::Duration;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum probes in flight across the whole system
    pub global_ceiling: u32,
    /// Maximum channels checked at the same time
    pub max_active_channels: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Explicit non-zero `global_ceiling` is used unchanged
    /// - Otherwise one probe per core, clamped to [2, 16]
    /// - Explicit non-zero `max_active_channels` is used unchanged,
    ///   otherwise it follows the global ceiling
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let global_ceiling = if cfg.admission.global_ceiling > 0 {
            cfg.admission.global_ceiling
        } else {
            derive_global_ceiling(total_cores)
        };

        let max_active_channels = if cfg.pipeline.max_active_channels > 0 {
            cfg.pipeline.max_active_channels
        } else {
            global_ceiling
        };

        Self {
            total_cores,
            global_ceiling,
            max_active_channels,
        }
    }
}

/// One probe subprocess per core, within sane bounds
fn derive_global_ceiling(cores: u32) -> u32 {
    cores.clamp(2, 16)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

/// Exponential backoff between admission attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the second attempt
    pub initial: Duration,
    /// Cap for exponential growth
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Backoff delay for the given retry attempt (0-indexed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = delay.min(self.max.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max
        }
    }
}
