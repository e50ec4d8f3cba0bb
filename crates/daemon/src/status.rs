//! Status module for the stream checker
//!
//! Aggregates queue, admission, pipeline and system state into a single
//! snapshot that can be polled without side effects.

use crate::admission::{AdmissionError, AdmissionStatus};
use crate::pipeline::{Pipeline, PipelineStatus};
use crate::queue::QueueStatus;
use crate::state::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete status snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub queue: QueueStatus,
    pub admission: AdmissionStatus,
    pub pipeline: PipelineStatus,
    pub system: SystemMetrics,
}

/// System metrics refreshed by a background task
pub type SharedSystemMetrics = Arc<RwLock<SystemMetrics>>;

/// Creates a new SharedSystemMetrics instance with default values
pub fn new_shared_system_metrics() -> SharedSystemMetrics {
    Arc::new(RwLock::new(SystemMetrics::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };
    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

/// Build a snapshot of everything an operator needs to explain stalled work.
pub async fn collect_status(
    pipeline: &Pipeline,
    system: &SharedSystemMetrics,
) -> Result<StatusSnapshot, AdmissionError> {
    let scheduler = pipeline.scheduler();
    Ok(StatusSnapshot {
        timestamp_unix_ms: current_timestamp_ms(),
        queue: scheduler.queue().status(),
        admission: scheduler.admission().status()?,
        pipeline: pipeline.status(),
        system: system.read().await.clone(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionController, MemoryStore};
    use crate::config::PipelineMode;
    use crate::ledger::Ledger;
    use crate::queue::ChannelQueue;
    use crate::scheduler::{new_shared_ledger, CheckSettings, Scheduler};
    use crate::scorer::QualityScorer;
    use crate::testing::{FakeCatalog, FakeProber};
    use std::time::Duration;

    fn pipeline() -> Pipeline {
        let scheduler = Scheduler::new(
            Arc::new(ChannelQueue::new()),
            new_shared_ledger(Ledger::new(Duration::from_secs(60))),
            Arc::new(AdmissionController::new(Arc::new(MemoryStore::new()), 6)),
            Arc::new(FakeCatalog::new()),
            Arc::new(FakeProber::new(Duration::ZERO)),
            QualityScorer::default(),
            CheckSettings::default(),
        );
        Pipeline::new(Arc::new(scheduler), PipelineMode::AutoWithImmunity)
    }

    #[tokio::test]
    async fn test_snapshot_reflects_components() {
        let pipeline = pipeline();
        pipeline.enqueue_channel("c1", 1);
        let system = new_shared_system_metrics();
        system.write().await.cpu_usage_percent = 12.5;

        let snapshot = collect_status(&pipeline, &system).await.unwrap();

        assert!(snapshot.timestamp_unix_ms > 1577836800000);
        assert_eq!(snapshot.queue.depth, 1);
        assert_eq!(snapshot.admission.global.limit, 6);
        assert_eq!(snapshot.pipeline.mode, PipelineMode::AutoWithImmunity);
        assert!(!snapshot.pipeline.sweep_in_progress);
        assert_eq!(snapshot.system.cpu_usage_percent, 12.5);
    }

    #[tokio::test]
    async fn test_snapshot_json_field_names() {
        let snapshot = collect_status(&pipeline(), &new_shared_system_metrics())
            .await
            .unwrap();
        let json = serde_json::to_string(&snapshot).unwrap();

        for field in [
            "timestamp_unix_ms",
            "depth",
            "in_progress",
            "completed_total",
            "failed_total",
            "global",
            "providers",
            "mode",
            "sweep_in_progress",
            "cpu_usage_percent",
            "load_avg_15",
        ] {
            assert!(json.contains(field), "missing {}", field);
        }
        assert!(json.contains("\"auto_with_immunity\""));
    }

    #[test]
    fn test_collect_system_metrics_in_range() {
        let metrics = collect_system_metrics();
        assert!(metrics.mem_usage_percent >= 0.0 && metrics.mem_usage_percent <= 100.0);
        assert!(metrics.load_avg_1 >= 0.0);
    }
}
