//! Stream Checker Daemon
//!
//! Background service that probes channel streams under global and
//! per-provider concurrency ceilings, scores them, and keeps each channel's
//! stream list ordered best first.

pub mod admission;
pub mod catalog;
pub mod concurrency;
pub mod daemon;
pub mod ledger;
pub mod pipeline;
pub mod probe;
pub mod queue;
pub mod scheduler;
pub mod scorer;
pub mod startup;
pub mod state;
pub mod status;
pub mod status_server;

#[cfg(test)]
mod testing;

pub use stream_checker_config as config;
pub use stream_checker_config::Config;
pub use admission::{
    AdmissionController, AdmissionError, AdmissionPermit, AdmissionStatus, AdmissionStore,
    AdmissionTicket, MemoryStore, ResetReport, SqliteStore,
};
pub use catalog::{CatalogError, ChannelCatalog, ChannelStreams, FileCatalog, StreamSource};
pub use concurrency::{derive_plan, BackoffPolicy, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError};
pub use ledger::{CheckOutcome, FailureKind, Ledger, Liveness};
pub use pipeline::{Pipeline, PipelineStatus, SweepError, SweepReport, UpdateReport};
pub use probe::{FfprobeProber, ProbeError, ProbeFacts, Prober};
pub use queue::{ChannelQueue, EnqueueOrigin, EnqueueOutcome, QueueStatus};
pub use scheduler::{ChannelReport, CheckSettings, Scheduler, SchedulerError};
pub use scorer::{QualityScorer, QualityVerdict};
pub use startup::{check_ffprobe_available, run_startup_checks, StartupError};
pub use state::{PersistedState, StateStore};
pub use status::{collect_status, StatusSnapshot, SystemMetrics};
pub use status_server::{create_router, run_status_server, AppState, ServerError};
