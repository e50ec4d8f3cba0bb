//! Daemon startup and main loop for the stream checker
//!
//! Wires configuration, persisted state and collaborators into a running
//! pipeline, then drives the background tasks until shutdown.

use crate::admission::{AdmissionController, AdmissionError};
use crate::catalog::{CatalogError, ChannelCatalog, FileCatalog};
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::ledger::Ledger;
use crate::pipeline::{Pipeline, ScheduleError};
use crate::probe::{FfprobeProber, Prober};
use crate::queue::ChannelQueue;
use crate::scheduler::{new_shared_ledger, CheckSettings, Scheduler};
use crate::scorer::QualityScorer;
use crate::startup::{run_startup_checks, StartupError};
use crate::state::StateStore;
use crate::status::{collect_system_metrics, new_shared_system_metrics, SharedSystemMetrics};
use crate::status_server::{run_status_server, AppState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Admission store error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    pipeline: Arc<Pipeline>,
    system: SharedSystemMetrics,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file and apply environment overrides
    /// 2. Run startup checks (schedule, state dir, ffprobe)
    /// 3. Open the catalog and build the pipeline
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config).await
    }

    /// Initialize the daemon with an existing configuration
    pub async fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config).await
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when ffprobe is not available.
    pub async fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let catalog = FileCatalog::open(&config.state.catalog_path).await?;
        let prober = FfprobeProber::new(
            config.probe.ffprobe_path.clone(),
            Duration::from_secs(config.probe.analyze_duration_secs),
        );
        Self::from_parts(config, Arc::new(catalog), Arc::new(prober)).await
    }

    /// Build the daemon around the given collaborators.
    ///
    /// Persisted state is restored first; provider limits reported by the
    /// catalog take precedence over the persisted ones.
    pub async fn from_parts(
        config: Config,
        catalog: Arc<dyn ChannelCatalog>,
        prober: Arc<dyn Prober>,
    ) -> Result<Self, DaemonError> {
        let concurrency_plan = derive_plan(&config);
        let admission = AdmissionController::from_config(&config.admission, &concurrency_plan)?;

        let state_store = StateStore::new(&config.state.dir);
        let persisted = state_store.load();
        let cooldown = Duration::from_secs(config.ledger.cooldown_secs);
        let ledger = Ledger::restore(cooldown, persisted.channels, persisted.streams);

        let mut limits: HashMap<String, u32> = persisted
            .providers
            .into_iter()
            .map(|(id, record)| (id, record.max_concurrent))
            .collect();
        match catalog.provider_limits().await {
            Ok(current) => limits.extend(current),
            Err(e) => warn!(error = %e, "Failed to read provider limits, using persisted values"),
        }
        admission.set_provider_limits(limits);

        let scheduler = Scheduler::new(
            Arc::new(ChannelQueue::new()),
            new_shared_ledger(ledger),
            Arc::new(admission),
            catalog,
            prober,
            QualityScorer::new(config.scorer.clone()),
            CheckSettings::from_config(&config, concurrency_plan.max_active_channels),
        )
        .with_state_store(state_store);
        let pipeline = Pipeline::from_config(&config.pipeline, Arc::new(scheduler))?;

        info!(
            global_ceiling = concurrency_plan.global_ceiling,
            max_active_channels = concurrency_plan.max_active_channels,
            mode = %pipeline.mode(),
            "Daemon initialized"
        );

        Ok(Self {
            config,
            concurrency_plan,
            pipeline: Arc::new(pipeline),
            system: new_shared_system_metrics(),
        })
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn system_metrics(&self) -> SharedSystemMetrics {
        self.system.clone()
    }

    fn bind_addr(&self) -> Result<SocketAddr, DaemonError> {
        self.config.server.bind.parse().map_err(|e| {
            DaemonError::Server(format!("Invalid bind address '{}': {}", self.config.server.bind, e))
        })
    }

    /// Start the control HTTP server
    pub fn start_status_server(&self, addr: SocketAddr) -> JoinHandle<Result<(), DaemonError>> {
        let state = AppState {
            pipeline: Arc::clone(&self.pipeline),
            system: self.system.clone(),
        };
        tokio::spawn(async move {
            run_status_server(state, addr)
                .await
                .map_err(|e| DaemonError::Server(e.to_string()))
        })
    }

    /// Start the system metrics update task
    pub fn start_metrics_updater(&self) -> JoinHandle<()> {
        let system = self.system.clone();
        tokio::spawn(async move {
            loop {
                let metrics = tokio::task::spawn_blocking(collect_system_metrics)
                    .await
                    .unwrap_or_default();
                *system.write().await = metrics;
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        })
    }

    /// Start the worker loop, the sweep driver and the ticket reconciler
    ///
    /// Channels restored with a pending recheck are enqueued first.
    pub fn start_workers(&self) -> Vec<JoinHandle<()>> {
        self.pipeline.resume_pending();
        let scheduler = Arc::clone(self.pipeline.scheduler());
        let interval = Duration::from_secs(self.config.admission.reconcile_interval_secs.max(1));
        vec![
            tokio::spawn(Arc::clone(&scheduler).run()),
            tokio::spawn(Arc::clone(&self.pipeline).run()),
            tokio::spawn(Arc::clone(scheduler.admission()).run_reconciler(interval)),
        ]
    }

    /// Run the daemon with all background tasks
    ///
    /// Returns on ctrl-c after persisting state, or when the server fails.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        let addr = self.bind_addr()?;
        let mut server = self.start_status_server(addr);
        let updater = self.start_metrics_updater();
        let workers = self.start_workers();

        let result = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Shutdown requested"),
                    Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
                }
                Ok(())
            }
            joined = &mut server => match joined {
                Ok(result) => result,
                Err(e) => Err(DaemonError::Server(e.to_string())),
            },
        };

        server.abort();
        updater.abort();
        for worker in workers {
            worker.abort();
        }
        self.pipeline.scheduler().persist();
        info!("State persisted, daemon stopped");
        result
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineMode;
    use crate::state::{PersistedState, ProviderRecord};
    use crate::testing::{FakeCatalog, FakeProber};
    use tempfile::TempDir;

    fn create_test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.admission.global_ceiling = 8;
        config.pipeline.max_active_channels = 3;
        config.state.dir = dir.path().join("state");
        config.state.catalog_path = dir.path().join("catalog.json");
        config
    }

    async fn build(config: Config, catalog: FakeCatalog) -> Daemon {
        Daemon::from_parts(
            config,
            Arc::new(catalog),
            Arc::new(FakeProber::new(Duration::ZERO)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_daemon_derives_concurrency_plan() {
        let dir = TempDir::new().unwrap();
        let daemon = build(create_test_config(&dir), FakeCatalog::new()).await;

        assert_eq!(daemon.concurrency_plan.global_ceiling, 8);
        assert_eq!(daemon.concurrency_plan.max_active_channels, 3);
        assert_eq!(
            daemon.pipeline().scheduler().admission().global_ceiling(),
            8
        );
        assert_eq!(daemon.pipeline().mode(), PipelineMode::AutoWithImmunity);
    }

    #[tokio::test]
    async fn test_catalog_limits_override_persisted() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);
        let mut persisted = PersistedState::default();
        persisted
            .providers
            .insert("old".to_string(), ProviderRecord { max_concurrent: 1 });
        persisted
            .providers
            .insert("p".to_string(), ProviderRecord { max_concurrent: 1 });
        StateStore::new(&config.state.dir).save(&persisted).unwrap();

        let daemon = build(config, FakeCatalog::new().with_provider("p", 4)).await;
        let admission = daemon.pipeline().scheduler().admission();

        assert_eq!(admission.provider_limit("p"), 4);
        assert_eq!(admission.provider_limit("old"), 1);
    }

    #[tokio::test]
    async fn test_ledger_restored_from_state_dir() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);
        let catalog = FakeCatalog::new()
            .with_provider("p", 2)
            .with_channel("c1", &[("s1", "p")]);

        let first = build(config.clone(), catalog).await;
        first.pipeline().scheduler().check_channel("c1").await.unwrap();

        let second = build(config, FakeCatalog::new()).await;
        let ledger = second.pipeline().scheduler().ledger().lock();
        assert!(ledger.stream("s1").is_some());
        assert!(ledger.channel("c1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_recheck_flags_are_enqueued_on_start() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);
        let catalog = || {
            FakeCatalog::new()
                .with_provider("p", 2)
                .with_channel("c1", &[("s1", "p")])
                .with_channel("c2", &[("s2", "p")])
        };

        // Updated before a restart, never checked
        let first = build(config.clone(), catalog()).await;
        first.pipeline().handle_update(&["c1".to_string()]);
        first.pipeline().scheduler().persist();
        drop(first);

        let prober = Arc::new(FakeProber::new(Duration::ZERO));
        let second = Daemon::from_parts(config, Arc::new(catalog()), prober.clone())
            .await
            .unwrap();
        assert!(second.pipeline().scheduler().ledger().lock().channel("c1").unwrap().needs_check);

        let workers = second.start_workers();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(prober.calls("s1"), 1);
        assert_eq!(prober.calls("s2"), 0);
        assert!(!second.pipeline().scheduler().ledger().lock().channel("c1").unwrap().needs_check);
        for worker in workers {
            worker.abort();
        }
    }

    #[tokio::test]
    async fn test_invalid_schedule_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.pipeline.sweep_schedule = "not cron".to_string();

        let result = Daemon::from_parts(
            config,
            Arc::new(FakeCatalog::new()),
            Arc::new(FakeProber::new(Duration::ZERO)),
        )
        .await;
        assert!(matches!(result, Err(DaemonError::Schedule(_))));
    }

    #[tokio::test]
    async fn test_missing_catalog_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(create_test_config(&dir))
            .await
            .unwrap();
        let channels = daemon
            .pipeline()
            .scheduler()
            .catalog()
            .channels_with_providers()
            .await
            .unwrap();
        assert!(channels.is_empty());
    }

    #[tokio::test]
    async fn test_missing_config_file_fails() {
        let result = Daemon::new("/nonexistent/stream-checker.toml").await;
        assert!(matches!(result, Err(DaemonError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_bind_address() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.server.bind = "not-an-address".to_string();
        let daemon = build(config, FakeCatalog::new()).await;

        let result = daemon.run_with_server().await;
        assert!(matches!(result, Err(DaemonError::Server(_))));
    }
}
