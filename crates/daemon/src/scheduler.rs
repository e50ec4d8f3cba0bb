//! Scheduler and worker loop.
//!
//! The worker pops channels from the [`ChannelQueue`], probes every due
//! stream through the [`AdmissionController`], scores the facts, records
//! outcomes in the ledger and writes the new stream order back to the
//! catalog once every due stream of the channel has been visited.

use crate::admission::AdmissionController;
use crate::catalog::{CatalogError, ChannelCatalog, ChannelId, StreamId, StreamSource};
use crate::config::Config;
use crate::ledger::{CheckOutcome, FailureKind, Ledger};
use crate::probe::{ProbeError, Prober};
use crate::queue::{ChannelQueue, EnqueueOrigin, EnqueueOutcome};
use crate::scorer::QualityScorer;
use crate::state::{current_timestamp_ms, PersistedState, ProviderRecord, StateStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Ledger shared between the worker and the pipeline.
pub type SharedLedger = Arc<Mutex<Ledger>>;

/// Create a new shared ledger
pub fn new_shared_ledger(ledger: Ledger) -> SharedLedger {
    Arc::new(Mutex::new(ledger))
}

/// Errors that fail a channel pass.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Channel {0} has no streams")]
    NoStreams(ChannelId),
}

/// Timing knobs of a channel pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckSettings {
    pub probe_timeout: Duration,
    /// Extra attempts after a failed probe
    pub retries: u32,
    pub retry_delay: Duration,
    /// Delay between consecutive probe dispatches
    pub stagger: Duration,
    pub acquire_timeout: Duration,
    pub max_active_channels: u32,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(30),
            retries: 1,
            retry_delay: Duration::from_secs(5),
            stagger: Duration::from_millis(250),
            acquire_timeout: Duration::from_secs(300),
            max_active_channels: 4,
        }
    }
}

impl CheckSettings {
    pub fn from_config(cfg: &Config, max_active_channels: u32) -> Self {
        Self {
            probe_timeout: Duration::from_secs(cfg.probe.timeout_secs),
            retries: cfg.probe.retries,
            retry_delay: Duration::from_secs(cfg.probe.retry_delay_secs),
            stagger: Duration::from_millis(cfg.probe.stagger_ms),
            acquire_timeout: Duration::from_secs(cfg.admission.acquire_timeout_secs),
            max_active_channels,
        }
    }
}

/// Result of checking one stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamResult {
    Checked(CheckOutcome),
    /// No admission slot within the acquire timeout.
    Skipped,
}

/// Summary of one channel pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelReport {
    pub channel_id: ChannelId,
    pub streams: usize,
    pub probed: usize,
    pub failed_probes: usize,
    pub skipped: usize,
    pub dead: usize,
    pub order: Vec<StreamId>,
    pub order_changed: bool,
}

impl ChannelReport {
    /// Every due stream was visited.
    pub fn is_complete(&self) -> bool {
        self.skipped == 0
    }
}

/// Probes one stream through admission control.
#[derive(Clone)]
struct StreamChecker {
    admission: Arc<AdmissionController>,
    prober: Arc<dyn Prober>,
    scorer: QualityScorer,
    settings: CheckSettings,
}

impl StreamChecker {
    async fn check(&self, source: &StreamSource) -> StreamResult {
        let attempts = self.settings.retries.saturating_add(1);
        let mut last_failure = FailureKind::Error;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.settings.retry_delay).await;
            }

            let permit = match self
                .admission
                .try_acquire(
                    &source.provider_id,
                    &source.stream_id,
                    self.settings.acquire_timeout,
                )
                .await
            {
                Ok(Some(permit)) => permit,
                Ok(None) => {
                    warn!(
                        stream_id = %source.stream_id,
                        provider_id = %source.provider_id,
                        attempt = attempt + 1,
                        "No admission slot for probe attempt"
                    );
                    return Self::unfinished(attempt, last_failure);
                }
                Err(e) => {
                    error!(stream_id = %source.stream_id, error = %e, "Admission store failure");
                    return Self::unfinished(attempt, last_failure);
                }
            };

            let budget = self.settings.probe_timeout;
            let result = match tokio::time::timeout(budget, self.prober.probe(&source.url, budget)).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout(budget)),
            };
            if let Err(e) = permit.release() {
                error!(stream_id = %source.stream_id, error = %e, "Failed to release admission slot");
            }

            match result {
                Ok(facts) => {
                    let verdict = self.scorer.score(&facts);
                    debug!(
                        stream_id = %source.stream_id,
                        score = verdict.score,
                        liveness = ?verdict.liveness,
                        "Stream scored"
                    );
                    return StreamResult::Checked(CheckOutcome::Scored(verdict));
                }
                Err(e) => {
                    warn!(
                        stream_id = %source.stream_id,
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "Probe failed"
                    );
                    last_failure = if e.is_timeout() {
                        FailureKind::Timeout
                    } else {
                        FailureKind::Error
                    };
                }
            }
        }

        StreamResult::Checked(CheckOutcome::Failed(last_failure))
    }

    /// No slot for `attempt`: a stream that already failed keeps that
    /// failure, one never probed is skipped.
    fn unfinished(attempt: u32, last_failure: FailureKind) -> StreamResult {
        if attempt == 0 {
            StreamResult::Skipped
        } else {
            StreamResult::Checked(CheckOutcome::Failed(last_failure))
        }
    }
}

/// Channel scheduler owning the queue and the worker loop.
pub struct Scheduler {
    queue: Arc<ChannelQueue>,
    ledger: SharedLedger,
    catalog: Arc<dyn ChannelCatalog>,
    checker: StreamChecker,
    state: Option<StateStore>,
    /// Held from snapshot to rename so writes land in snapshot order.
    persist_lock: Mutex<()>,
    channel_slots: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<ChannelQueue>,
        ledger: SharedLedger,
        admission: Arc<AdmissionController>,
        catalog: Arc<dyn ChannelCatalog>,
        prober: Arc<dyn Prober>,
        scorer: QualityScorer,
        settings: CheckSettings,
    ) -> Self {
        let slots = settings.max_active_channels.max(1) as usize;
        Self {
            queue,
            ledger,
            catalog,
            checker: StreamChecker {
                admission,
                prober,
                scorer,
                settings,
            },
            state: None,
            persist_lock: Mutex::new(()),
            channel_slots: Arc::new(Semaphore::new(slots)),
        }
    }

    /// Persist ledger and provider limits after every pass.
    pub fn with_state_store(mut self, state: StateStore) -> Self {
        self.state = Some(state);
        self
    }

    pub fn queue(&self) -> &Arc<ChannelQueue> {
        &self.queue
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.checker.admission
    }

    pub fn catalog(&self) -> &Arc<dyn ChannelCatalog> {
        &self.catalog
    }

    /// Steady-state entry point for manual and update-driven checks.
    pub fn enqueue_channel(&self, channel_id: &str, priority: i32) -> EnqueueOutcome {
        self.queue
            .enqueue(channel_id, priority, EnqueueOrigin::SteadyState)
    }

    /// Drain the queue forever.
    ///
    /// Channels are checked concurrently up to `max_active_channels`. A
    /// failing or panicking pass is logged and counted; the loop goes on.
    pub async fn run(self: Arc<Self>) {
        info!(
            max_active_channels = self.channel_slots.available_permits(),
            "Worker loop started"
        );
        loop {
            let slot = match Arc::clone(&self.channel_slots).acquire_owned().await {
                Ok(slot) => slot,
                Err(_) => {
                    error!("Channel slots closed, worker loop stopping");
                    return;
                }
            };
            let channel_id = self.queue.next().await;

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let pass = {
                    let this = Arc::clone(&this);
                    let channel_id = channel_id.clone();
                    tokio::spawn(async move { this.check_channel(&channel_id).await })
                };
                let success = match pass.await {
                    Ok(Ok(report)) => {
                        info!(
                            channel_id = %report.channel_id,
                            probed = report.probed,
                            failed = report.failed_probes,
                            skipped = report.skipped,
                            dead = report.dead,
                            "Channel pass finished"
                        );
                        true
                    }
                    Ok(Err(e)) => {
                        warn!(channel_id = %channel_id, error = %e, "Channel pass failed");
                        false
                    }
                    Err(e) => {
                        error!(channel_id = %channel_id, error = %e, "Channel pass aborted");
                        false
                    }
                };
                this.queue.complete(&channel_id, success);
                drop(slot);
            });
        }
    }

    /// Check every due stream of a channel and apply the new ranking.
    pub async fn check_channel(&self, channel_id: &str) -> Result<ChannelReport, SchedulerError> {
        let Some(listing) = self.catalog.channel_streams(channel_id).await? else {
            self.ledger.lock().forget_channel(channel_id);
            return Err(CatalogError::UnknownChannel(channel_id.to_string()).into());
        };
        let previous_order: Vec<StreamId> =
            listing.streams.iter().map(|s| s.stream_id.clone()).collect();

        let (members, due) = {
            let mut ledger = self.ledger.lock();
            ledger.sync_channel(&listing);
            let members = ledger.members(channel_id);
            let now = current_timestamp_ms();
            let due: Vec<StreamSource> = members
                .iter()
                .filter(|s| ledger.should_probe(&s.stream_id, now))
                .cloned()
                .collect();
            for source in &due {
                ledger.begin_revival(&source.stream_id);
            }
            (members, due)
        };

        if members.is_empty() {
            // Nothing to check; a pending flag would only requeue it forever
            self.ledger
                .lock()
                .finish_pass(channel_id, current_timestamp_ms(), true);
            return Err(SchedulerError::NoStreams(channel_id.to_string()));
        }
        debug!(
            channel_id,
            members = members.len(),
            due = due.len(),
            forced = self.ledger.lock().is_forced(channel_id),
            "Channel pass started"
        );

        let mut report = ChannelReport {
            channel_id: channel_id.to_string(),
            streams: members.len(),
            ..ChannelReport::default()
        };

        let mut probes = JoinSet::new();
        for (i, source) in due.into_iter().enumerate() {
            if i > 0 && !self.checker.settings.stagger.is_zero() {
                tokio::time::sleep(self.checker.settings.stagger).await;
            }
            let checker = self.checker.clone();
            probes.spawn(async move {
                let result = checker.check(&source).await;
                (source.stream_id, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let (stream_id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(channel_id, error = %e, "Probe task aborted");
                    report.skipped += 1;
                    continue;
                }
            };
            match result {
                StreamResult::Skipped => report.skipped += 1,
                StreamResult::Checked(outcome) => {
                    report.probed += 1;
                    if matches!(outcome, CheckOutcome::Failed(_)) {
                        report.failed_probes += 1;
                    }
                    self.ledger
                        .lock()
                        .record_result(&stream_id, current_timestamp_ms(), outcome);
                }
            }
        }

        let order = {
            let mut ledger = self.ledger.lock();
            ledger.finish_pass(channel_id, current_timestamp_ms(), report.is_complete());
            report.dead = ledger.dead_streams(channel_id).len();
            ledger.rank(channel_id)
        };
        report.order_changed = order != previous_order;
        report.order = order;

        let applied = if report.order_changed {
            self.catalog
                .apply_stream_order(channel_id, &report.order)
                .await
        } else {
            Ok(())
        };
        self.persist();
        applied?;

        Ok(report)
    }

    /// Snapshot of everything that survives a restart.
    pub fn snapshot_state(&self) -> PersistedState {
        let (channels, streams) = self.ledger.lock().export();
        let providers = self
            .checker
            .admission
            .provider_limits()
            .into_iter()
            .map(|(id, max_concurrent)| (id, ProviderRecord { max_concurrent }))
            .collect();
        PersistedState {
            channels,
            streams,
            providers,
        }
    }

    /// Write state to disk; failures are logged, never fatal.
    pub fn persist(&self) {
        let Some(store) = &self.state else {
            return;
        };
        let _guard = self.persist_lock.lock();
        if let Err(e) = store.save(&self.snapshot_state()) {
            warn!(path = %store.path().display(), error = %e, "Failed to persist state");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::MemoryStore;
    use crate::ledger::Liveness;
    use crate::probe::{ProbeFacts, Resolution};
    use crate::testing::{hd_facts, FakeCatalog, FakeProber, FakeResponse};
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct Harness {
        scheduler: Arc<Scheduler>,
        catalog: Arc<FakeCatalog>,
        prober: Arc<FakeProber>,
    }

    fn settings() -> CheckSettings {
        CheckSettings {
            probe_timeout: Duration::from_secs(30),
            retries: 1,
            retry_delay: Duration::from_secs(5),
            stagger: Duration::from_millis(10),
            acquire_timeout: Duration::from_secs(300),
            max_active_channels: 4,
        }
    }

    fn harness(
        catalog: FakeCatalog,
        prober: FakeProber,
        global: u32,
        settings: CheckSettings,
    ) -> Harness {
        let catalog = Arc::new(catalog);
        let prober = Arc::new(prober);
        let admission = AdmissionController::new(Arc::new(MemoryStore::new()), global);
        admission.set_provider_limits(catalog.limits());
        let scheduler = Scheduler::new(
            Arc::new(ChannelQueue::new()),
            new_shared_ledger(Ledger::new(Duration::from_secs(2 * 60 * 60))),
            Arc::new(admission),
            catalog.clone(),
            prober.clone(),
            QualityScorer::default(),
            settings,
        );
        Harness {
            scheduler: Arc::new(scheduler),
            catalog,
            prober,
        }
    }

    fn dead_facts() -> ProbeFacts {
        ProbeFacts {
            resolution: Resolution::new(0, 0),
            bitrate_kbps: 0.0,
            ..ProbeFacts::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_provider_channel_respects_ceilings() {
        let catalog = FakeCatalog::new()
            .with_provider("A", 1)
            .with_provider("B", 2)
            .with_channel("c1", &[("A1", "A"), ("A2", "A"), ("B1", "B"), ("B2", "B"), ("B3", "B")]);
        let prober = FakeProber::new(Duration::from_millis(500));
        let h = harness(catalog, prober, 3, settings());

        let report = h.scheduler.check_channel("c1").await.unwrap();

        assert_eq!(report.probed, 5);
        assert_eq!(report.skipped, 0);
        assert_eq!(h.prober.peak_for("A"), 1);
        assert!(h.prober.peak_for("B") <= 2);
        assert!(h.prober.global_peak() <= 3);
        let ledger = h.scheduler.ledger().lock();
        for id in ["A1", "A2", "B1", "B2", "B3"] {
            assert!(ledger.stream(id).unwrap().score.unwrap() > 0.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_stream_excluded_from_order() {
        let catalog = FakeCatalog::new().with_channel("c1", &[("s1", "p"), ("s2", "p"), ("s3", "p")]);
        let prober = FakeProber::new(Duration::from_millis(10));
        prober.respond("s2", FakeResponse::Facts(dead_facts()));
        let mut better = hd_facts();
        better.bitrate_kbps = 7000.0;
        prober.respond("s3", FakeResponse::Facts(better));
        let h = harness(catalog, prober, 4, settings());

        let report = h.scheduler.check_channel("c1").await.unwrap();

        assert_eq!(report.order, vec!["s3", "s1"]);
        assert!(report.order_changed);
        assert_eq!(report.dead, 1);
        assert_eq!(h.catalog.applied("c1"), Some(vec!["s3".to_string(), "s1".to_string()]));
        let ledger = h.scheduler.ledger().lock();
        let dead = ledger.stream("s2").unwrap();
        assert_eq!(dead.liveness, Liveness::Dead);
        assert_eq!(dead.score, Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_pass_revives_dead_stream() {
        let catalog = FakeCatalog::new().with_channel("c1", &[("s1", "p"), ("s2", "p")]);
        let prober = FakeProber::new(Duration::from_millis(10));
        prober.respond("s2", FakeResponse::Facts(dead_facts()));
        let h = harness(catalog, prober, 4, settings());

        h.scheduler.check_channel("c1").await.unwrap();
        assert_eq!(h.catalog.applied("c1"), Some(vec!["s1".to_string()]));

        // The stream is healthy again; a steady-state pass leaves it alone
        h.prober.respond("s2", FakeResponse::Facts(hd_facts()));
        h.scheduler.check_channel("c1").await.unwrap();
        assert_eq!(h.prober.calls("s2"), 1);

        h.scheduler.ledger().lock().mark_force("c1");
        let report = h.scheduler.check_channel("c1").await.unwrap();

        assert_eq!(h.prober.calls("s2"), 2);
        assert_eq!(report.dead, 0);
        assert!(report.order.contains(&"s2".to_string()));
        let ledger = h.scheduler.ledger().lock();
        let revived = ledger.stream("s2").unwrap();
        assert_eq!(revived.liveness, Liveness::Alive);
        assert!(revived.score.unwrap() > 0.0);
        assert!(!ledger.is_forced("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_skips_recent_streams() {
        let catalog = FakeCatalog::new().with_channel("c1", &[("s1", "p"), ("s2", "p")]);
        let prober = FakeProber::new(Duration::from_millis(10));
        let h = harness(catalog, prober, 4, settings());

        h.scheduler.check_channel("c1").await.unwrap();
        let report = h.scheduler.check_channel("c1").await.unwrap();

        assert_eq!(report.probed, 0);
        assert_eq!(h.prober.calls("s1"), 1);
        assert_eq!(h.prober.calls("s2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_retries_then_keeps_score() {
        let catalog = FakeCatalog::new().with_channel("c1", &[("s1", "p")]);
        let prober = FakeProber::new(Duration::from_millis(10));
        let h = harness(catalog, prober, 4, settings());

        h.scheduler.check_channel("c1").await.unwrap();
        let before = h.scheduler.ledger().lock().stream("s1").unwrap().score;

        h.prober.respond("s1", FakeResponse::Fail);
        h.scheduler.ledger().lock().mark_force("c1");
        let report = h.scheduler.check_channel("c1").await.unwrap();

        // One initial attempt plus one retry
        assert_eq!(h.prober.calls("s1"), 3);
        assert_eq!(report.failed_probes, 1);
        let ledger = h.scheduler.ledger().lock();
        let record = ledger.stream("s1").unwrap();
        assert_eq!(record.score, before);
        assert_eq!(record.liveness, Liveness::Alive);
        assert_eq!(record.consecutive_failures, 1);
        assert_eq!(h.scheduler.admission().status().unwrap().global.used, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_times_out_and_releases_slot() {
        let catalog = FakeCatalog::new().with_channel("c1", &[("s1", "p")]);
        let prober = FakeProber::new(Duration::from_millis(10));
        prober.respond("s1", FakeResponse::Hang);
        let mut settings = settings();
        settings.retries = 0;
        let h = harness(catalog, prober, 1, settings);

        let report = h.scheduler.check_channel("c1").await.unwrap();

        assert_eq!(report.failed_probes, 1);
        let ledger = h.scheduler.ledger().lock();
        assert_eq!(
            ledger.stream("s1").unwrap().last_failure,
            Some(FailureKind::Timeout)
        );
        assert_eq!(h.scheduler.admission().status().unwrap().global.used, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_timeout_leaves_channel_flagged() {
        let catalog = FakeCatalog::new().with_provider("p", 1).with_channel("c1", &[("s1", "p")]);
        let prober = FakeProber::new(Duration::from_millis(10));
        let mut settings = settings();
        settings.acquire_timeout = Duration::from_secs(1);
        let h = harness(catalog, prober, 4, settings);

        // Another process holds the provider's only slot
        let _held = h
            .scheduler
            .admission()
            .try_acquire("p", "elsewhere", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        h.scheduler.ledger().lock().mark_updated("c1");

        let report = h.scheduler.check_channel("c1").await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(h.prober.calls("s1"), 0);
        let ledger = h.scheduler.ledger().lock();
        assert!(ledger.channel("c1").unwrap().needs_check);
        assert!(ledger.is_due("s1", current_timestamp_ms()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_without_slot_keeps_earlier_failure() {
        let catalog = FakeCatalog::new().with_provider("p", 1).with_channel("c1", &[("s1", "p")]);
        let prober = FakeProber::new(Duration::from_millis(10));
        prober.respond("s1", FakeResponse::Fail);
        let mut settings = settings();
        settings.acquire_timeout = Duration::from_secs(1);
        let h = harness(catalog, prober, 4, settings);

        let pass = {
            let scheduler = Arc::clone(&h.scheduler);
            tokio::spawn(async move { scheduler.check_channel("c1").await })
        };
        // First attempt has failed; take the slot before the retry delay ends
        tokio::time::sleep(Duration::from_secs(1)).await;
        let _held = h
            .scheduler
            .admission()
            .try_acquire("p", "elsewhere", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let report = pass.await.unwrap().unwrap();

        assert_eq!(h.prober.calls("s1"), 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.failed_probes, 1);
        let ledger = h.scheduler.ledger().lock();
        let record = ledger.stream("s1").unwrap();
        assert_eq!(record.consecutive_failures, 1);
        assert_eq!(record.last_failure, Some(FailureKind::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_loop_counts_outcomes() {
        let catalog = FakeCatalog::new()
            .with_channel("c1", &[("s1", "p")])
            .with_channel("empty", &[]);
        let prober = FakeProber::new(Duration::from_millis(10));
        let h = harness(catalog, prober, 4, settings());

        let worker = tokio::spawn(Arc::clone(&h.scheduler).run());
        assert_eq!(h.scheduler.enqueue_channel("c1", 10), EnqueueOutcome::Queued);
        assert_eq!(h.scheduler.enqueue_channel("empty", 10), EnqueueOutcome::Queued);
        assert_eq!(h.scheduler.enqueue_channel("missing", 0), EnqueueOutcome::Queued);

        tokio::time::timeout(Duration::from_secs(60), h.scheduler.queue().wait_idle())
            .await
            .unwrap();

        let status = h.scheduler.queue().status();
        assert_eq!(status.enqueued_total, 3);
        assert_eq!(status.completed_total, 1);
        assert_eq!(status.failed_total, 2);
        assert!(!worker.is_finished());
        worker.abort();
    }

    #[tokio::test]
    async fn test_failed_pass_without_streams_drops_its_flags() {
        let catalog = FakeCatalog::new().with_channel("empty", &[]);
        let h = harness(catalog, FakeProber::new(Duration::ZERO), 4, settings());
        {
            let mut ledger = h.scheduler.ledger().lock();
            ledger.mark_force("empty");
            ledger.mark_updated("gone");
        }

        assert!(matches!(
            h.scheduler.check_channel("empty").await,
            Err(SchedulerError::NoStreams(_))
        ));
        assert!(h.scheduler.check_channel("gone").await.is_err());

        let ledger = h.scheduler.ledger().lock();
        assert!(ledger.pending_channels().is_empty());
        assert!(ledger.channel("gone").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_persists_state() {
        let dir = TempDir::new().unwrap();
        let catalog = FakeCatalog::new().with_provider("p", 3).with_channel("c1", &[("s1", "p")]);
        let prober = FakeProber::new(Duration::from_millis(10));
        let h = harness(catalog, prober, 4, settings());
        let store = StateStore::new(dir.path());
        let scheduler = Arc::try_unwrap(h.scheduler)
            .ok()
            .unwrap()
            .with_state_store(store.clone());

        scheduler.check_channel("c1").await.unwrap();

        let state = store.load();
        assert_eq!(state.streams.len(), 1);
        assert!(state.streams[0].last_checked.is_some());
        assert_eq!(state.channels[0].channel_id, "c1");
        assert_eq!(state.providers.get("p"), Some(&ProviderRecord { max_concurrent: 3 }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_passes_persist_every_channel() {
        let dir = TempDir::new().unwrap();
        let mut catalog = FakeCatalog::new().with_provider("p", 0);
        for i in 0..8 {
            let stream = format!("s{}", i);
            catalog = catalog.with_channel(&format!("c{}", i), &[(stream.as_str(), "p")]);
        }
        let mut settings = settings();
        settings.stagger = Duration::ZERO;
        let h = harness(catalog, FakeProber::new(Duration::ZERO), 16, settings);
        let store = StateStore::new(dir.path());
        let scheduler = Arc::new(
            Arc::try_unwrap(h.scheduler)
                .ok()
                .unwrap()
                .with_state_store(store.clone()),
        );

        let passes: Vec<_> = (0..8)
            .map(|i| {
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move { scheduler.check_channel(&format!("c{}", i)).await })
            })
            .collect();
        for pass in passes {
            pass.await.unwrap().unwrap();
        }

        // The last write holds every pass, and no temp files remain
        let state = store.load();
        assert_eq!(state.channels.len(), 8);
        assert!(state.streams.iter().all(|s| s.last_checked.is_some()));
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_order_is_not_written() {
        let catalog = FakeCatalog::new().with_channel("c1", &[("s1", "p")]);
        let prober = FakeProber::new(Duration::from_millis(10));
        let h = harness(catalog, prober, 4, settings());

        let report = h.scheduler.check_channel("c1").await.unwrap();

        assert!(!report.order_changed);
        assert_eq!(h.catalog.applied("c1"), None);
        let limits: HashMap<_, _> = h.scheduler.admission().provider_limits();
        assert!(limits.is_empty());
    }
}
