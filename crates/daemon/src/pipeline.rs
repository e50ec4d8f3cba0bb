//! Pipeline state machine.
//!
//! The operating mode decides whether update events enqueue checks and
//! whether the scheduled sweep runs. The sweep (refresh sources, rediscover
//! matches, force-check every channel) is mutually exclusive with the
//! steady-state enqueue path and with itself.

use crate::catalog::ChannelId;
use crate::config::{PipelineConfig, PipelineMode};
use crate::queue::{EnqueueOrigin, EnqueueOutcome};
use crate::scheduler::Scheduler;
use crate::state::current_timestamp_ms;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Reasons a sweep request is rejected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SweepError {
    /// Another sweep is active; requests are never queued.
    #[error("A sweep is already running")]
    AlreadyRunning,

    #[error("Pipeline is disabled")]
    Disabled,
}

/// Invalid sweep schedule expression.
#[derive(Debug, Error)]
#[error("Invalid sweep schedule '{expression}': {reason}")]
pub struct ScheduleError {
    pub expression: String,
    pub reason: String,
}

/// Parse a cron expression with a leading seconds field.
pub fn parse_schedule(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    cron::Schedule::from_str(expression).map_err(|e| ScheduleError {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// The two switches a mode controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeGates {
    pub enqueue_on_update: bool,
    pub scheduled_sweep: bool,
}

impl ModeGates {
    pub fn for_mode(mode: PipelineMode) -> Self {
        let enqueue_on_update = matches!(
            mode,
            PipelineMode::AutoWithImmunity | PipelineMode::AutoWithImmunityPlusSweep
        );
        let scheduled_sweep = matches!(
            mode,
            PipelineMode::AutoWithImmunityPlusSweep
                | PipelineMode::AutoNoCheckPlusSweep
                | PipelineMode::SweepOnly
        );
        Self {
            enqueue_on_update,
            scheduled_sweep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepTrigger {
    Manual,
    Scheduled,
}

/// Outcome of a finished sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub trigger: SweepTrigger,
    pub started_at: i64,
    pub finished_at: i64,
    pub channels: usize,
    /// Steps that failed; the sweep continues past them where it can.
    pub errors: Vec<String>,
}

/// Pollable pipeline state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub mode: PipelineMode,
    pub enqueue_on_update: bool,
    pub scheduled_sweep_enabled: bool,
    pub sweep_in_progress: bool,
    pub next_sweep_at: Option<i64>,
    pub last_sweep: Option<SweepReport>,
}

/// Result of an update event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub marked: usize,
    pub enqueued: usize,
}

/// Mode holder and sweep driver.
pub struct Pipeline {
    mode: RwLock<PipelineMode>,
    scheduler: Arc<Scheduler>,
    schedule: Option<cron::Schedule>,
    update_priority: i32,
    sweep_priority: i32,
    manual_requested: AtomicBool,
    wake: Notify,
    last_sweep: Mutex<Option<SweepReport>>,
    /// Period of the rescan for channels still flagged for a recheck
    pending_interval: Duration,
}

impl Pipeline {
    pub fn new(scheduler: Arc<Scheduler>, mode: PipelineMode) -> Self {
        Self {
            mode: RwLock::new(mode),
            scheduler,
            schedule: None,
            update_priority: 10,
            sweep_priority: 0,
            manual_requested: AtomicBool::new(false),
            wake: Notify::new(),
            last_sweep: Mutex::new(None),
            pending_interval: Duration::from_secs(60),
        }
    }

    pub fn from_config(
        cfg: &PipelineConfig,
        scheduler: Arc<Scheduler>,
    ) -> Result<Self, ScheduleError> {
        let schedule = parse_schedule(&cfg.sweep_schedule)?;
        let mut pipeline = Self::new(scheduler, cfg.mode).with_schedule(schedule);
        pipeline.update_priority = cfg.update_priority;
        pipeline.sweep_priority = cfg.sweep_priority;
        pipeline.pending_interval = Duration::from_secs(cfg.pending_recheck_secs.max(1));
        Ok(pipeline)
    }

    pub fn with_schedule(mut self, schedule: cron::Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn mode(&self) -> PipelineMode {
        *self.mode.read()
    }

    pub fn gates(&self) -> ModeGates {
        ModeGates::for_mode(self.mode())
    }

    /// Switch the operating mode. Takes effect for the next event.
    ///
    /// Channels updated while the old mode held them back are enqueued when
    /// the new mode enqueues on update.
    pub fn set_mode(&self, mode: PipelineMode) {
        let previous = std::mem::replace(&mut *self.mode.write(), mode);
        if previous != mode {
            info!(from = %previous, to = %mode, "Pipeline mode changed");
            self.resume_pending();
        }
        // The driver recomputes the next scheduled sweep
        self.wake.notify_one();
    }

    pub fn is_sweep_in_progress(&self) -> bool {
        self.scheduler.queue().is_sweep_active()
    }

    /// Upstream content of these channels changed.
    ///
    /// Every channel is marked for a recheck; checks are enqueued only when
    /// the mode enqueues on update and no sweep is running.
    pub fn handle_update(&self, channel_ids: &[ChannelId]) -> UpdateReport {
        let gates = self.gates();
        {
            let mut ledger = self.scheduler.ledger().lock();
            for channel_id in channel_ids {
                ledger.mark_updated(channel_id);
            }
        }

        let mut report = UpdateReport {
            marked: channel_ids.len(),
            enqueued: 0,
        };
        if !gates.enqueue_on_update {
            debug!(mode = %self.mode(), channels = channel_ids.len(), "Update recorded without enqueue");
            return report;
        }
        for channel_id in channel_ids {
            if self
                .scheduler
                .enqueue_channel(channel_id, self.update_priority)
                .is_queued()
            {
                report.enqueued += 1;
            }
        }
        report
    }

    /// Enqueue every channel the ledger still flags for a recheck.
    ///
    /// Forced channels always qualify; channels that were only updated
    /// qualify when the mode enqueues on update. Nothing is enqueued while
    /// disabled or during a sweep. Returns the number of channels queued.
    pub fn resume_pending(&self) -> usize {
        let mode = self.mode();
        if mode == PipelineMode::Disabled {
            return 0;
        }
        let gates = ModeGates::for_mode(mode);
        let pending = self.scheduler.ledger().lock().pending_channels();

        let mut enqueued = 0;
        for (channel_id, forced) in pending {
            if !forced && !gates.enqueue_on_update {
                continue;
            }
            if self
                .scheduler
                .enqueue_channel(&channel_id, self.update_priority)
                .is_queued()
            {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            info!(channels = enqueued, mode = %mode, "Pending rechecks enqueued");
        }
        enqueued
    }

    /// Manual steady-state enqueue.
    pub fn enqueue_channel(&self, channel_id: &str, priority: i32) -> EnqueueOutcome {
        self.scheduler.enqueue_channel(channel_id, priority)
    }

    /// Request a sweep now.
    ///
    /// Returns once the sweep is claimed; the driver task runs it.
    pub fn trigger_sweep(&self) -> Result<(), SweepError> {
        if self.mode() == PipelineMode::Disabled {
            return Err(SweepError::Disabled);
        }
        if !self.scheduler.queue().try_begin_sweep() {
            warn!("Sweep requested while one is running, rejected");
            return Err(SweepError::AlreadyRunning);
        }
        info!("Manual sweep requested");
        self.manual_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        Ok(())
    }

    /// Next scheduled sweep after `now`, if the mode schedules sweeps.
    pub fn next_sweep_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.gates().scheduled_sweep {
            return None;
        }
        self.schedule.as_ref()?.after(&now).next()
    }

    pub fn last_sweep(&self) -> Option<SweepReport> {
        self.last_sweep.lock().clone()
    }

    pub fn status(&self) -> PipelineStatus {
        let mode = self.mode();
        let gates = ModeGates::for_mode(mode);
        PipelineStatus {
            mode,
            enqueue_on_update: gates.enqueue_on_update,
            scheduled_sweep_enabled: gates.scheduled_sweep,
            sweep_in_progress: self.is_sweep_in_progress(),
            next_sweep_at: self
                .next_sweep_after(Utc::now())
                .map(|at| at.timestamp_millis()),
            last_sweep: self.last_sweep(),
        }
    }

    /// Drive scheduled and manual sweeps. Never returns.
    ///
    /// Between sweeps, channels left flagged by an incomplete pass are
    /// re-enqueued every `pending_interval`.
    pub async fn run(self: Arc<Self>) {
        let mut rescan = tokio::time::interval_at(
            tokio::time::Instant::now() + self.pending_interval,
            self.pending_interval,
        );
        rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let wait = self.next_sweep_after(Utc::now()).map(|at| {
                (at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            });

            tokio::select! {
                _ = self.wake.notified() => {
                    if self.manual_requested.swap(false, Ordering::SeqCst) {
                        self.execute_sweep(SweepTrigger::Manual).await;
                    }
                }
                _ = sleep_or_pending(wait) => {
                    if !self.gates().scheduled_sweep {
                        continue;
                    }
                    if self.scheduler.queue().try_begin_sweep() {
                        info!("Scheduled sweep starting");
                        self.execute_sweep(SweepTrigger::Scheduled).await;
                    } else {
                        warn!("Scheduled sweep skipped, a sweep is already running");
                    }
                }
                _ = rescan.tick() => {
                    self.resume_pending();
                }
            }
        }
    }

    /// Claim and run a sweep to completion.
    pub async fn run_sweep(&self) -> Result<SweepReport, SweepError> {
        if self.mode() == PipelineMode::Disabled {
            return Err(SweepError::Disabled);
        }
        if !self.scheduler.queue().try_begin_sweep() {
            return Err(SweepError::AlreadyRunning);
        }
        Ok(self.execute_sweep(SweepTrigger::Manual).await)
    }

    /// Sweep body; the caller holds the sweep flag, which is cleared here.
    async fn execute_sweep(&self, trigger: SweepTrigger) -> SweepReport {
        let started_at = current_timestamp_ms();
        let catalog = self.scheduler.catalog();
        let mut errors = Vec::new();
        info!(?trigger, "Sweep started");

        if let Err(e) = catalog.refresh_sources().await {
            warn!(error = %e, "Source refresh failed, continuing with current data");
            errors.push(format!("refresh_sources: {}", e));
        }
        if let Err(e) = catalog.rediscover_matches().await {
            warn!(error = %e, "Match rediscovery failed, continuing with current matches");
            errors.push(format!("rediscover_matches: {}", e));
        }
        match catalog.provider_limits().await {
            Ok(limits) => self.scheduler.admission().set_provider_limits(limits),
            Err(e) => {
                warn!(error = %e, "Failed to reload provider limits");
                errors.push(format!("provider_limits: {}", e));
            }
        }

        let mut channels = 0;
        match catalog.channels_with_providers().await {
            Ok(listing) => {
                {
                    let mut ledger = self.scheduler.ledger().lock();
                    for channel in &listing {
                        ledger.sync_channel(channel);
                        ledger.mark_force(&channel.channel_id);
                    }
                }
                let queue = self.scheduler.queue();
                for channel in &listing {
                    queue.enqueue(&channel.channel_id, self.sweep_priority, EnqueueOrigin::Sweep);
                }
                channels = listing.len();
                queue.wait_idle().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to list channels, sweep aborted");
                errors.push(format!("channels_with_providers: {}", e));
            }
        }

        self.scheduler.queue().end_sweep();
        // Updates that arrived while the steady-state path was closed
        self.resume_pending();
        self.scheduler.persist();

        let report = SweepReport {
            trigger,
            started_at,
            finished_at: current_timestamp_ms(),
            channels,
            errors,
        };
        info!(
            channels = report.channels,
            errors = report.errors.len(),
            duration_ms = report.finished_at - report.started_at,
            "Sweep finished"
        );
        *self.last_sweep.lock() = Some(report.clone());
        report
    }
}

async fn sleep_or_pending(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}
