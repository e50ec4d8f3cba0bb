//! Admission control module for the stream checker
//!
//! Gates every probe behind two nested ceilings: a global ceiling on probes
//! in flight and a per-provider ceiling. Counters and tickets live in an
//! [`AdmissionStore`]; the SQLite store lets several worker processes share
//! one budget.

mod sqlite;
mod store;

pub use sqlite::SqliteStore;
pub use store::{AdmissionStore, AdmissionTicket, MemoryStore, ResetReport, StoreUsage};

use crate::catalog::ProviderId;
use crate::concurrency::{BackoffPolicy, ConcurrencyPlan};
use crate::config::{AdmissionBackend, AdmissionConfig};
use crate::state::current_timestamp_ms;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors raised by an admission store.
///
/// Ceiling exhaustion is not an error; acquisition then yields `None`.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// SQLite store failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error while preparing the store location
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A ticket id was claimed twice
    #[error("Ticket already exists: {0}")]
    DuplicateTicket(String),

    #[error("Admission task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Limit and current usage of one ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeilingUsage {
    /// Configured ceiling, 0 = unlimited
    pub limit: u32,
    pub used: u32,
}

/// Pollable view of the admission state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStatus {
    pub global: CeilingUsage,
    pub providers: BTreeMap<ProviderId, CeilingUsage>,
    /// Outstanding tickets
    pub tickets: usize,
    pub oldest_ticket_age_ms: Option<i64>,
}

/// Enforces the global and per-provider probe ceilings.
pub struct AdmissionController {
    store: Arc<dyn AdmissionStore>,
    global_ceiling: u32,
    default_provider_limit: u32,
    limits: RwLock<HashMap<ProviderId, u32>>,
    backoff: BackoffPolicy,
    stale_after: Duration,
    released: Notify,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn AdmissionStore>, global_ceiling: u32) -> Self {
        Self {
            store,
            global_ceiling,
            default_provider_limit: 0,
            limits: RwLock::new(HashMap::new()),
            backoff: BackoffPolicy::default(),
            stale_after: Duration::from_secs(900),
            released: Notify::new(),
        }
    }

    /// Build a controller from configuration, opening the configured store.
    pub fn from_config(cfg: &AdmissionConfig, plan: &ConcurrencyPlan) -> Result<Self, AdmissionError> {
        let store: Arc<dyn AdmissionStore> = match cfg.backend {
            AdmissionBackend::Memory => Arc::new(MemoryStore::new()),
            AdmissionBackend::Sqlite => Arc::new(SqliteStore::open(&cfg.store_path)?),
        };
        info!(
            backend = ?cfg.backend,
            global_ceiling = plan.global_ceiling,
            default_provider_limit = cfg.default_provider_limit,
            "Admission controller ready"
        );
        Ok(Self::new(store, plan.global_ceiling)
            .with_default_provider_limit(cfg.default_provider_limit)
            .with_stale_after(Duration::from_secs(cfg.stale_ticket_secs)))
    }

    pub fn with_default_provider_limit(mut self, limit: u32) -> Self {
        self.default_provider_limit = limit;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn global_ceiling(&self) -> u32 {
        self.global_ceiling
    }

    /// Replace the per-provider limits.
    ///
    /// Tickets already above a lowered limit run to completion; only new
    /// acquisitions wait until usage drops below it.
    pub fn set_provider_limits(&self, limits: HashMap<ProviderId, u32>) {
        *self.limits.write() = limits;
        // Raised limits may admit waiters right away
        self.released.notify_waiters();
    }

    pub fn provider_limits(&self) -> HashMap<ProviderId, u32> {
        self.limits.read().clone()
    }

    pub fn provider_limit(&self, provider_id: &str) -> u32 {
        self.limits
            .read()
            .get(provider_id)
            .copied()
            .unwrap_or(self.default_provider_limit)
    }

    /// Wait up to `timeout` for a slot under both ceilings.
    ///
    /// Retries with exponential backoff and wakes early when a local permit
    /// is released. Returns `Ok(None)` once the timeout has elapsed.
    pub async fn try_acquire(
        self: &Arc<Self>,
        provider_id: &str,
        stream_id: &str,
        timeout: Duration,
    ) -> Result<Option<AdmissionPermit>, AdmissionError> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ticket = AdmissionTicket {
                ticket_id: Uuid::new_v4().to_string(),
                provider_id: provider_id.to_string(),
                stream_id: stream_id.to_string(),
                started_at: current_timestamp_ms(),
            };
            let provider_ceiling = self.provider_limit(provider_id);
            if self.claim(&ticket, provider_ceiling).await? {
                debug!(provider_id, stream_id, ticket_id = %ticket.ticket_id, attempt, "Admission granted");
                return Ok(Some(AdmissionPermit {
                    controller: Arc::clone(self),
                    ticket,
                    released: false,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(provider_id, stream_id, attempts = attempt + 1, "Admission timed out");
                return Ok(None);
            }
            let delay = self.backoff.backoff_delay(attempt).min(deadline - now);
            attempt = attempt.saturating_add(1);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One claim attempt, off the async threads when the store can block.
    ///
    /// Release, status and reset stay inline: each is one short statement
    /// and release runs from `Drop`.
    async fn claim(
        &self,
        ticket: &AdmissionTicket,
        provider_ceiling: u32,
    ) -> Result<bool, AdmissionError> {
        if !self.store.is_blocking() {
            return self
                .store
                .try_claim(ticket, self.global_ceiling, provider_ceiling);
        }
        let store = Arc::clone(&self.store);
        let ticket = ticket.clone();
        let global_ceiling = self.global_ceiling;
        tokio::task::spawn_blocking(move || {
            store.try_claim(&ticket, global_ceiling, provider_ceiling)
        })
        .await?
    }

    /// Release a ticket by id. Returns false when it was already gone.
    pub fn release(&self, ticket_id: &str) -> Result<bool, AdmissionError> {
        let released = self.store.release(ticket_id)?;
        match &released {
            Some(ticket) => {
                debug!(ticket_id, provider_id = %ticket.provider_id, "Admission released");
                self.released.notify_waiters();
            }
            None => debug!(ticket_id, "Ticket already released"),
        }
        Ok(released.is_some())
    }

    /// Current limits and usage.
    pub fn status(&self) -> Result<AdmissionStatus, AdmissionError> {
        let usage = self.store.usage()?;
        let tickets = self.store.tickets()?;
        let now = current_timestamp_ms();

        let mut providers: BTreeMap<ProviderId, CeilingUsage> = self
            .limits
            .read()
            .iter()
            .map(|(id, limit)| {
                (
                    id.clone(),
                    CeilingUsage {
                        limit: *limit,
                        used: 0,
                    },
                )
            })
            .collect();
        for (id, used) in usage.providers {
            let limit = self.provider_limit(&id);
            providers
                .entry(id)
                .or_insert(CeilingUsage { limit, used: 0 })
                .used = used;
        }

        Ok(AdmissionStatus {
            global: CeilingUsage {
                limit: self.global_ceiling,
                used: usage.global,
            },
            providers,
            tickets: tickets.len(),
            oldest_ticket_age_ms: tickets
                .iter()
                .map(|t| t.started_at)
                .min()
                .map(|started| now.saturating_sub(started).max(0)),
        })
    }

    /// Zero every counter and delete every ticket.
    pub fn reset(&self) -> Result<ResetReport, AdmissionError> {
        let report = self.store.reset()?;
        warn!(
            tickets_removed = report.tickets_removed,
            global_cleared = report.global_cleared,
            "Admission counters reset"
        );
        self.released.notify_waiters();
        Ok(report)
    }

    /// Roll back tickets older than the stale threshold.
    pub fn reap_stale(&self) -> Result<usize, AdmissionError> {
        let stale_ms = i64::try_from(self.stale_after.as_millis()).unwrap_or(i64::MAX);
        let cutoff = current_timestamp_ms().saturating_sub(stale_ms);
        let reaped = self.store.reap_stale(cutoff)?;
        if !reaped.is_empty() {
            for ticket in &reaped {
                debug!(
                    ticket_id = %ticket.ticket_id,
                    provider_id = %ticket.provider_id,
                    stream_id = %ticket.stream_id,
                    "Reaped orphaned ticket"
                );
            }
            warn!(count = reaped.len(), "Orphaned admission tickets reaped");
            self.released.notify_waiters();
        }
        Ok(reaped.len())
    }

    /// Periodically reap orphaned tickets. Never returns.
    pub async fn run_reconciler(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            if let Err(e) = self.reap_stale() {
                error!(error = %e, "Admission reconciliation failed");
            }
        }
    }
}

/// A granted slot. Dropping it without [`AdmissionPermit::release`]
/// still gives the slot back.
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    ticket: AdmissionTicket,
    released: bool,
}

impl AdmissionPermit {
    pub fn ticket(&self) -> &AdmissionTicket {
        &self.ticket
    }

    pub fn release(mut self) -> Result<bool, AdmissionError> {
        self.released = true;
        self.controller.release(&self.ticket.ticket_id)
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.controller.release(&self.ticket.ticket_id) {
            error!(ticket_id = %self.ticket.ticket_id, error = %e, "Failed to release admission ticket");
        }
    }
}
