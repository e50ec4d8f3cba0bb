//! Admission ticket stores.
//!
//! A store owns the in-flight counters and the ticket set. Every method is a
//! single atomic step: a claim checks both ceilings, inserts the ticket and
//! bumps both counters, or does nothing at all.

use super::AdmissionError;
use crate::catalog::{ProviderId, StreamId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One in-flight probe's claim on the concurrency budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionTicket {
    pub ticket_id: String,
    pub provider_id: ProviderId,
    pub stream_id: StreamId,
    /// Unix timestamp (milliseconds) when the claim was made.
    pub started_at: i64,
}

/// Counter values as recorded by a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub global: u32,
    pub providers: BTreeMap<ProviderId, u32>,
}

/// What an administrative reset corrected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetReport {
    /// Tickets deleted.
    pub tickets_removed: usize,
    /// In-flight units the global counter held before zeroing.
    pub global_cleared: u32,
}

/// Shared counter/ticket store.
///
/// Ceilings of `0` mean unlimited.
pub trait AdmissionStore: Send + Sync {
    /// Claim one slot for `ticket` if both ceilings allow it.
    fn try_claim(
        &self,
        ticket: &AdmissionTicket,
        global_ceiling: u32,
        provider_ceiling: u32,
    ) -> Result<bool, AdmissionError>;

    /// Delete a ticket and give back its slot.
    ///
    /// Returns the deleted ticket, or `None` when it was already gone.
    fn release(&self, ticket_id: &str) -> Result<Option<AdmissionTicket>, AdmissionError>;

    fn usage(&self) -> Result<StoreUsage, AdmissionError>;

    fn tickets(&self) -> Result<Vec<AdmissionTicket>, AdmissionError>;

    /// Release every ticket started before `cutoff_ms`.
    fn reap_stale(&self, cutoff_ms: i64) -> Result<Vec<AdmissionTicket>, AdmissionError>;

    /// Zero every counter and delete every ticket.
    fn reset(&self) -> Result<ResetReport, AdmissionError>;

    /// Whether a claim can wait on another process, so callers on an async
    /// runtime must move it to a blocking thread.
    fn is_blocking(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    global: u32,
    providers: HashMap<ProviderId, u32>,
    tickets: HashMap<String, AdmissionTicket>,
}

impl MemoryInner {
    fn remove(&mut self, ticket_id: &str) -> Option<AdmissionTicket> {
        let ticket = self.tickets.remove(ticket_id)?;
        self.global = self.global.saturating_sub(1);
        if let Some(used) = self.providers.get_mut(&ticket.provider_id) {
            *used = used.saturating_sub(1);
            if *used == 0 {
                self.providers.remove(&ticket.provider_id);
            }
        }
        Some(ticket)
    }
}

/// Process-local store for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a ticket without checking ceilings.
    ///
    /// Models a worker that crashed after claiming; used to exercise
    /// reconciliation.
    #[cfg(test)]
    pub(crate) fn insert_orphan(&self, ticket: AdmissionTicket) {
        let mut inner = self.inner.lock();
        inner.global += 1;
        *inner.providers.entry(ticket.provider_id.clone()).or_insert(0) += 1;
        inner.tickets.insert(ticket.ticket_id.clone(), ticket);
    }
}

fn within(used: u32, ceiling: u32) -> bool {
    ceiling == 0 || used < ceiling
}

impl AdmissionStore for MemoryStore {
    fn try_claim(
        &self,
        ticket: &AdmissionTicket,
        global_ceiling: u32,
        provider_ceiling: u32,
    ) -> Result<bool, AdmissionError> {
        let mut inner = self.inner.lock();
        if inner.tickets.contains_key(&ticket.ticket_id) {
            return Err(AdmissionError::DuplicateTicket(ticket.ticket_id.clone()));
        }
        let provider_used = inner
            .providers
            .get(&ticket.provider_id)
            .copied()
            .unwrap_or(0);
        if !within(inner.global, global_ceiling) || !within(provider_used, provider_ceiling) {
            return Ok(false);
        }

        inner.global += 1;
        *inner.providers.entry(ticket.provider_id.clone()).or_insert(0) += 1;
        inner.tickets.insert(ticket.ticket_id.clone(), ticket.clone());
        Ok(true)
    }

    fn release(&self, ticket_id: &str) -> Result<Option<AdmissionTicket>, AdmissionError> {
        Ok(self.inner.lock().remove(ticket_id))
    }

    fn usage(&self) -> Result<StoreUsage, AdmissionError> {
        let inner = self.inner.lock();
        Ok(StoreUsage {
            global: inner.global,
            providers: inner
                .providers
                .iter()
                .map(|(id, used)| (id.clone(), *used))
                .collect(),
        })
    }

    fn tickets(&self) -> Result<Vec<AdmissionTicket>, AdmissionError> {
        let mut tickets: Vec<_> = self.inner.lock().tickets.values().cloned().collect();
        tickets.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(tickets)
    }

    fn reap_stale(&self, cutoff_ms: i64) -> Result<Vec<AdmissionTicket>, AdmissionError> {
        let mut inner = self.inner.lock();
        let stale: Vec<String> = inner
            .tickets
            .values()
            .filter(|t| t.started_at < cutoff_ms)
            .map(|t| t.ticket_id.clone())
            .collect();
        Ok(stale.iter().filter_map(|id| inner.remove(id)).collect())
    }

    fn reset(&self) -> Result<ResetReport, AdmissionError> {
        let mut inner = self.inner.lock();
        let report = ResetReport {
            tickets_removed: inner.tickets.len(),
            global_cleared: inner.global,
        };
        *inner = MemoryInner::default();
        Ok(report)
    }
}
