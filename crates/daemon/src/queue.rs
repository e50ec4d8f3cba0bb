//! Priority work queue of channels awaiting a check.
//!
//! Higher priority pops first; equal priorities pop in insertion order. A
//! channel is at most once in the queue and at most once in progress. The
//! sweep flag lives here because this is the single entry point through
//! which channels are admitted into the queue.

use crate::catalog::ChannelId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Which control path is asking for a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOrigin {
    /// Update events and manual requests.
    SteadyState,
    /// The global sweep.
    Sweep,
}

/// Effect of an enqueue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Queued,
    AlreadyQueued,
    InProgress,
    /// The channel is being checked; one more pass follows this one.
    RerunScheduled,
    /// Steady-state enqueues are suspended while a sweep runs.
    SweepActive,
}

impl EnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, EnqueueOutcome::Queued | EnqueueOutcome::RerunScheduled)
    }
}

/// Pollable queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub depth: usize,
    pub in_progress: usize,
    pub in_progress_channels: Vec<ChannelId>,
    pub enqueued_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    seq: u64,
    channel_id: ChannelId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence number first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    queued: HashSet<ChannelId>,
    in_progress: BTreeSet<ChannelId>,
    reruns: HashMap<ChannelId, i32>,
    next_seq: u64,
}

impl QueueInner {
    fn push(&mut self, channel_id: &str, priority: i32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued.insert(channel_id.to_string());
        self.heap.push(QueueEntry {
            priority,
            seq,
            channel_id: channel_id.to_string(),
        });
    }

    fn is_idle(&self) -> bool {
        self.heap.is_empty() && self.in_progress.is_empty()
    }
}

/// Channel work queue shared by the enqueue paths and the worker loop.
#[derive(Debug, Default)]
pub struct ChannelQueue {
    inner: Mutex<QueueInner>,
    sweep_active: AtomicBool,
    depth: AtomicUsize,
    in_progress: AtomicUsize,
    enqueued_total: AtomicU64,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    work: Notify,
    idle: Notify,
}

impl ChannelQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a channel into the queue.
    ///
    /// Steady-state requests are dropped while a sweep runs. Requests for a
    /// channel that is already queued or in progress are no-ops, except that
    /// a sweep request for an in-progress channel schedules one rerun.
    pub fn enqueue(&self, channel_id: &str, priority: i32, origin: EnqueueOrigin) -> EnqueueOutcome {
        let mut inner = self.inner.lock();

        if origin == EnqueueOrigin::SteadyState && self.sweep_active.load(AtomicOrdering::Acquire) {
            debug!(channel_id, "Sweep in progress, steady-state enqueue ignored");
            return EnqueueOutcome::SweepActive;
        }
        if inner.queued.contains(channel_id) {
            info!(channel_id, "Channel already queued");
            return EnqueueOutcome::AlreadyQueued;
        }
        if inner.in_progress.contains(channel_id) {
            if origin == EnqueueOrigin::Sweep {
                let rerun = inner.reruns.entry(channel_id.to_string()).or_insert(priority);
                *rerun = (*rerun).max(priority);
                debug!(channel_id, "Channel in progress, rerun scheduled");
                return EnqueueOutcome::RerunScheduled;
            }
            info!(channel_id, "Channel already in progress");
            return EnqueueOutcome::InProgress;
        }

        inner.push(channel_id, priority);
        self.depth.store(inner.heap.len(), AtomicOrdering::Release);
        self.enqueued_total.fetch_add(1, AtomicOrdering::Relaxed);
        drop(inner);

        debug!(channel_id, priority, ?origin, "Channel enqueued");
        self.work.notify_one();
        EnqueueOutcome::Queued
    }

    /// Pop the next channel and mark it in progress.
    pub fn pop(&self) -> Option<ChannelId> {
        let mut inner = self.inner.lock();
        let entry = inner.heap.pop()?;
        inner.queued.remove(&entry.channel_id);
        inner.in_progress.insert(entry.channel_id.clone());
        self.depth.store(inner.heap.len(), AtomicOrdering::Release);
        self.in_progress
            .store(inner.in_progress.len(), AtomicOrdering::Release);
        Some(entry.channel_id)
    }

    /// Wait for the next channel.
    pub async fn next(&self) -> ChannelId {
        loop {
            let notified = self.work.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(channel_id) = self.pop() {
                return channel_id;
            }
            notified.await;
        }
    }

    /// Close a channel pass, counting it as completed or failed.
    pub fn complete(&self, channel_id: &str, success: bool) {
        let mut inner = self.inner.lock();
        if !inner.in_progress.remove(channel_id) {
            debug!(channel_id, "Completion for channel not in progress");
            return;
        }
        if success {
            self.completed_total.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.failed_total.fetch_add(1, AtomicOrdering::Relaxed);
        }

        let rerun = inner.reruns.remove(channel_id);
        if let Some(priority) = rerun {
            inner.push(channel_id, priority);
            self.enqueued_total.fetch_add(1, AtomicOrdering::Relaxed);
        }
        self.depth.store(inner.heap.len(), AtomicOrdering::Release);
        self.in_progress
            .store(inner.in_progress.len(), AtomicOrdering::Release);
        let idle = inner.is_idle();
        drop(inner);

        if rerun.is_some() {
            self.work.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(AtomicOrdering::Acquire)
    }

    pub fn in_progress_count(&self) -> usize {
        self.in_progress.load(AtomicOrdering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.inner.lock().is_idle()
    }

    /// Wait until nothing is queued or in progress.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn status(&self) -> QueueStatus {
        let in_progress_channels: Vec<ChannelId> =
            self.inner.lock().in_progress.iter().cloned().collect();
        QueueStatus {
            depth: self.depth(),
            in_progress: in_progress_channels.len(),
            in_progress_channels,
            enqueued_total: self.enqueued_total.load(AtomicOrdering::Relaxed),
            completed_total: self.completed_total.load(AtomicOrdering::Relaxed),
            failed_total: self.failed_total.load(AtomicOrdering::Relaxed),
        }
    }

    /// Raise the sweep flag. Returns false when a sweep already runs.
    pub fn try_begin_sweep(&self) -> bool {
        let _inner = self.inner.lock();
        self.sweep_active
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }

    pub fn end_sweep(&self) {
        let _inner = self.inner.lock();
        self.sweep_active.store(false, AtomicOrdering::Release);
    }

    pub fn is_sweep_active(&self) -> bool {
        self.sweep_active.load(AtomicOrdering::Acquire)
    }
}
