//! Update/immunity ledger deciding which streams are due for a probe.
//!
//! The ledger tracks, per channel, whether a recheck was requested and whether
//! a forced pass is pending, and per stream when it was last checked and what
//! the outcome was. Unknown identifiers are never an error: unknown streams
//! are always due and updates for unknown channels are remembered.

use crate::catalog::{ChannelId, ChannelStreams, StreamId, StreamSource};
use crate::scorer::QualityVerdict;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::debug;

/// Liveness state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    #[default]
    Alive,
    Dead,
    /// A dead stream being re-probed by a forced pass.
    Reviving,
}

/// Why a check produced no quality facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Error,
}

/// Result of one stream check as recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CheckOutcome {
    /// The probe returned facts and they were scored.
    Scored(QualityVerdict),
    /// Every attempt failed; previous score and liveness are kept.
    Failed(FailureKind),
}

/// Per-stream ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub stream_id: StreamId,
    pub channel_id: ChannelId,
    pub provider_id: String,
    pub url: String,
    /// Unix timestamp (milliseconds) of the last completed check.
    pub last_checked: Option<i64>,
    pub score: Option<f32>,
    #[serde(default)]
    pub liveness: Liveness,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_failure: Option<FailureKind>,
}

impl StreamRecord {
    fn from_source(channel_id: &str, source: &StreamSource) -> Self {
        Self {
            stream_id: source.stream_id.clone(),
            channel_id: channel_id.to_string(),
            provider_id: source.provider_id.clone(),
            url: source.url.clone(),
            last_checked: None,
            score: None,
            liveness: Liveness::Alive,
            consecutive_failures: 0,
            last_failure: None,
        }
    }

    pub fn source(&self) -> StreamSource {
        StreamSource {
            stream_id: self.stream_id.clone(),
            url: self.url.clone(),
            provider_id: self.provider_id.clone(),
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.liveness, Liveness::Dead | Liveness::Reviving)
    }
}

/// Per-channel ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: ChannelId,
    /// Member streams in their current order, dead streams included.
    #[serde(default)]
    pub streams: Vec<StreamId>,
    #[serde(default)]
    pub needs_check: bool,
    #[serde(default)]
    pub force_check: bool,
    pub last_checked: Option<i64>,
    /// Streams still to be visited before the force flag clears.
    #[serde(default)]
    pub force_pending: BTreeSet<StreamId>,
}

impl ChannelRecord {
    fn new(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            streams: Vec::new(),
            needs_check: false,
            force_check: false,
            last_checked: None,
            force_pending: BTreeSet::new(),
        }
    }
}

/// Tracks due-ness and outcomes for every known channel and stream.
#[derive(Debug, Clone)]
pub struct Ledger {
    cooldown_ms: i64,
    channels: HashMap<ChannelId, ChannelRecord>,
    streams: HashMap<StreamId, StreamRecord>,
}

impl Ledger {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown_ms: i64::try_from(cooldown.as_millis()).unwrap_or(i64::MAX),
            channels: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    /// Rebuild a ledger from persisted records.
    pub fn restore(
        cooldown: Duration,
        channels: Vec<ChannelRecord>,
        streams: Vec<StreamRecord>,
    ) -> Self {
        let mut ledger = Self::new(cooldown);
        ledger.channels = channels
            .into_iter()
            .map(|c| (c.channel_id.clone(), c))
            .collect();
        ledger.streams = streams
            .into_iter()
            .map(|mut s| {
                // A revival interrupted by a restart is still a dead stream.
                if s.liveness == Liveness::Reviving {
                    s.liveness = Liveness::Dead;
                }
                (s.stream_id.clone(), s)
            })
            .collect();
        ledger
    }

    /// Export all records, sorted by id for stable output.
    pub fn export(&self) -> (Vec<ChannelRecord>, Vec<StreamRecord>) {
        let mut channels: Vec<_> = self.channels.values().cloned().collect();
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        let mut streams: Vec<_> = self.streams.values().cloned().collect();
        streams.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        (channels, streams)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms.max(0) as u64)
    }

    pub fn channel(&self, channel_id: &str) -> Option<&ChannelRecord> {
        self.channels.get(channel_id)
    }

    pub fn stream(&self, stream_id: &str) -> Option<&StreamRecord> {
        self.streams.get(stream_id)
    }

    /// Channels with a recheck or forced pass still outstanding, sorted by
    /// id. The flag says whether the pending pass is forced.
    pub fn pending_channels(&self) -> Vec<(ChannelId, bool)> {
        let mut pending: Vec<(ChannelId, bool)> = self
            .channels
            .values()
            .filter(|c| c.needs_check || c.force_check)
            .map(|c| (c.channel_id.clone(), c.force_check))
            .collect();
        pending.sort();
        pending
    }

    /// Drop a channel the catalog no longer knows, with the streams only it
    /// referenced.
    pub fn forget_channel(&mut self, channel_id: &str) {
        let Some(record) = self.channels.remove(channel_id) else {
            return;
        };
        for stream_id in &record.streams {
            self.release_stream(stream_id, channel_id);
        }
    }

    /// Another channel still listing the stream, if any.
    fn other_owner(&self, stream_id: &str, channel_id: &str) -> Option<ChannelId> {
        self.channels
            .values()
            .filter(|c| c.channel_id != channel_id)
            .find(|c| c.streams.iter().any(|s| s == stream_id))
            .map(|c| c.channel_id.clone())
    }

    /// `channel_id` stopped listing the stream: hand it to another channel
    /// that lists it, or forget it.
    fn release_stream(&mut self, stream_id: &str, channel_id: &str) {
        match self.other_owner(stream_id, channel_id) {
            Some(owner) => {
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    if stream.channel_id == channel_id {
                        stream.channel_id = owner;
                    }
                }
            }
            None => {
                self.streams.remove(stream_id);
            }
        }
    }

    /// Bring channel membership in line with the catalog.
    ///
    /// Streams the catalog no longer lists are forgotten unless they are dead
    /// or another channel still lists them: dead streams were dropped from
    /// the channel by an earlier ranking and stay known so a forced pass can
    /// revive them.
    pub fn sync_channel(&mut self, channel: &ChannelStreams) {
        let channel_id = channel.channel_id.as_str();
        let previous = self
            .channels
            .get(channel_id)
            .map(|c| c.streams.clone())
            .unwrap_or_default();

        let listed: BTreeSet<&str> = channel
            .streams
            .iter()
            .map(|s| s.stream_id.as_str())
            .collect();

        let mut members: Vec<StreamId> = channel
            .streams
            .iter()
            .map(|s| s.stream_id.clone())
            .collect();
        let mut released = Vec::new();
        for id in &previous {
            if listed.contains(id.as_str()) {
                continue;
            }
            let dead = self.streams.get(id).is_some_and(StreamRecord::is_dead);
            if dead {
                members.push(id.clone());
            } else {
                released.push(id.clone());
            }
        }

        let record = self
            .channels
            .entry(channel.channel_id.clone())
            .or_insert_with(|| ChannelRecord::new(channel_id));
        record
            .force_pending
            .retain(|id| members.iter().any(|member| member == id));
        if record.force_check {
            for member in &members {
                if !record.streams.contains(member) {
                    record.force_pending.insert(member.clone());
                }
            }
        }
        record.streams = members;

        for id in &released {
            self.release_stream(id, channel_id);
        }

        for source in &channel.streams {
            let entry = self
                .streams
                .entry(source.stream_id.clone())
                .or_insert_with(|| StreamRecord::from_source(channel_id, source));
            entry.channel_id = channel.channel_id.clone();
            entry.url = source.url.clone();
            entry.provider_id = source.provider_id.clone();
        }
    }

    /// Member streams of a channel, in order, dead streams included.
    pub fn members(&self, channel_id: &str) -> Vec<StreamSource> {
        self.channels
            .get(channel_id)
            .map(|c| {
                c.streams
                    .iter()
                    .filter_map(|id| self.streams.get(id))
                    .map(StreamRecord::source)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Upstream content of the channel changed; a recheck is needed.
    pub fn mark_updated(&mut self, channel_id: &str) {
        self.channels
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelRecord::new(channel_id))
            .needs_check = true;
    }

    /// Override the cooldown for every stream of the channel, once.
    pub fn mark_force(&mut self, channel_id: &str) {
        let record = self
            .channels
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelRecord::new(channel_id));
        record.force_check = true;
        record.needs_check = true;
        record.force_pending = record.streams.iter().cloned().collect();
    }

    pub fn is_forced(&self, channel_id: &str) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|c| c.force_check)
    }

    /// The stream's own channel is forced, or another forced channel still
    /// has it pending.
    fn is_forced_for(&self, stream: &StreamRecord) -> bool {
        self.is_forced(&stream.channel_id)
            || self
                .channels
                .values()
                .any(|c| c.force_check && c.force_pending.contains(&stream.stream_id))
    }

    /// True when the stream's channel is forced, the stream was never
    /// checked, or the cooldown window has elapsed.
    pub fn is_due(&self, stream_id: &str, now: i64) -> bool {
        let Some(stream) = self.streams.get(stream_id) else {
            return true;
        };
        if self.is_forced_for(stream) {
            return true;
        }
        match stream.last_checked {
            None => true,
            Some(checked) => now.saturating_sub(checked) > self.cooldown_ms,
        }
    }

    /// Whether the worker should probe the stream in this pass.
    ///
    /// Dead streams are left alone outside forced passes.
    pub fn should_probe(&self, stream_id: &str, now: i64) -> bool {
        if !self.is_due(stream_id, now) {
            return false;
        }
        match self.streams.get(stream_id) {
            Some(stream) if stream.is_dead() => self.is_forced_for(stream),
            _ => true,
        }
    }

    /// Flag a dead stream as being re-probed.
    pub fn begin_revival(&mut self, stream_id: &str) {
        if let Some(stream) = self.streams.get_mut(stream_id) {
            if stream.liveness == Liveness::Dead {
                stream.liveness = Liveness::Reviving;
            }
        }
    }

    /// Record the outcome of a stream check.
    ///
    /// Returns false when the stream is unknown.
    pub fn record_result(&mut self, stream_id: &str, now: i64, outcome: CheckOutcome) -> bool {
        let Some(stream) = self.streams.get_mut(stream_id) else {
            debug!(stream_id, "Ignoring result for unknown stream");
            return false;
        };

        stream.last_checked = Some(now);
        match outcome {
            CheckOutcome::Scored(verdict) => {
                stream.score = Some(verdict.score);
                stream.liveness = verdict.liveness;
                stream.consecutive_failures = 0;
                stream.last_failure = None;
            }
            CheckOutcome::Failed(kind) => {
                stream.consecutive_failures = stream.consecutive_failures.saturating_add(1);
                stream.last_failure = Some(kind);
                if stream.liveness == Liveness::Reviving {
                    stream.liveness = Liveness::Dead;
                }
            }
        }

        // A shared stream counts as visited for every channel listing it
        let owner = stream.channel_id.clone();
        for channel in self.channels.values_mut() {
            let visited = channel.force_pending.remove(stream_id);
            if (visited || channel.channel_id == owner)
                && channel.force_check
                && channel.force_pending.is_empty()
            {
                channel.force_check = false;
            }
        }
        true
    }

    /// Close a channel pass.
    ///
    /// `complete` is false when some due streams were skipped; the channel
    /// then stays flagged for the next pass.
    pub fn finish_pass(&mut self, channel_id: &str, now: i64, complete: bool) {
        if let Some(channel) = self.channels.get_mut(channel_id) {
            channel.last_checked = Some(now);
            if complete {
                channel.needs_check = false;
                if channel.force_pending.is_empty() {
                    channel.force_check = false;
                }
            }
        }
    }

    /// Alive member streams ordered by score, best first.
    ///
    /// Ties keep the previous order. Unscored streams rank after scored ones.
    pub fn rank(&self, channel_id: &str) -> Vec<StreamId> {
        let Some(channel) = self.channels.get(channel_id) else {
            return Vec::new();
        };
        let mut alive: Vec<(&StreamId, f32)> = channel
            .streams
            .iter()
            .filter_map(|id| self.streams.get(id).map(|s| (id, s)))
            .filter(|(_, s)| !s.is_dead())
            .map(|(id, s)| (id, s.score.unwrap_or(-1.0)))
            .collect();
        // sort_by is stable, so equal scores keep their previous positions
        alive.sort_by(|a, b| b.1.total_cmp(&a.1));
        alive.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Dead member streams of a channel.
    pub fn dead_streams(&self, channel_id: &str) -> Vec<StreamId> {
        self.channels
            .get(channel_id)
            .map(|c| {
                c.streams
                    .iter()
                    .filter(|id| self.streams.get(*id).is_some_and(StreamRecord::is_dead))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
