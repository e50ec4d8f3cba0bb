//! In-memory collaborators for tests.

use crate::catalog::{
    CatalogError, ChannelCatalog, ChannelId, ChannelStreams, ProviderId, StreamId, StreamSource,
};
use crate::probe::{ErrorFlags, ProbeError, ProbeFacts, Prober, Resolution};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn stream_url(provider: &str, stream: &str) -> String {
    format!("http://{}/{}", provider, stream)
}

fn split_url(url: &str) -> (String, String) {
    let rest = url.trim_start_matches("http://");
    match rest.split_once('/') {
        Some((provider, stream)) => (provider.to_string(), stream.to_string()),
        None => (rest.to_string(), String::new()),
    }
}

/// A healthy 1080p stream.
pub fn hd_facts() -> ProbeFacts {
    ProbeFacts {
        resolution: Resolution::new(1920, 1080),
        bitrate_kbps: 5000.0,
        fps: 25.0,
        video_codec: Some("h264".to_string()),
        audio_codec: Some("aac".to_string()),
        error_flags: ErrorFlags::default(),
    }
}

#[derive(Default)]
struct CatalogData {
    providers: BTreeMap<ProviderId, u32>,
    pool: HashMap<StreamId, StreamSource>,
    channels: Vec<(ChannelId, Vec<StreamId>)>,
    applied: HashMap<ChannelId, Vec<StreamId>>,
}

/// Catalog held in memory that records applied orderings.
#[derive(Default)]
pub struct FakeCatalog {
    data: Mutex<CatalogData>,
    pub refreshes: AtomicUsize,
    pub rediscoveries: AtomicUsize,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(self, provider: &str, max_concurrent: u32) -> Self {
        self.data
            .lock()
            .providers
            .insert(provider.to_string(), max_concurrent);
        self
    }

    /// Add a channel from `(stream_id, provider_id)` pairs.
    pub fn with_channel(self, channel: &str, streams: &[(&str, &str)]) -> Self {
        {
            let mut data = self.data.lock();
            for (stream, provider) in streams {
                data.pool.insert(
                    stream.to_string(),
                    StreamSource {
                        stream_id: stream.to_string(),
                        url: stream_url(provider, stream),
                        provider_id: provider.to_string(),
                    },
                );
            }
            data.channels.push((
                channel.to_string(),
                streams.iter().map(|(s, _)| s.to_string()).collect(),
            ));
        }
        self
    }

    pub fn limits(&self) -> HashMap<ProviderId, u32> {
        self.data
            .lock()
            .providers
            .iter()
            .map(|(id, limit)| (id.clone(), *limit))
            .collect()
    }

    pub fn set_limit(&self, provider: &str, max_concurrent: u32) {
        self.data
            .lock()
            .providers
            .insert(provider.to_string(), max_concurrent);
    }

    /// Last ordering written for a channel.
    pub fn applied(&self, channel: &str) -> Option<Vec<StreamId>> {
        self.data.lock().applied.get(channel).cloned()
    }
}

#[async_trait]
impl ChannelCatalog for FakeCatalog {
    async fn channels_with_providers(&self) -> Result<Vec<ChannelStreams>, CatalogError> {
        let data = self.data.lock();
        Ok(data
            .channels
            .iter()
            .map(|(channel_id, streams)| ChannelStreams {
                channel_id: channel_id.clone(),
                streams: streams
                    .iter()
                    .filter_map(|id| data.pool.get(id).cloned())
                    .collect(),
            })
            .collect())
    }

    async fn apply_stream_order(
        &self,
        channel_id: &str,
        order: &[StreamId],
    ) -> Result<(), CatalogError> {
        let mut data = self.data.lock();
        let entry = data
            .channels
            .iter_mut()
            .find(|(id, _)| id == channel_id)
            .ok_or_else(|| CatalogError::UnknownChannel(channel_id.to_string()))?;
        entry.1 = order.to_vec();
        data.applied.insert(channel_id.to_string(), order.to_vec());
        Ok(())
    }

    async fn provider_limits(&self) -> Result<HashMap<ProviderId, u32>, CatalogError> {
        Ok(self.limits())
    }

    async fn refresh_sources(&self) -> Result<(), CatalogError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rediscover_matches(&self) -> Result<(), CatalogError> {
        self.rediscoveries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted probe answer for one stream.
#[derive(Debug, Clone)]
pub enum FakeResponse {
    Facts(ProbeFacts),
    Fail,
    /// Never returns; the caller's timeout must fire.
    Hang,
}

#[derive(Default)]
struct ProbeTracker {
    calls: HashMap<StreamId, usize>,
    current: HashMap<ProviderId, u32>,
    peak: HashMap<ProviderId, u32>,
    global: u32,
    global_peak: u32,
}

/// Prober that answers from a script after a fixed delay and records
/// concurrency per provider.
pub struct FakeProber {
    delay: Duration,
    responses: Mutex<HashMap<StreamId, FakeResponse>>,
    tracker: Mutex<ProbeTracker>,
}

impl FakeProber {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            responses: Mutex::new(HashMap::new()),
            tracker: Mutex::new(ProbeTracker::default()),
        }
    }

    /// Script the answer for a stream; unscripted streams return [`hd_facts`].
    pub fn respond(&self, stream: &str, response: FakeResponse) {
        self.responses.lock().insert(stream.to_string(), response);
    }

    pub fn calls(&self, stream: &str) -> usize {
        self.tracker.lock().calls.get(stream).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.tracker.lock().calls.values().sum()
    }

    pub fn peak_for(&self, provider: &str) -> u32 {
        self.tracker.lock().peak.get(provider).copied().unwrap_or(0)
    }

    pub fn global_peak(&self) -> u32 {
        self.tracker.lock().global_peak
    }
}

struct InFlight<'a> {
    tracker: &'a Mutex<ProbeTracker>,
    provider: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut tracker = self.tracker.lock();
        if let Some(current) = tracker.current.get_mut(&self.provider) {
            *current = current.saturating_sub(1);
        }
        tracker.global = tracker.global.saturating_sub(1);
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, url: &str, _budget: Duration) -> Result<ProbeFacts, ProbeError> {
        let (provider, stream) = split_url(url);
        let _in_flight = {
            let mut tracker = self.tracker.lock();
            *tracker.calls.entry(stream.clone()).or_insert(0) += 1;
            let current = {
                let current = tracker.current.entry(provider.clone()).or_insert(0);
                *current += 1;
                *current
            };
            let peak = tracker.peak.entry(provider.clone()).or_insert(0);
            *peak = (*peak).max(current);
            tracker.global += 1;
            tracker.global_peak = tracker.global_peak.max(tracker.global);
            InFlight {
                tracker: &self.tracker,
                provider,
            }
        };

        let response = self
            .responses
            .lock()
            .get(&stream)
            .cloned()
            .unwrap_or_else(|| FakeResponse::Facts(hd_facts()));

        match response {
            FakeResponse::Facts(facts) => {
                tokio::time::sleep(self.delay).await;
                Ok(facts)
            }
            FakeResponse::Fail => {
                tokio::time::sleep(self.delay).await;
                Err(ProbeError::Failed(format!("{} unreachable", url)))
            }
            FakeResponse::Hang => {
                std::future::pending::<()>().await;
                Err(ProbeError::Failed("unreachable".to_string()))
            }
        }
    }
}
