//! Channel catalog: the external source of channels, streams and providers.
//!
//! Playlist storage and stream-to-channel matching live outside the checker;
//! [`ChannelCatalog`] is the seam. [`FileCatalog`] is a JSON-file backed
//! implementation used by the daemon binary.

use crate::state::write_atomically;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub type ChannelId = String;
pub type StreamId = String;
pub type ProviderId = String;

/// Errors reported by a catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid catalog data: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("Unknown stream {stream_id} in ordering for channel {channel_id}")]
    UnknownStream {
        channel_id: ChannelId,
        stream_id: StreamId,
    },
}

/// One stream as the checker sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSource {
    pub stream_id: StreamId,
    pub url: String,
    pub provider_id: ProviderId,
}

/// A channel with its streams in current order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStreams {
    pub channel_id: ChannelId,
    pub streams: Vec<StreamSource>,
}

/// External collaborator owning channels, streams and provider limits.
#[async_trait]
pub trait ChannelCatalog: Send + Sync {
    async fn channels_with_providers(&self) -> Result<Vec<ChannelStreams>, CatalogError>;

    async fn channel_streams(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelStreams>, CatalogError> {
        Ok(self
            .channels_with_providers()
            .await?
            .into_iter()
            .find(|c| c.channel_id == channel_id))
    }

    /// Write back a channel's stream order, best first.
    async fn apply_stream_order(
        &self,
        channel_id: &str,
        order: &[StreamId],
    ) -> Result<(), CatalogError>;

    /// Configured concurrent-probe limit per provider (0 = unlimited).
    async fn provider_limits(&self) -> Result<HashMap<ProviderId, u32>, CatalogError>;

    /// Refresh upstream source data (first step of a sweep).
    async fn refresh_sources(&self) -> Result<(), CatalogError> {
        Ok(())
    }

    /// Re-run stream-to-channel matching (second step of a sweep).
    async fn rediscover_matches(&self) -> Result<(), CatalogError> {
        Ok(())
    }
}

/// Provider entry in the catalog file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    #[serde(default)]
    pub max_concurrent: u32,
}

/// Channel entry in the catalog file; streams are referenced by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub streams: Vec<StreamId>,
}

/// On-disk layout of the catalog file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub providers: BTreeMap<ProviderId, ProviderEntry>,
    #[serde(default)]
    pub streams: Vec<StreamSource>,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

impl CatalogFile {
    fn resolve(&self) -> Vec<ChannelStreams> {
        let pool: HashMap<&str, &StreamSource> = self
            .streams
            .iter()
            .map(|s| (s.stream_id.as_str(), s))
            .collect();

        self.channels
            .iter()
            .map(|channel| ChannelStreams {
                channel_id: channel.channel_id.clone(),
                streams: channel
                    .streams
                    .iter()
                    .filter_map(|id| match pool.get(id.as_str()) {
                        Some(source) => Some((*source).clone()),
                        None => {
                            warn!(channel_id = %channel.channel_id, stream_id = %id, "Channel references unknown stream");
                            None
                        }
                    })
                    .collect(),
            })
            .collect()
    }
}

/// Catalog backed by a JSON file.
pub struct FileCatalog {
    path: PathBuf,
    data: RwLock<CatalogFile>,
}

impl FileCatalog {
    /// Open the catalog; a missing file is an empty catalog.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let data = read_catalog(&path).await?;
        info!(
            path = %path.display(),
            channels = data.channels.len(),
            streams = data.streams.len(),
            "Catalog loaded"
        );
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn from_data(path: impl Into<PathBuf>, data: CatalogFile) -> Self {
        Self {
            path: path.into(),
            data: RwLock::new(data),
        }
    }

    pub async fn snapshot(&self) -> CatalogFile {
        self.data.read().await.clone()
    }
}

async fn read_catalog(path: &Path) -> Result<CatalogFile, CatalogError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Catalog file not found, starting empty");
            Ok(CatalogFile::default())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ChannelCatalog for FileCatalog {
    async fn channels_with_providers(&self) -> Result<Vec<ChannelStreams>, CatalogError> {
        Ok(self.data.read().await.resolve())
    }

    async fn apply_stream_order(
        &self,
        channel_id: &str,
        order: &[StreamId],
    ) -> Result<(), CatalogError> {
        let mut data = self.data.write().await;

        if let Some(unknown) = order
            .iter()
            .find(|id| !data.streams.iter().any(|s| &s.stream_id == *id))
        {
            return Err(CatalogError::UnknownStream {
                channel_id: channel_id.to_string(),
                stream_id: unknown.clone(),
            });
        }

        let entry = data
            .channels
            .iter_mut()
            .find(|c| c.channel_id == channel_id)
            .ok_or_else(|| CatalogError::UnknownChannel(channel_id.to_string()))?;
        if entry.streams == order {
            return Ok(());
        }
        entry.streams = order.to_vec();

        let json = serde_json::to_vec_pretty(&*data)?;
        write_atomically(&self.path, &json)?;
        debug!(channel_id, streams = order.len(), "Stream order written");
        Ok(())
    }

    async fn provider_limits(&self) -> Result<HashMap<ProviderId, u32>, CatalogError> {
        Ok(self
            .data
            .read()
            .await
            .providers
            .iter()
            .map(|(id, p)| (id.clone(), p.max_concurrent))
            .collect())
    }

    async fn refresh_sources(&self) -> Result<(), CatalogError> {
        let fresh = read_catalog(&self.path).await?;
        *self.data.write().await = fresh;
        info!(path = %self.path.display(), "Catalog reloaded");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> CatalogFile {
        let stream = |id: &str, provider: &str| StreamSource {
            stream_id: id.to_string(),
            url: format!("http://{}/{}.ts", provider, id),
            provider_id: provider.to_string(),
        };
        CatalogFile {
            providers: BTreeMap::from([
                ("a".to_string(), ProviderEntry { max_concurrent: 1 }),
                ("b".to_string(), ProviderEntry { max_concurrent: 2 }),
            ]),
            streams: vec![stream("a1", "a"), stream("b1", "b"), stream("b2", "b")],
            channels: vec![ChannelEntry {
                channel_id: "news".to_string(),
                streams: vec!["a1".to_string(), "b1".to_string(), "b2".to_string()],
            }],
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_catalog() {
        let dir = TempDir::new().unwrap();
        let catalog = FileCatalog::open(dir.path().join("catalog.json")).await.unwrap();
        assert!(catalog.channels_with_providers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_channels_resolve_stream_sources() {
        let dir = TempDir::new().unwrap();
        let catalog = FileCatalog::from_data(dir.path().join("catalog.json"), sample());

        let channel = catalog.channel_streams("news").await.unwrap().unwrap();
        assert_eq!(channel.streams.len(), 3);
        assert_eq!(channel.streams[0].provider_id, "a");

        let limits = catalog.provider_limits().await.unwrap();
        assert_eq!(limits.get("a"), Some(&1));
        assert_eq!(limits.get("b"), Some(&2));
    }

    #[tokio::test]
    async fn test_apply_stream_order_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = FileCatalog::from_data(&path, sample());

        catalog
            .apply_stream_order("news", &["b2".to_string(), "a1".to_string()])
            .await
            .unwrap();

        let reopened = FileCatalog::open(&path).await.unwrap();
        let channel = reopened.channel_streams("news").await.unwrap().unwrap();
        let ids: Vec<_> = channel.streams.iter().map(|s| s.stream_id.as_str()).collect();
        assert_eq!(ids, vec!["b2", "a1"]);
    }

    #[tokio::test]
    async fn test_apply_stream_order_rejects_unknown_ids() {
        let dir = TempDir::new().unwrap();
        let catalog = FileCatalog::from_data(dir.path().join("catalog.json"), sample());

        let unknown_stream = catalog
            .apply_stream_order("news", &["zz".to_string()])
            .await;
        assert!(matches!(unknown_stream, Err(CatalogError::UnknownStream { .. })));

        let unknown_channel = catalog
            .apply_stream_order("sports", &["a1".to_string()])
            .await;
        assert!(matches!(unknown_channel, Err(CatalogError::UnknownChannel(_))));
    }

    #[tokio::test]
    async fn test_refresh_sources_reloads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = FileCatalog::from_data(&path, CatalogFile::default());

        std::fs::write(&path, serde_json::to_vec(&sample()).unwrap()).unwrap();
        catalog.refresh_sources().await.unwrap();

        assert_eq!(catalog.channels_with_providers().await.unwrap().len(), 1);
    }
}
