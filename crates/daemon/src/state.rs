//! Persistent checker state.
//!
//! Per-stream outcomes, per-channel flags and per-provider limits are kept in
//! a single JSON document that is rewritten atomically after every channel
//! pass, so a restart resumes with the same cooldowns and liveness.

use crate::catalog::ProviderId;
use crate::ledger::{ChannelRecord, StreamRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::warn;

const STATE_FILE: &str = "state.json";

/// Errors that can occur while persisting state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persisted concurrency limit of one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub max_concurrent: u32,
}

/// Everything the checker must remember across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub channels: Vec<ChannelRecord>,
    #[serde(default)]
    pub streams: Vec<StreamRecord>,
    #[serde(default)]
    pub providers: BTreeMap<ProviderId, ProviderRecord>,
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Writes `contents` to a fresh temp file next to `path` and renames it into place.
///
/// Every call gets its own temp file, so concurrent writers never collide;
/// the last rename wins.
pub fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Location of the state document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state; a missing or unreadable document yields empty state.
    pub fn load(&self) -> PersistedState {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return PersistedState::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read state, starting empty");
                return PersistedState::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Corrupt state file, starting empty");
                PersistedState::default()
            }
        }
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(state)?;
        write_atomically(&self.path, &json)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{FailureKind, Liveness};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn sample_state() -> PersistedState {
        PersistedState {
            channels: vec![ChannelRecord {
                channel_id: "c1".to_string(),
                streams: vec!["s1".to_string(), "s2".to_string()],
                needs_check: true,
                force_check: false,
                last_checked: Some(1_700_000_000_000),
                force_pending: BTreeSet::new(),
            }],
            streams: vec![
                StreamRecord {
                    stream_id: "s1".to_string(),
                    channel_id: "c1".to_string(),
                    provider_id: "p1".to_string(),
                    url: "http://p1/s1.ts".to_string(),
                    last_checked: Some(1_700_000_000_000),
                    score: Some(0.82),
                    liveness: Liveness::Alive,
                    consecutive_failures: 0,
                    last_failure: None,
                },
                StreamRecord {
                    stream_id: "s2".to_string(),
                    channel_id: "c1".to_string(),
                    provider_id: "p1".to_string(),
                    url: "http://p1/s2.ts".to_string(),
                    last_checked: Some(1_700_000_000_000),
                    score: Some(0.0),
                    liveness: Liveness::Dead,
                    consecutive_failures: 2,
                    last_failure: Some(FailureKind::Timeout),
                },
            ],
            providers: BTreeMap::from([("p1".to_string(), ProviderRecord { max_concurrent: 2 })]),
        }
    }

    #[test]
    fn test_missing_state_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        assert_eq!(store.load(), PersistedState::default());
    }

    #[test]
    fn test_saved_state_survives_reload() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(&dir.path().join("nested"));
        let state = sample_state();

        store.save(&state).unwrap();
        assert_eq!(StateStore::new(&dir.path().join("nested")).load(), state);
        // No temp file is left behind
        let entries: Vec<_> = fs::read_dir(dir.path().join("nested")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_concurrent_saves_all_succeed() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let state = sample_state();

        let failures: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        (0..200)
                            .filter(|_| store.save(&state).is_err())
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(failures, 0);
        assert_eq!(store.load(), state);
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_corrupt_state_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(store.path(), "{ not json").unwrap();
        assert_eq!(store.load(), PersistedState::default());
    }

    #[test]
    fn test_state_shape_uses_snake_case_liveness() {
        let json = serde_json::to_string(&sample_state()).unwrap();
        assert!(json.contains("\"liveness\":\"dead\""));
        assert!(json.contains("\"max_concurrent\":2"));
        assert!(json.contains("\"force_check\":false"));
    }
}
