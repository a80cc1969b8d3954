use crate::router::AppliedState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error};

pub const DEFAULT_STATE_PATH: &str = "/var/lib/osrouter/state.json";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is corrupt: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentInterface {
    pub interface: String,
    pub state: AppliedState,
}

/// Applied state per interface, kept on disk between runs of the CLI.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, AppliedState>>,
}

impl StateStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path: path.unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH)),
            state: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the state file. A missing file is an empty store.
    pub async fn load(&self) -> Result<(), StateError> {
        let contents = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = %self.path.display(), "no state file");
                return Ok(());
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let entries: Vec<PersistentInterface> =
            serde_json::from_slice(&contents).map_err(|source| StateError::Json {
                path: self.path.clone(),
                source,
            })?;

        let mut guard = self.state.lock().await;
        guard.clear();
        for entry in entries {
            guard.insert(entry.interface, entry.state);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StateError> {
        let guard = self.state.lock().await;
        if guard.is_empty() {
            drop(guard);
            return match fs::remove_file(&self.path).await {
                Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(StateError::Io {
                    path: self.path.clone(),
                    source: err,
                }),
                _ => Ok(()),
            };
        }

        let entries: Vec<_> = guard
            .iter()
            .map(|(interface, state)| PersistentInterface {
                interface: interface.clone(),
                state: state.clone(),
            })
            .collect();
        drop(guard);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StateError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let serialized = serde_json::to_vec_pretty(&entries).map_err(|source| StateError::Json {
            path: self.path.clone(),
            source,
        })?;
        fs::write(&self.path, serialized)
            .await
            .map_err(|source| StateError::Io {
                path: self.path.clone(),
                source,
            })
    }

    pub async fn get(&self, interface: &str) -> Option<AppliedState> {
        self.state.lock().await.get(interface).cloned()
    }

    /// Stores `state` for `interface`; an empty state removes the entry.
    pub async fn record(&self, interface: &str, state: &AppliedState) -> Result<(), StateError> {
        let mut guard = self.state.lock().await;
        if state.is_empty() {
            guard.remove(interface);
        } else {
            guard.insert(interface.to_string(), state.clone());
        }
        drop(guard);
        self.flush().await.inspect_err(|err| {
            error!("failed to write state: {err}");
        })
    }

    pub async fn remove(&self, interface: &str) -> Result<(), StateError> {
        self.state.lock().await.remove(interface);
        self.flush().await
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefix::Prefix;
    use tempfile::tempdir;

    fn p(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    fn sample() -> AppliedState {
        AppliedState {
            local_v4: Some(p("100.64.0.7/32")),
            local_v6: Some(p("fd7a:115c:a1e0::/48")),
            routes: [p("10.0.0.0/24"), p("fd00::/64")].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(Some(dir.path().join("none.json")));
        store.load().await.unwrap();
        assert!(store.get("tun0").await.is_none());
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = StateStore::new(Some(path.clone()));
        store.record("tun0", &sample()).await.unwrap();

        let reloaded = StateStore::new(Some(path));
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get("tun0").await, Some(sample()));
    }

    #[tokio::test]
    async fn empty_state_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(Some(path.clone()));
        store.record("tun0", &sample()).await.unwrap();
        assert!(path.exists());

        store.record("tun0", &AppliedState::default()).await.unwrap();
        assert!(!path.exists());
        store.remove("tun0").await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = StateStore::new(Some(path)).load().await.unwrap_err();
        assert!(matches!(err, StateError::Json { .. }));
    }
}
