//! One `osrouterd` invocation's view of the host.
//!
//! A [`Session`] pairs the command runner with the [`StateStore`], so every
//! reconcile resumes from what an earlier process recorded and leaves a
//! record behind for the next one, even when some commands failed.

use crate::command::{argv, CommandRunner, RecordingRunner, SystemRunner};
use crate::persistence::{StateError, StateStore};
use crate::router::readiness::reports_up;
use crate::router::{AppliedState, DesiredConfig, Router, RouterError};
use serde::Serialize;
use shared_utils::config::RouterConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("reading desired state {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing desired state {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    State(#[from] StateError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// What `osrouterd status` prints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub interface: String,
    pub up: bool,
    pub state: AppliedState,
}

/// Where commands go and whether their effect is remembered.
pub struct Session {
    runner: Arc<dyn CommandRunner>,
    recorder: Option<Arc<RecordingRunner>>,
    store: StateStore,
}

impl Session {
    pub fn new(runner: Arc<dyn CommandRunner>, store: StateStore) -> Self {
        Self {
            runner,
            recorder: None,
            store,
        }
    }

    /// Records commands instead of running them. Nothing is written to
    /// `store`, it is only read.
    pub fn dry_run(store: StateStore) -> Self {
        // Pretend the interface is up so readiness does not spin.
        let recorder =
            Arc::new(RecordingRunner::new().respond_when(|a| a.len() == 2, "status: active\n"));
        let runner: Arc<dyn CommandRunner> = recorder.clone();
        Self {
            runner,
            recorder: Some(recorder),
            store,
        }
    }

    pub fn from_config(cfg: &RouterConfig, dry_run: bool) -> Self {
        let store = StateStore::new(Some(cfg.state_path.clone()));
        if dry_run {
            Self::dry_run(store)
        } else {
            Self::new(Arc::new(SystemRunner), store)
        }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn persists(&self) -> bool {
        self.recorder.is_none()
    }

    /// A router for the configured interface, resumed from recorded state.
    pub async fn router(&self, cfg: &RouterConfig) -> Router {
        let router = Router::from_config(cfg, self.runner.clone());
        match self.store.get(&cfg.interface).await {
            Some(state) => router.with_state(state),
            None => router,
        }
    }

    pub async fn save(&self, router: &Router) -> SessionResult<()> {
        if self.persists() {
            self.store.record(router.iface(), router.state()).await?;
        }
        Ok(())
    }

    /// Reconciles to `desired` and records whatever was attempted.
    ///
    /// A reconcile error takes precedence over a failure to record.
    pub async fn apply(&self, router: &mut Router, desired: Option<&DesiredConfig>) -> SessionResult<()> {
        let result = router.reconcile(desired).await;
        let saved = self.save(router).await;
        result?;
        saved
    }

    pub async fn apply_file(&self, router: &mut Router, path: &Path) -> SessionResult<()> {
        let desired = load_desired(path).await?;
        self.apply(router, Some(&desired)).await
    }

    /// Removes every recorded address and route, then brings the
    /// interface down.
    pub async fn shutdown(&self, mut router: Router) -> SessionResult<()> {
        let result = self.apply(&mut router, None).await;
        router.close().await;
        result
    }

    /// Shutdown of whatever an earlier process left behind, e.g. after a
    /// crash. The recorded state is only forgotten once it has been torn
    /// down.
    pub async fn cleanup(&self, cfg: &RouterConfig) -> SessionResult<()> {
        let router = self.router(cfg).await;
        if router.state().is_empty() {
            debug!(iface = %cfg.interface, "nothing recorded to clean up");
        } else {
            info!(iface = %cfg.interface, "cleaning up recorded state");
        }
        self.shutdown(router).await
    }

    pub async fn status(&self, cfg: &RouterConfig) -> StatusReport {
        let state = self.store.get(&cfg.interface).await.unwrap_or_default();
        let query = argv(&[cfg.ifconfig.as_str(), cfg.interface.as_str()]);
        let up = match self.runner.run(&query).await {
            Ok(output) => reports_up(&String::from_utf8_lossy(&output)),
            Err(err) => {
                debug!("status query failed: {err}");
                false
            }
        };
        StatusReport {
            interface: cfg.interface.clone(),
            up,
            state,
        }
    }

    /// Commands recorded since the last call, one line each. Empty unless
    /// this is a dry run.
    pub fn take_dry_run_commands(&self) -> Vec<String> {
        match &self.recorder {
            Some(recorder) => recorder
                .take_calls()
                .into_iter()
                .map(|call| call.join(" "))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Reads a desired-state TOML file.
pub async fn load_desired(path: &Path) -> SessionResult<DesiredConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SessionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    DesiredConfig::from_toml(&content).map_err(|source| SessionError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
