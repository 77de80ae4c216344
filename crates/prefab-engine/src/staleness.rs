//! Staleness cache for the package index refresh.
//!
//! The last successful refresh is persisted as the modification time of a
//! marker file. A refresh runs when the marker is missing or older than the
//! freshness window, and the marker is only moved forward after the refresh
//! succeeds, so a failed refresh is retried on the next run.

use crate::config::EngineConfig;
use crate::driver::HostDriver;
use chrono::{DateTime, Utc};
use prefab_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Persistent record of the last index refresh.
#[async_trait::async_trait]
pub trait MarkerStore: Send + Sync {
    /// Create whatever backing storage the marker needs.
    async fn prepare(&self) -> Result<()>;

    async fn last_refresh(&self) -> Result<Option<DateTime<Utc>>>;

    async fn record_refresh(&self, at: DateTime<Utc>) -> Result<()>;
}

/// Marker file inside a state directory; its mtime is the record.
pub struct FileMarker {
    state_dir: PathBuf,
    path: PathBuf,
}

impl FileMarker {
    pub fn new(state_dir: impl AsRef<Path>, marker_name: &str) -> Self {
        let state_dir = state_dir.as_ref().to_path_buf();
        Self {
            path: state_dir.join(marker_name),
            state_dir,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl MarkerStore for FileMarker {
    async fn prepare(&self) -> Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);
        builder.create(&self.state_dir).await.map_err(|e| {
            Error::setup(format!("create state dir {}", self.state_dir.display()), e)
        })
    }

    async fn last_refresh(&self) -> Result<Option<DateTime<Utc>>> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                let modified = meta.modified().map_err(|e| {
                    Error::setup(format!("read mtime of {}", self.path.display()), e)
                })?;
                Ok(Some(DateTime::<Utc>::from(modified)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::setup(format!("stat {}", self.path.display()), e)),
        }
    }

    async fn record_refresh(&self, at: DateTime<Utc>) -> Result<()> {
        let path = self.path.clone();
        let mtime = SystemTime::from(at);
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.set_modified(mtime)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
        .map_err(|e| Error::setup(format!("touch {}", self.path.display()), e))
    }
}

/// Outcome of `StalenessCache::ensure_fresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Refreshed,
}

pub struct StalenessCache {
    store: Arc<dyn MarkerStore>,
    clock: Arc<dyn Clock>,
    window: chrono::Duration,
}

impl StalenessCache {
    pub fn new(
        store: Arc<dyn MarkerStore>,
        clock: Arc<dyn Clock>,
        window: chrono::Duration,
    ) -> Self {
        Self {
            store,
            clock,
            window,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Arc::new(FileMarker::new(&config.state_dir, &config.marker_name)),
            Arc::new(SystemClock),
            config.freshness_window(),
        )
    }

    /// Refresh the package index unless the last refresh is inside the window.
    pub async fn ensure_fresh(&self, driver: &dyn HostDriver) -> Result<Freshness> {
        self.store.prepare().await?;

        let cutoff = self.clock.now() - self.window;
        match self.store.last_refresh().await? {
            Some(last) if last >= cutoff => {
                debug!(last = %last, "package index is fresh");
                return Ok(Freshness::Fresh);
            }
            Some(last) => info!(last = %last, "package index is stale, refreshing"),
            None => info!("no record of a package index refresh, refreshing"),
        }

        driver.refresh_index().await?;
        self.store.record_refresh(self.clock.now()).await?;
        Ok(Freshness::Refreshed)
    }
}
