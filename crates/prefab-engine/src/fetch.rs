//! Fetch pool — bounded concurrent download of package archives.
//!
//! A fixed set of workers drains a closable, unbounded queue of archive URLs
//! into a shared cache directory. `FetchPool::finish` closes the queue and
//! joins every worker, so artifacts are on disk once it returns.
//!
//! Per-archive failures are logged and skipped: the destination stays absent
//! and the next run tries again. Only malformed locators and cancellation
//! surface as errors.

use dashmap::DashSet;
use futures::StreamExt;
use prefab_core::{Error, Result};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Downloads one URL to one path.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url, destination: &Path) -> Result<()>;
}

/// HTTP fetcher. Streams into `<destination>.partial` and renames on success,
/// so an interrupted download never looks like a cached archive.
pub struct HttpFetcher {
    client: Client,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

/// Removes `<destination>.partial` when dropped unless the download was
/// renamed into place. Covers futures dropped mid-stream by a timeout or
/// cancellation.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(destination: &Path) -> Self {
        Self {
            path: partial_path(destination),
            armed: true,
        }
    }

    async fn persist(mut self, destination: &Path) -> Result<()> {
        tokio::fs::rename(&self.path, destination).await?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, destination: &Path) -> Result<()> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::FetchFailed(format!("{}: {}", url, e)))?;

        let partial = PartialFile::new(destination);
        let written = async {
            let mut file = tokio::fs::File::create(&partial.path).await?;
            let mut body = response.bytes_stream();
            let mut bytes = 0usize;
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| Error::FetchFailed(format!("{}: {}", url, e)))?;
                bytes += chunk.len();
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok::<usize, Error>(bytes)
        }
        .await;

        let bytes = written?;
        partial.persist(destination).await?;
        debug!("fetched {} ({} bytes)", destination.display(), bytes);
        Ok(())
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub cache_dir: PathBuf,
    pub workers: usize,
    pub timeout: Duration,
}

impl FetchSettings {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            workers: 20,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Per-run download tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for FetchReport {
    fn add_assign(&mut self, other: Self) {
        self.fetched += other.fetched;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

struct FetchJob {
    url: Url,
    destination: PathBuf,
}

/// Shared state handed to every worker.
struct WorkerContext {
    queue: Mutex<mpsc::UnboundedReceiver<FetchJob>>,
    claimed: DashSet<PathBuf>,
    fetcher: Arc<dyn Fetcher>,
    timeout: Duration,
    cancel: CancellationToken,
}

pub struct FetchPool {
    sender: mpsc::UnboundedSender<FetchJob>,
    workers: JoinSet<FetchReport>,
    cache_dir: PathBuf,
    cancel: CancellationToken,
}

impl FetchPool {
    /// Spawn the workers. They idle on the empty queue until work arrives.
    pub fn start(
        settings: &FetchSettings,
        fetcher: Arc<dyn Fetcher>,
        cancel: &CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = cancel.child_token();
        let ctx = Arc::new(WorkerContext {
            queue: Mutex::new(receiver),
            claimed: DashSet::new(),
            fetcher,
            timeout: settings.timeout,
            cancel: cancel.clone(),
        });

        let mut workers = JoinSet::new();
        for id in 0..settings.workers.max(1) {
            workers.spawn(run_worker(id, ctx.clone()));
        }

        Self {
            sender,
            workers,
            cache_dir: settings.cache_dir.clone(),
            cancel,
        }
    }

    /// Queue one archive URL. Never blocks.
    pub fn enqueue(&self, locator: &str) -> Result<()> {
        let url = Url::parse(locator).map_err(|e| Error::invalid_locator(locator, e.to_string()))?;
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::invalid_locator(locator, "no file name in path"))?;
        let destination = self.cache_dir.join(file_name);

        self.sender
            .send(FetchJob { url, destination })
            .map_err(|_| Error::Internal("fetch queue closed".into()))
    }

    /// Close the queue and wait for every worker to drain it.
    pub async fn finish(self) -> Result<FetchReport> {
        let Self {
            sender,
            mut workers,
            cancel,
            ..
        } = self;
        drop(sender);

        let mut report = FetchReport::default();
        while let Some(joined) = workers.join_next().await {
            report += joined.map_err(|e| Error::Internal(format!("fetch worker: {}", e)))?;
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(report)
    }

    /// Stop the workers, dropping whatever is still queued.
    pub async fn abort(self) {
        self.cancel.cancel();
        let _ = self.finish().await;
    }
}

async fn run_worker(id: usize, ctx: Arc<WorkerContext>) -> FetchReport {
    let mut report = FetchReport::default();
    loop {
        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            job = async { ctx.queue.lock().await.recv().await } => job,
        };
        // Closed and empty.
        let Some(job) = next else { break };

        if !ctx.claimed.insert(job.destination.clone()) {
            report.skipped += 1;
            continue;
        }
        if !matches!(tokio::fs::try_exists(&job.destination).await, Ok(false)) {
            debug!(worker = id, "already cached: {}", job.destination.display());
            report.skipped += 1;
            continue;
        }

        let fetch = tokio::time::timeout(ctx.timeout, ctx.fetcher.fetch(&job.url, &job.destination));
        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            outcome = fetch => outcome,
        };
        match outcome {
            Ok(Ok(())) => {
                info!(worker = id, "fetched {}", job.url);
                report.fetched += 1;
            }
            Ok(Err(e)) => {
                warn!(worker = id, url = %job.url, error = %e, "fetch failed, skipping");
                report.failed += 1;
            }
            Err(_) => {
                warn!(worker = id, url = %job.url, "fetch timed out after {:?}, skipping", ctx.timeout);
                report.failed += 1;
            }
        }
    }
    report
}

/// Fetch every locator with a fresh pool and wait for all of them.
pub async fn fetch_all<I, S>(
    locators: I,
    settings: &FetchSettings,
    fetcher: Arc<dyn Fetcher>,
    cancel: &CancellationToken,
) -> Result<FetchReport>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let pool = FetchPool::start(settings, fetcher, cancel);
    for locator in locators {
        if let Err(e) = pool.enqueue(locator.as_ref()) {
            pool.abort().await;
            return Err(e);
        }
    }
    pool.finish().await
}
