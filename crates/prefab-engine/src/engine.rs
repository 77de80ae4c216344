//! Convergence engine — applies a manifest phase by phase.
//!
//! Phase order is fixed by resource kind, not by declaration:
//! users → index freshness → source lists → package archives → forced refresh
//! → packages (fetch, then install) → tarballs → directories → templates →
//! symlinks → databases → database users → bundles → services.
//!
//! Within a phase resources are applied in manifest order. The first failure
//! aborts the run.

use crate::config::EngineConfig;
use crate::driver::HostDriver;
use crate::fetch::{FetchPool, FetchReport, FetchSettings, Fetcher};
use crate::staleness::{Freshness, StalenessCache};
use prefab_core::{Error, Manifest, Package, Resource, ResourceKind, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Summary of a successful convergence pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    /// Resources that needed a change and got one.
    pub applied: usize,
    /// Resources that already matched.
    pub satisfied: usize,
    /// Number of package index refreshes run.
    pub refreshes: usize,
    pub fetch: FetchReport,
}

pub struct Engine {
    driver: Arc<dyn HostDriver>,
    fetcher: Arc<dyn Fetcher>,
    staleness: StalenessCache,
    fetch_settings: FetchSettings,
    archive_tool: Package,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(config: &EngineConfig, driver: Arc<dyn HostDriver>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            driver,
            fetcher,
            staleness: StalenessCache::from_config(config),
            fetch_settings: FetchSettings::new(&config.cache_dir)
                .with_workers(config.fetch_workers)
                .with_timeout(config.fetch_timeout()),
            archive_tool: Package::new(&config.archive_tool),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_staleness(mut self, staleness: StalenessCache) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn with_fetch_settings(mut self, settings: FetchSettings) -> Self {
        self.fetch_settings = settings;
        self
    }

    /// Cancelling this token stops the run at the next resource boundary.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Converge the host to `manifest`.
    pub async fn converge(&self, manifest: &Manifest) -> Result<ConvergeReport> {
        let mut report = ConvergeReport::default();
        info!(resources = manifest.len(), "converging");

        // Users first: later phases may chown to them.
        for user in &manifest.users {
            self.converge_resource(Resource::User(user), &mut report).await?;
        }

        self.check_cancelled()?;
        if self.staleness.ensure_fresh(self.driver.as_ref()).await? == Freshness::Refreshed {
            report.refreshes += 1;
        }

        let mut refresh_needed = false;
        for list in &manifest.source_lists {
            refresh_needed |= self.converge_resource(Resource::SourceList(list), &mut report).await?;
        }

        if !manifest.package_archives.is_empty() {
            self.converge_resource(Resource::Package(&self.archive_tool), &mut report)
                .await?;
        }
        for archive in &manifest.package_archives {
            refresh_needed |= self
                .converge_resource(Resource::PackageArchive(archive), &mut report)
                .await?;
        }

        if refresh_needed {
            self.check_cancelled()?;
            info!("package sources changed, refreshing index");
            self.driver.refresh_index().await?;
            report.refreshes += 1;
        }

        self.converge_packages(&manifest.packages, &mut report).await?;

        let trailing = manifest
            .tarballs
            .iter()
            .map(Resource::Tarball)
            .chain(manifest.directories.iter().map(Resource::Directory))
            .chain(manifest.templates.iter().map(Resource::Template))
            .chain(manifest.symlinks.iter().map(Resource::Symlink))
            .chain(manifest.databases.iter().map(Resource::Database))
            .chain(manifest.database_users.iter().map(Resource::DatabaseUser))
            .chain(manifest.bundles.iter().map(Resource::Bundle))
            .chain(manifest.services.iter().map(Resource::Service));
        for resource in trailing {
            self.converge_resource(resource, &mut report).await?;
        }

        info!(
            applied = report.applied,
            satisfied = report.satisfied,
            fetched = report.fetch.fetched,
            "converged"
        );
        Ok(report)
    }

    /// Partition, fetch every missing package's archives, then install in order.
    async fn converge_packages(&self, packages: &[Package], report: &mut ConvergeReport) -> Result<()> {
        let mut pending = Vec::new();
        for package in packages {
            self.check_cancelled()?;
            if self.satisfied(Resource::Package(package)).await? {
                debug!("package {} already installed", package.qualified_name());
                report.satisfied += 1;
            } else {
                pending.push(package);
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        info!(count = pending.len(), "fetching package archives");
        let pool = FetchPool::start(&self.fetch_settings, self.fetcher.clone(), &self.cancel);
        for package in &pending {
            let enqueued = match self.driver.archive_locators(package).await {
                Ok(locators) => locators.iter().try_for_each(|l| pool.enqueue(l)),
                Err(e) => Err(Error::apply_failed(ResourceKind::Package, package.qualified_name(), e)),
            };
            if let Err(e) = enqueued {
                pool.abort().await;
                return Err(e);
            }
        }
        report.fetch += pool.finish().await?;

        for package in pending {
            self.check_cancelled()?;
            info!("install package: {}", package.qualified_name());
            self.apply(Resource::Package(package)).await?;
            report.applied += 1;
        }
        Ok(())
    }

    /// Check, then apply if needed. Returns whether anything changed.
    async fn converge_resource(&self, resource: Resource<'_>, report: &mut ConvergeReport) -> Result<bool> {
        self.check_cancelled()?;
        if self.satisfied(resource).await? {
            debug!("{} already satisfied", resource);
            report.satisfied += 1;
            return Ok(false);
        }
        info!("apply {}", resource);
        self.apply(resource).await?;
        report.applied += 1;
        Ok(true)
    }

    async fn satisfied(&self, resource: Resource<'_>) -> Result<bool> {
        self.driver
            .is_satisfied(resource)
            .await
            .map_err(|e| Error::apply_failed(resource.kind(), resource.name(), e))
    }

    async fn apply(&self, resource: Resource<'_>) -> Result<()> {
        self.driver
            .apply(resource)
            .await
            .map_err(|e| Error::apply_failed(resource.kind(), resource.name(), e))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}
