//! The image lifecycle pipeline: build, export, prune, load, cleanup.
//!
//! CI runners hosting a Kind cluster can't hold the podman layer cache and
//! the loaded cluster images at the same time, so built images take a detour
//! through tar archives: every image is exported to disk, the entire local
//! engine store is pruned, the archives are loaded into the cluster's
//! runtime, and finally the archives are deleted. Phases run in strict
//! sequence; a disk snapshot is logged at every boundary.
//!
//! Ordering is enforced by construction: [`ExportedArchives`] has no public
//! constructor, and prune/load/cleanup all require one, so pruning an image
//! that was never exported does not compile. Pruning before export would be
//! unrecoverable data loss - the built image disappears and cannot be
//! re-derived without rebuilding.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::disk::PhaseLog;
use crate::engine::{BuildSpec, ContainerEngine};
use crate::sink::Sink;
use crate::{Error, Result};

/// Minimum plausible size for an exported service image. Anything smaller
/// means the export was silently truncated and the image would be
/// unrecoverable after the prune step.
pub const MIN_ARCHIVE_BYTES: u64 = 100 * 1024 * 1024;

/// Destination for image archives (the Kind cluster's node runtime).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArchiveLoader: Send + Sync {
    /// Import the archive at `path` into the target runtime.
    async fn load_archive(&self, path: &Path) -> Result<()>;
}

/// Proof that a set of images has been serialized to disk.
///
/// Only [`ImagePipeline::export_all`] creates one; holding it is the
/// precondition for the destructive prune and for loading.
#[derive(Debug)]
pub struct ExportedArchives {
    archives: BTreeMap<String, PathBuf>,
}

impl ExportedArchives {
    /// Archive paths keyed by service name.
    pub fn archives(&self) -> &BTreeMap<String, PathBuf> {
        &self.archives
    }

    /// Number of archives.
    pub fn len(&self) -> usize {
        self.archives.len()
    }

    /// True if no archives were produced.
    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }
}

/// Drives built images through export, prune, load, and cleanup.
///
/// One pipeline invocation owns all of its state; nothing survives the call
/// that created it except the archive files, which cleanup deletes (or
/// abandons on error for the caller to inspect).
pub struct ImagePipeline<E, L> {
    engine: Arc<E>,
    loader: Arc<L>,
    archive_dir: PathBuf,
    sink: Sink,
    log: PhaseLog,
    min_archive_bytes: u64,
}

impl<E, L> ImagePipeline<E, L>
where
    E: ContainerEngine + 'static,
    L: ArchiveLoader + 'static,
{
    /// Create a pipeline writing archives into `archive_dir` and progress
    /// onto `sink`.
    pub fn new(engine: E, loader: L, archive_dir: impl Into<PathBuf>, sink: Sink) -> Self {
        Self {
            engine: Arc::new(engine),
            loader: Arc::new(loader),
            archive_dir: archive_dir.into(),
            log: PhaseLog::new(sink.clone()),
            sink,
            min_archive_bytes: MIN_ARCHIVE_BYTES,
        }
    }

    #[cfg(test)]
    fn set_min_archive_bytes(&mut self, bytes: u64) {
        self.min_archive_bytes = bytes;
    }

    /// The disk checkpoints recorded so far.
    pub fn phase_log(&self) -> &PhaseLog {
        &self.log
    }

    /// Run the full pipeline for `specs`: build, export, prune, load,
    /// cleanup, with a disk checkpoint at every phase boundary.
    ///
    /// Build, export, and load failures abort the run. A prune failure is
    /// logged and skipped - it costs disk headroom, not correctness.
    pub async fn run(&mut self, specs: Vec<BuildSpec>) -> Result<()> {
        self.log.checkpoint("start").await;

        let images = self.build_all(specs).await?;
        self.log.checkpoint("build").await;

        let exported = self.export_all(&images).await?;
        self.log.checkpoint("export").await;

        if let Err(e) = self.prune_local(&exported).await {
            warn!(error = %e, "prune failed, continuing with less disk headroom");
        }
        self.log.checkpoint("prune").await;

        self.load_all(&exported).await?;
        self.log.checkpoint("load").await;

        self.cleanup(exported).await;
        self.log.checkpoint("cleanup").await;

        Ok(())
    }

    /// Build every image concurrently, one task per service.
    ///
    /// Concurrency is bounded by the number of services (typically 3-4);
    /// there is no worker pool. On the first failure the remaining builds
    /// are aborted and drained before the error is returned, so no task
    /// outlives the call.
    pub async fn build_all(&self, specs: Vec<BuildSpec>) -> Result<BTreeMap<String, String>> {
        let mut set = JoinSet::new();
        for spec in specs {
            let engine = Arc::clone(&self.engine);
            let sink = self.sink.clone();
            set.spawn(async move {
                let service = spec.service.clone();
                let result = engine.build(&spec, &sink).await;
                (service, result)
            });
        }

        let mut images = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((service, Ok(reference))) => {
                    info!(service = %service, image = %reference, "image built");
                    images.insert(service, reference);
                }
                Ok((service, Err(e))) => {
                    set.abort_all();
                    drain(&mut set).await;
                    return Err(Error::build(format!("build failed for {}: {}", service, e)));
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    set.abort_all();
                    drain(&mut set).await;
                    return Err(Error::build(format!("build task panicked: {}", e)));
                }
            }
        }

        Ok(images)
    }

    /// Export every image to `<archive_dir>/<service>-e2e.tar`, sequentially.
    ///
    /// Each archive must exist and be at least [`MIN_ARCHIVE_BYTES`] or the
    /// call fails naming the service. Archives written before a failure are
    /// left in place for the caller to retry or clean up. The result holds
    /// exactly one entry per input image, keyed by the same names.
    pub async fn export_all(
        &self,
        images: &BTreeMap<String, String>,
    ) -> Result<ExportedArchives> {
        let mut archives = BTreeMap::new();

        for (service, image) in images {
            let path = self.archive_dir.join(format!("{}-e2e.tar", service));
            self.sink
                .line(format!("  exporting {} -> {}", image, path.display()));

            self.engine
                .save(image, &path)
                .await
                .map_err(|e| Error::export(format!("export of {} failed: {}", service, e)))?;

            let size = tokio::fs::metadata(&path)
                .await
                .map_err(|e| {
                    Error::export(format!(
                        "archive for {} missing at {}: {}",
                        service,
                        path.display(),
                        e
                    ))
                })?
                .len();

            if size < self.min_archive_bytes {
                return Err(Error::export(format!(
                    "archive for {} is {} bytes, expected at least {} - export was truncated",
                    service, size, self.min_archive_bytes
                )));
            }

            archives.insert(service.clone(), path);
        }

        Ok(ExportedArchives { archives })
    }

    /// Destroy all local engine state (images, containers, cache, volumes)
    /// to free disk for the load phase.
    ///
    /// Requires the exported-archives token: every image that will be needed
    /// again is already on disk, so losing the store is safe. Callers treat
    /// failure as non-fatal.
    pub async fn prune_local(&self, _exported: &ExportedArchives) -> Result<()> {
        let report = self.engine.prune().await?;
        let trimmed = report.trim();
        if !trimmed.is_empty() {
            self.sink.line(format!("  pruned local store: {}", trimmed));
        }
        Ok(())
    }

    /// Load every archive into the cluster runtime, sequentially.
    pub async fn load_all(&self, exported: &ExportedArchives) -> Result<()> {
        for (service, path) in exported.archives() {
            self.sink
                .line(format!("  loading {} from {}", service, path.display()));
            self.loader
                .load_archive(path)
                .await
                .map_err(|e| Error::load(format!("load of {} failed: {}", service, e)))?;
        }
        Ok(())
    }

    /// Load archives concurrently, one task per archive, with the same
    /// abort-and-drain semantics as [`build_all`](Self::build_all).
    pub async fn load_all_parallel(&self, exported: &ExportedArchives) -> Result<()> {
        let mut set = JoinSet::new();
        for (service, path) in exported.archives() {
            let loader = Arc::clone(&self.loader);
            let service = service.clone();
            let path = path.clone();
            set.spawn(async move {
                let result = loader.load_archive(&path).await;
                (service, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((service, Err(e))) => {
                    set.abort_all();
                    drain(&mut set).await;
                    return Err(Error::load(format!("load of {} failed: {}", service, e)));
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    set.abort_all();
                    drain(&mut set).await;
                    return Err(Error::load(format!("load task panicked: {}", e)));
                }
            }
        }

        Ok(())
    }

    /// Delete every archive file, best-effort.
    ///
    /// The data has already served its purpose once loaded, so failures are
    /// logged and never surfaced. Every file is attempted even when earlier
    /// deletions fail. Consumes the token: the archives no longer exist.
    pub async fn cleanup(&self, exported: ExportedArchives) {
        for (service, path) in exported.archives() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    self.sink
                        .line(format!("  removed archive {}", path.display()));
                }
                Err(e) => {
                    warn!(
                        service = %service,
                        path = %path.display(),
                        error = %e,
                        "failed to remove archive, leaving it behind"
                    );
                }
            }
        }
    }
}

async fn drain<T: 'static>(set: &mut JoinSet<T>) {
    while set.join_next().await.is_some() {}
}
