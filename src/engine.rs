//! Container engine seam (podman build/save/prune).
//!
//! The pipeline talks to the local container engine through the
//! [`ContainerEngine`] trait so the ordering-sensitive phases can be
//! exercised against a mock. [`PodmanEngine`] is the production
//! implementation, shelling out to the podman CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::sink::Sink;
use crate::{cmd, Result};

/// Image builds download base layers and compile; give them room.
const BUILD_TIMEOUT: Duration = Duration::from_secs(900);

/// Serializing a multi-GiB image to disk is I/O bound but finite.
const SAVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Prune walks the whole image store.
const PRUNE_TIMEOUT: Duration = Duration::from_secs(180);

/// Inputs for one image build.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    /// Short service name ("gateway"); keys the pipeline's result maps
    pub service: String,
    /// Image reference to tag the build with
    pub tag: String,
    /// Dockerfile path
    pub dockerfile: PathBuf,
    /// Build context directory
    pub context: PathBuf,
    /// Extra `--build-arg` pairs
    pub build_args: Vec<(String, String)>,
}

/// Operations the pipeline needs from the local container engine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Build an image from `spec`, streaming build output to `sink`.
    /// Returns the image reference on success.
    async fn build(&self, spec: &BuildSpec, sink: &Sink) -> Result<String>;

    /// Serialize `image` to a tar archive at `dest`.
    async fn save(&self, image: &str, dest: &Path) -> Result<()>;

    /// Remove all local images, containers, build cache, and volumes.
    /// Returns the engine's reclaimed-space report.
    async fn prune(&self) -> Result<String>;
}

/// Production engine shelling out to podman.
#[derive(Debug, Default, Clone)]
pub struct PodmanEngine;

impl PodmanEngine {
    /// Create a new podman engine.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContainerEngine for PodmanEngine {
    async fn build(&self, spec: &BuildSpec, sink: &Sink) -> Result<String> {
        info!(service = %spec.service, tag = %spec.tag, "building image");
        sink.line(format!("  building {} ({})", spec.service, spec.tag));

        let dockerfile = spec.dockerfile.to_string_lossy().into_owned();
        let context = spec.context.to_string_lossy().into_owned();

        // --no-cache: test images must reflect the working tree, not whatever
        // layer cache survived the previous run.
        let mut args: Vec<String> = vec![
            "build".into(),
            "--no-cache".into(),
            "-t".into(),
            spec.tag.clone(),
            "-f".into(),
            dockerfile,
        ];
        for (key, value) in &spec.build_args {
            args.push("--build-arg".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(context);

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        cmd::stream("podman", &arg_refs, BUILD_TIMEOUT, sink).await?;

        Ok(spec.tag.clone())
    }

    async fn save(&self, image: &str, dest: &Path) -> Result<()> {
        info!(image, dest = %dest.display(), "exporting image to archive");
        let dest_str = dest.to_string_lossy().into_owned();
        cmd::run(
            "podman",
            &["save", "--output", &dest_str, image],
            SAVE_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn prune(&self) -> Result<String> {
        info!("pruning local image store");
        cmd::run(
            "podman",
            &["system", "prune", "--all", "--force", "--volumes"],
            PRUNE_TIMEOUT,
        )
        .await
    }
}
