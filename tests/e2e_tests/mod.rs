//! End-to-end tests for the Strand test infrastructure
//!
//! Tests are organized by the story they tell:
//!
//! - `stack_lifecycle`: Stories about the full environment - bring-up,
//!   readiness, and teardown
//!
//! - `pipeline`: Stories about the image lifecycle pipeline against a real
//!   podman store and kind cluster, including the rerun-idempotence
//!   guarantee
//!
//! - `workflows`: Stories about migrations and workflow seeding being safe
//!   to repeat against a running stack

use std::path::PathBuf;

use strand_e2e::config::EnvConfig;

mod pipeline;
mod stack_lifecycle;
mod workflows;

/// Repository root the service Dockerfiles are built from.
///
/// Defaults to this crate's manifest directory; CI overrides it when the
/// harness crate is vendored outside the main repo.
pub fn repo_root() -> PathBuf {
    std::env::var("STRAND_REPO_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")))
}

/// Environment config pinned to a test-owned cluster name, so these tests
/// never collide with a developer's long-lived `strand-e2e` cluster.
pub fn test_env(cluster_name: &str) -> EnvConfig {
    EnvConfig {
        cluster_name: cluster_name.to_string(),
        run_id: format!("it-{}", std::process::id()),
        registry: None,
        coverage_dir: None,
        keep_cluster: false,
        archive_dir: std::env::temp_dir(),
    }
}
