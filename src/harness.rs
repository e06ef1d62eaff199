//! Stack orchestration and the run-all-and-report harness.
//!
//! [`Stack`] owns the whole bring-up: prerequisites, Kind cluster, image
//! pipeline (or registry mode), dependency deployment, migrations, seeding.
//! [`TestHarness`] runs a list of scenarios against an already-up stack and
//! prints one summary block instead of dying on the first failure -
//! provisioning costs minutes, so one bring-up should serve many scenarios.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use tracing::{info, warn};

use crate::cluster::{ClusterConfig, KindCluster};
use crate::config::EnvConfig;
use crate::engine::{BuildSpec, PodmanEngine};
use crate::image::ImagePipeline;
use crate::migrate::{apply_migrations, discover_migrations};
use crate::seed::{load_definitions, seed_workflows};
use crate::services::{deploy_stack, node_port_url, wait_stack_http_ready, StackConfig};
use crate::sink::Sink;
use crate::{cmd, kube_utils, Error, Result, SERVICE_NAMES};

/// Node registration is quick once kind returns, but not instant.
const NODES_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Build specs for the standard Strand services.
///
/// Dockerfiles live at `docker/Dockerfile.<service>` relative to the
/// repository root; every build uses the root as its context.
pub fn default_build_specs(repo_root: &Path) -> Vec<BuildSpec> {
    SERVICE_NAMES
        .iter()
        .map(|name| BuildSpec {
            service: name.to_string(),
            tag: format!("localhost/strand-{}:e2e", name),
            dockerfile: repo_root.join(format!("docker/Dockerfile.{}", name)),
            context: repo_root.to_path_buf(),
            build_args: Vec::new(),
        })
        .collect()
}

/// The full test environment for one run.
pub struct Stack {
    env: EnvConfig,
    repo_root: PathBuf,
    sink: Sink,
    cluster: Option<KindCluster>,
}

impl Stack {
    /// Create a stack from resolved configuration.
    pub fn new(env: EnvConfig, repo_root: impl Into<PathBuf>, sink: Sink) -> Self {
        Self {
            env,
            repo_root: repo_root.into(),
            sink,
            cluster: None,
        }
    }

    /// The cluster handle, once [`up`](Self::up) has created it.
    pub fn cluster(&self) -> Option<&KindCluster> {
        self.cluster.as_ref()
    }

    /// Bring the whole environment up.
    ///
    /// On failure the partially built environment is torn down again unless
    /// `STRAND_E2E_KEEP_CLUSTER` asks for a post-mortem.
    pub async fn up(&mut self) -> Result<()> {
        let result = self.bring_up().await;

        if result.is_err() {
            if self.env.keep_cluster {
                warn!("bring-up failed; keeping cluster for inspection as requested");
            } else {
                self.sink.line("[cleanup] tearing down after failure");
                self.down().await;
            }
        }

        result
    }

    async fn bring_up(&mut self) -> Result<()> {
        let local_mode = !self.env.registry_mode();

        self.sink.line("[1/6] checking prerequisites");
        let mut tools = vec![
            ("kind", "https://kind.sigs.k8s.io/docs/user/quick-start/#installation"),
            ("kubectl", "https://kubernetes.io/docs/tasks/tools/"),
        ];
        if local_mode {
            tools.push(("podman", "https://podman.io/docs/installation"));
        }
        cmd::check_prerequisites(&tools).await?;

        self.sink.line("[2/6] creating kind cluster");
        if let Some(dir) = &self.env.coverage_dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::invalid_config(format!(
                    "failed to create coverage dir {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        let cluster_config = ClusterConfig {
            name: self.env.cluster_name.clone(),
            kubeconfig: self.env.kubeconfig_path(),
            gateway_port: crate::GATEWAY_NODE_PORT,
            mock_llm_port: crate::MOCK_LLM_NODE_PORT,
            coverage_dir: self.env.coverage_dir.clone(),
        };
        let cluster = KindCluster::create(&cluster_config).await?;
        self.cluster = Some(cluster.clone());

        let stack_config = if let Some(registry) = &self.env.registry {
            self.sink
                .line("[3/6] registry mode: skipping build/export/prune/load");
            let mut config = StackConfig::registry(registry);
            config.coverage = self.env.coverage_dir.is_some();
            config
        } else {
            self.sink.line("[3/6] running image pipeline");
            let specs = default_build_specs(&self.repo_root);
            let images: BTreeMap<String, String> = specs
                .iter()
                .map(|s| (s.service.clone(), s.tag.clone()))
                .collect();

            let mut pipeline = ImagePipeline::new(
                PodmanEngine::new(),
                cluster.clone(),
                self.env.archive_dir.clone(),
                self.sink.clone(),
            );
            pipeline.run(specs).await?;

            let mut config = StackConfig::local(images);
            config.coverage = self.env.coverage_dir.is_some();
            config
        };

        self.sink.line("[4/6] deploying dependency stack");
        let client = kube_utils::create_client(cluster.kubeconfig()).await?;
        kube_utils::wait_for_nodes_ready(&client, NODES_READY_TIMEOUT).await?;
        deploy_stack(&client, cluster.kubeconfig(), &stack_config).await?;

        self.sink.line("[5/6] applying migrations");
        let migrations_dir = self.repo_root.join("migrations");
        if migrations_dir.is_dir() {
            let migrations = discover_migrations(&migrations_dir)?;
            apply_migrations(cluster.kubeconfig(), &stack_config.namespace, &migrations).await?;
        } else {
            info!(dir = %migrations_dir.display(), "no migrations directory, skipping");
        }

        self.sink.line("[6/6] waiting for HTTP and seeding workflows");
        wait_stack_http_ready(&stack_config).await?;
        let seeds_dir = self.repo_root.join("testdata/workflows");
        if seeds_dir.is_dir() {
            let definitions = load_definitions(&seeds_dir)?;
            let created =
                seed_workflows(&node_port_url(stack_config.gateway_node_port), &definitions)
                    .await?;
            info!(created, total = definitions.len(), "workflows seeded");
        } else {
            info!(dir = %seeds_dir.display(), "no workflow seeds, skipping");
        }

        self.sink.line(format!(
            "stack ready: gateway at {}",
            node_port_url(stack_config.gateway_node_port)
        ));
        Ok(())
    }

    /// Tear the environment down, best-effort.
    ///
    /// Safe to call whether or not `up` succeeded; attaches to the cluster
    /// named in the configuration if this process never created one.
    pub async fn down(&mut self) {
        if self.env.keep_cluster {
            info!(
                cluster = %self.env.cluster_name,
                "keep-cluster set, leaving environment running"
            );
            return;
        }

        let cluster = self.cluster.take().unwrap_or_else(|| {
            KindCluster::attach(self.env.cluster_name.clone(), self.env.kubeconfig_path())
        });
        if let Err(e) = cluster.delete().await {
            warn!(cluster = %cluster.name(), error = %e, "cluster teardown failed");
        }
    }
}

// =============================================================================
// Test Harness
// =============================================================================

/// Result of one harness scenario.
pub struct TestResult {
    /// Scenario name
    pub name: String,
    /// Whether it passed
    pub passed: bool,
    /// Wall-clock duration
    pub duration: Duration,
    /// Failure or panic message
    pub error: Option<String>,
}

/// Run-all-and-report scenario runner.
pub struct TestHarness {
    suite: String,
    results: Mutex<Vec<TestResult>>,
}

impl TestHarness {
    /// Create a harness for the named suite.
    pub fn new(suite: &str) -> Self {
        Self {
            suite: suite.to_string(),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Run one scenario, recording failure or panic instead of propagating.
    pub async fn run<F, Fut>(&self, name: &str, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(), String>>,
    {
        let start = std::time::Instant::now();
        let outcome = AssertUnwindSafe(f()).catch_unwind().await;
        let (passed, error) = match outcome {
            Ok(Ok(())) => (true, None),
            Ok(Err(e)) => (false, Some(e)),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                (false, Some(format!("PANIC: {msg}")))
            }
        };
        self.results
            .lock()
            .expect("results lock poisoned")
            .push(TestResult {
                name: name.to_string(),
                passed,
                duration: start.elapsed(),
                error,
            });
    }

    /// Print the summary and return an error naming the failed scenarios.
    pub fn finish(&self) -> std::result::Result<(), String> {
        let results = self.results.lock().expect("results lock poisoned");
        let total: Duration = results.iter().map(|r| r.duration).sum();
        let passed = results.iter().filter(|r| r.passed).count();
        let failed = results.len() - passed;

        info!("========================================");
        info!("  {}", self.suite.to_uppercase());
        info!("========================================");
        for r in results.iter() {
            let tag = if r.passed { "PASS" } else { "FAIL" };
            info!("  {tag}  {:40} {:.1}s", r.name, r.duration.as_secs_f64());
            if let Some(ref e) = r.error {
                // Truncate very long errors to keep the summary readable
                let truncated = if e.len() > 200 { &e[..200] } else { e };
                info!("        -> {truncated}");
            }
        }
        info!("----------------------------------------");
        info!(
            "  {} passed, {} failed ({:.1}s total)",
            passed,
            failed,
            total.as_secs_f64()
        );
        info!("========================================");

        if failed > 0 {
            let failures: Vec<_> = results
                .iter()
                .filter(|r| !r.passed)
                .map(|r| r.name.as_str())
                .collect();
            Err(format!(
                "{} scenario(s) failed in {}: {}",
                failed,
                self.suite,
                failures.join(", ")
            ))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_specs_cover_every_service() {
        let specs = default_build_specs(Path::new("/repo"));
        assert_eq!(specs.len(), SERVICE_NAMES.len());

        let gateway = &specs[0];
        assert_eq!(gateway.service, "gateway");
        assert_eq!(gateway.tag, "localhost/strand-gateway:e2e");
        assert_eq!(
            gateway.dockerfile,
            Path::new("/repo/docker/Dockerfile.gateway")
        );
        assert_eq!(gateway.context, Path::new("/repo"));
    }

    #[tokio::test]
    async fn harness_records_passes_failures_and_panics() {
        let harness = TestHarness::new("demo");
        harness.run("passes", || async { Ok(()) }).await;
        harness
            .run("fails", || async { Err("expected 2 pods".to_string()) })
            .await;
        harness
            .run("panics", || async { panic!("boom") })
            .await;

        let err = harness.finish().expect_err("two scenarios failed");
        assert!(err.contains("2 scenario(s) failed"));
        assert!(err.contains("fails"));
        assert!(err.contains("panics"));
    }

    #[tokio::test]
    async fn all_passing_suite_finishes_clean() {
        let harness = TestHarness::new("demo");
        harness.run("one", || async { Ok(()) }).await;
        harness.run("two", || async { Ok(()) }).await;
        assert!(harness.finish().is_ok());
    }
}
