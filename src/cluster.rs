//! Kind cluster provisioning and teardown.
//!
//! The cluster config is generated in memory and piped to `kind create
//! cluster --config -`, never written to disk. NodePorts for the gateway and
//! the mock LLM are mapped to the host so tests can poll them over plain
//! HTTP; when coverage collection is enabled the host coverage directory is
//! mounted into the node so instrumented services can write their data out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::image::ArchiveLoader;
use crate::{cmd, Result};

/// Creating a kind cluster pulls the node image on first use.
const CREATE_TIMEOUT: Duration = Duration::from_secs(300);

/// Deleting is quick but involves container teardown.
const DELETE_TIMEOUT: Duration = Duration::from_secs(120);

/// Loading an image archive streams gigabytes into the node container.
const LOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Container path instrumented services write coverage data to.
pub const COVERAGE_CONTAINER_PATH: &str = "/coverage";

/// Inputs for cluster creation.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster name (also names the kind node containers)
    pub name: String,
    /// Where to write the cluster's kubeconfig
    pub kubeconfig: PathBuf,
    /// Host port mapped to the gateway NodePort
    pub gateway_port: u16,
    /// Host port mapped to the mock LLM NodePort
    pub mock_llm_port: u16,
    /// Host directory to mount at [`COVERAGE_CONTAINER_PATH`], if coverage
    /// collection is enabled
    pub coverage_dir: Option<PathBuf>,
}

/// Handle to a running Kind cluster.
#[derive(Debug, Clone)]
pub struct KindCluster {
    name: String,
    kubeconfig: PathBuf,
}

impl KindCluster {
    /// Create the cluster, deleting any stale cluster of the same name
    /// first, and wait for the node to register.
    pub async fn create(config: &ClusterConfig) -> Result<Self> {
        // A leftover cluster from a crashed run would otherwise make create
        // fail with a name conflict.
        info!(cluster = %config.name, "deleting stale cluster if present");
        let _ = cmd::run(
            "kind",
            &["delete", "cluster", "--name", &config.name],
            DELETE_TIMEOUT,
        )
        .await;

        let kind_config = render_kind_config(config);
        let kubeconfig = config.kubeconfig.to_string_lossy().into_owned();

        info!(cluster = %config.name, "creating kind cluster");
        cmd::run_with_stdin(
            "kind",
            &[
                "create",
                "cluster",
                "--name",
                &config.name,
                "--config",
                "-",
                "--kubeconfig",
                &kubeconfig,
            ],
            &kind_config,
            CREATE_TIMEOUT,
        )
        .await?;

        info!(cluster = %config.name, "kind cluster created");
        Ok(Self {
            name: config.name.clone(),
            kubeconfig: config.kubeconfig.clone(),
        })
    }

    /// Attach to an already-running cluster without creating it.
    pub fn attach(name: impl Into<String>, kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kubeconfig: kubeconfig.into(),
        }
    }

    /// The cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path to the cluster's kubeconfig file.
    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    /// Whether a kind cluster with this name currently exists.
    pub async fn exists(&self) -> Result<bool> {
        let output = cmd::run("kind", &["get", "clusters"], cmd::DEFAULT_COMMAND_TIMEOUT).await?;
        Ok(output.lines().any(|line| line.trim() == self.name))
    }

    /// Delete the cluster and its kubeconfig. Best-effort on the file.
    pub async fn delete(&self) -> Result<()> {
        info!(cluster = %self.name, "deleting kind cluster");
        cmd::run(
            "kind",
            &["delete", "cluster", "--name", &self.name],
            DELETE_TIMEOUT,
        )
        .await?;

        if let Err(e) = std::fs::remove_file(&self.kubeconfig) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    path = %self.kubeconfig.display(),
                    error = %e,
                    "failed to remove kubeconfig"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ArchiveLoader for KindCluster {
    async fn load_archive(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy().into_owned();
        info!(cluster = %self.name, archive = %path_str, "loading image archive");
        cmd::run(
            "kind",
            &["load", "image-archive", &path_str, "--name", &self.name],
            LOAD_TIMEOUT,
        )
        .await
        .map(|_| ())
    }
}

/// Render the kind cluster config for `config`.
fn render_kind_config(config: &ClusterConfig) -> String {
    let mut doc = format!(
        r#"kind: Cluster
apiVersion: kind.x-k8s.io/v1alpha4
nodes:
- role: control-plane
  extraPortMappings:
  - containerPort: {gateway_port}
    hostPort: {gateway_port}
    protocol: TCP
  - containerPort: {mock_llm_port}
    hostPort: {mock_llm_port}
    protocol: TCP
"#,
        gateway_port = config.gateway_port,
        mock_llm_port = config.mock_llm_port,
    );

    if let Some(dir) = &config.coverage_dir {
        doc.push_str(&format!(
            r#"  extraMounts:
  - hostPath: {host_path}
    containerPath: {container_path}
"#,
            host_path = dir.display(),
            container_path = COVERAGE_CONTAINER_PATH,
        ));
    }

    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ClusterConfig {
        ClusterConfig {
            name: "strand-e2e".to_string(),
            kubeconfig: PathBuf::from("/tmp/strand-e2e-kubeconfig"),
            gateway_port: 30080,
            mock_llm_port: 30081,
            coverage_dir: None,
        }
    }

    #[test]
    fn kind_config_maps_both_node_ports() {
        let doc = render_kind_config(&sample_config());
        assert!(doc.contains("containerPort: 30080"));
        assert!(doc.contains("containerPort: 30081"));
        assert!(doc.contains("role: control-plane"));
        // Valid YAML, since it goes straight into kind's stdin.
        let parsed: serde_yaml::Value = serde_yaml::from_str(&doc).expect("config should parse");
        assert_eq!(parsed["kind"], serde_yaml::Value::from("Cluster"));
    }

    #[test]
    fn coverage_dir_adds_an_extra_mount() {
        let mut config = sample_config();
        config.coverage_dir = Some(PathBuf::from("/tmp/strand-coverage"));
        let doc = render_kind_config(&config);
        assert!(doc.contains("hostPath: /tmp/strand-coverage"));
        assert!(doc.contains("containerPath: /coverage"));
        let parsed: serde_yaml::Value = serde_yaml::from_str(&doc).expect("config should parse");
        assert!(parsed["nodes"][0]["extraMounts"].is_sequence());
    }

    #[test]
    fn no_coverage_dir_means_no_mounts() {
        let doc = render_kind_config(&sample_config());
        assert!(!doc.contains("extraMounts"));
    }
}
