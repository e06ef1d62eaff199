//! Environment-driven run configuration.
//!
//! CI call sites steer the harness entirely through `STRAND_E2E_*` variables
//! so the same test binaries work locally and on runners without flag
//! plumbing. The run id keys kubeconfig paths, letting parallel runners on
//! one host stay out of each other's way (the container engine store is
//! still shared - see the pipeline docs).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::DEFAULT_CLUSTER_NAME;

/// Unique run id for this test process.
/// Uses STRAND_E2E_RUN_ID if set (e.g. a commit SHA in CI), otherwise
/// falls back to process id and timestamp.
static RUN_ID: OnceLock<String> = OnceLock::new();

/// Get the unique run id for this test process.
pub fn run_id() -> &'static str {
    RUN_ID.get_or_init(|| {
        std::env::var("STRAND_E2E_RUN_ID").unwrap_or_else(|_| {
            format!(
                "{}-{}",
                std::process::id(),
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() % 1_000_000)
                    .unwrap_or(0)
            )
        })
    })
}

/// Resolved harness configuration.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Kind cluster name
    pub cluster_name: String,
    /// Run id used to scope per-run file paths
    pub run_id: String,
    /// Registry prefix; when set, images are pulled instead of built and the
    /// export/prune/load pipeline is skipped entirely
    pub registry: Option<String>,
    /// Host directory for coverage data; when set, coverage instrumentation
    /// is enabled across the stack
    pub coverage_dir: Option<PathBuf>,
    /// Leave the cluster running after the suite for post-mortem debugging
    pub keep_cluster: bool,
    /// Directory image archives are written to
    pub archive_dir: PathBuf,
}

impl EnvConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars, run_id())
    }

    /// Build configuration from an explicit variable map. Extracted so the
    /// parsing is testable without mutating the process environment.
    fn from_vars(vars: &HashMap<String, String>, run_id: &str) -> Self {
        let non_empty = |key: &str| -> Option<String> {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            cluster_name: non_empty("STRAND_E2E_CLUSTER_NAME")
                .unwrap_or_else(|| DEFAULT_CLUSTER_NAME.to_string()),
            run_id: run_id.to_string(),
            registry: non_empty("STRAND_E2E_REGISTRY"),
            coverage_dir: non_empty("STRAND_E2E_COVERAGE_DIR").map(PathBuf::from),
            keep_cluster: non_empty("STRAND_E2E_KEEP_CLUSTER")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(false),
            archive_dir: std::env::temp_dir(),
        }
    }

    /// Per-run kubeconfig path, e.g. `/tmp/strand-e2e-kubeconfig-8156-965202`.
    pub fn kubeconfig_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("{}-kubeconfig-{}", self.cluster_name, self.run_id))
    }

    /// Whether images come from a registry instead of local builds.
    pub fn registry_mode(&self) -> bool {
        self.registry.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = EnvConfig::from_vars(&HashMap::new(), "test-run");
        assert_eq!(config.cluster_name, DEFAULT_CLUSTER_NAME);
        assert!(!config.registry_mode());
        assert!(config.coverage_dir.is_none());
        assert!(!config.keep_cluster);
    }

    #[test]
    fn registry_mode_is_driven_by_the_registry_variable() {
        let config = EnvConfig::from_vars(
            &vars(&[("STRAND_E2E_REGISTRY", "ghcr.io/strand-dev")]),
            "test-run",
        );
        assert!(config.registry_mode());
        assert_eq!(config.registry.as_deref(), Some("ghcr.io/strand-dev"));
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config = EnvConfig::from_vars(&vars(&[("STRAND_E2E_REGISTRY", "  ")]), "test-run");
        assert!(!config.registry_mode());
    }

    #[test]
    fn keep_cluster_accepts_truthy_values_only() {
        for (value, expected) in [("1", true), ("true", true), ("0", false), ("false", false)] {
            let config =
                EnvConfig::from_vars(&vars(&[("STRAND_E2E_KEEP_CLUSTER", value)]), "test-run");
            assert_eq!(config.keep_cluster, expected, "value {:?}", value);
        }
    }

    #[test]
    fn kubeconfig_path_is_scoped_by_run_id() {
        let config = EnvConfig::from_vars(
            &vars(&[("STRAND_E2E_CLUSTER_NAME", "pr-1234")]),
            "8156-965202",
        );
        let path = config.kubeconfig_path();
        let name = path.file_name().unwrap().to_string_lossy();
        assert_eq!(name, "pr-1234-kubeconfig-8156-965202");
    }
}
