//! Kubernetes API utilities: clients, readiness polling, manifest apply.
//!
//! Readiness everywhere in this crate is poll-based: a fixed sleep interval
//! between checks up to a hard timeout, sized per target (nodes come up in
//! tens of seconds, a cold PostgreSQL with migrations can take minutes).

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{Api, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::trace;

use crate::{cmd, Error, Result};

/// Interval between readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Connection timeout for kube clients (local API server, so short).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for kube clients.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const STATUS_TRUE: &str = "True";
const CONDITION_READY: &str = "Ready";
const CONDITION_AVAILABLE: &str = "Available";

/// Create a kube client from a kubeconfig file with default timeouts.
pub async fn create_client(kubeconfig: &Path) -> Result<Client> {
    let config = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::invalid_config(format!(
            "failed to read kubeconfig {}: {}",
            kubeconfig.display(),
            e
        ))
    })?;
    let mut config = Config::from_custom_kubeconfig(config, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::invalid_config(format!("failed to load kubeconfig: {}", e)))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(Client::try_from(config)?)
}

// =============================================================================
// Condition Helpers
// =============================================================================

/// Types that carry Kubernetes-style `(type, status)` condition pairs.
pub trait HasConditionFields {
    /// The condition type field value
    fn type_field(&self) -> &str;
    /// The condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::core::v1::NodeCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for k8s_openapi::api::apps::v1::DeploymentCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for k8s_openapi::api::core::v1::PodCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Whether `conditions` contains `condition_type` with status `"True"`.
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

// =============================================================================
// Polling
// =============================================================================

/// Poll `check_fn` until it returns `Ok(true)` or `timeout` elapses.
///
/// Check errors are logged at trace level and treated as "not yet" - during
/// cluster bring-up, API calls fail for reasons that resolve themselves.
pub async fn poll_until<F, Fut>(
    operation: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = std::time::Instant::now();

    loop {
        if start.elapsed() > timeout {
            return Err(Error::timeout(operation, timeout));
        }

        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(operation, "condition not yet met"),
            Err(e) => trace!(operation, error = %e, "check failed, retrying"),
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Wait for every node to report Ready.
pub async fn wait_for_nodes_ready(client: &Client, timeout: Duration) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());

    poll_until(
        "wait for nodes ready",
        timeout,
        DEFAULT_POLL_INTERVAL,
        || {
            let nodes = nodes.clone();
            async move {
                let list = nodes.list(&ListParams::default()).await?;
                if list.items.is_empty() {
                    return Ok(false);
                }
                Ok(list.items.iter().all(|node| {
                    let conditions = node.status.as_ref().and_then(|s| s.conditions.as_deref());
                    has_condition(conditions, CONDITION_READY)
                }))
            }
        },
    )
    .await
}

/// Wait for a single deployment to report Available.
pub async fn wait_for_deployment(
    client: &Client,
    name: &str,
    namespace: &str,
    timeout: Duration,
) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let name_owned = name.to_string();

    poll_until(
        &format!("wait for deployment {}", name),
        timeout,
        DEFAULT_POLL_INTERVAL,
        || {
            let deployments = deployments.clone();
            let name = name_owned.clone();
            async move {
                match deployments.get(&name).await {
                    Ok(deployment) => {
                        let conditions = deployment
                            .status
                            .as_ref()
                            .and_then(|s| s.conditions.as_deref());
                        Ok(has_condition(conditions, CONDITION_AVAILABLE))
                    }
                    // Not created yet, keep waiting.
                    Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
        },
    )
    .await
}

/// Wait for every deployment in a namespace to report Available.
pub async fn wait_for_all_deployments(
    client: &Client,
    namespace: &str,
    timeout: Duration,
) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);

    poll_until(
        &format!("wait for deployments in {}", namespace),
        timeout,
        DEFAULT_POLL_INTERVAL,
        || {
            let deployments = deployments.clone();
            async move {
                let list = deployments.list(&ListParams::default()).await?;
                if list.items.is_empty() {
                    return Ok(false);
                }
                Ok(list.items.iter().all(|deployment| {
                    let conditions = deployment
                        .status
                        .as_ref()
                        .and_then(|s| s.conditions.as_deref());
                    has_condition(conditions, CONDITION_AVAILABLE)
                }))
            }
        },
    )
    .await
}

/// Wait for at least one pod matching `label_selector` to be Ready.
pub async fn wait_for_pod_ready(
    client: &Client,
    namespace: &str,
    label_selector: &str,
    timeout: Duration,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let selector = label_selector.to_string();

    poll_until(
        &format!("wait for pod {}", label_selector),
        timeout,
        DEFAULT_POLL_INTERVAL,
        || {
            let pods = pods.clone();
            let selector = selector.clone();
            async move {
                let list = pods.list(&ListParams::default().labels(&selector)).await?;
                Ok(list.items.iter().any(|pod| {
                    let conditions = pod.status.as_ref().and_then(|s| s.conditions.as_deref());
                    has_condition(conditions, CONDITION_READY)
                }))
            }
        },
    )
    .await
}

// =============================================================================
// Namespace and Manifest Application
// =============================================================================

/// Create a namespace if it does not already exist.
pub async fn ensure_namespace(client: &Client, name: &str) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    match namespaces.create(&PostParams::default(), &ns).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Apply a multi-document YAML manifest via `kubectl apply -f -`.
///
/// kubectl handles discovery, pruning of managed fields, and CRD ordering
/// better than a hand-rolled dynamic-object apply, and the retry wrapper
/// absorbs transient API-server hiccups.
pub async fn apply_manifests(kubeconfig: &Path, manifests: &str) -> Result<()> {
    let kubeconfig = kubeconfig.to_string_lossy().into_owned();
    cmd::kubectl_with_stdin(&kubeconfig, &["apply", "-f", "-"], manifests).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeCondition;

    fn condition(type_: &str, status: &str) -> NodeCondition {
        NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn has_condition_requires_status_true() {
        let conds = vec![condition("Ready", "True")];
        assert!(has_condition(Some(conds.as_slice()), "Ready"));

        let conds = vec![condition("Ready", "False")];
        assert!(!has_condition(Some(conds.as_slice()), "Ready"));
    }

    #[test]
    fn has_condition_is_false_for_missing_or_other_conditions() {
        assert!(!has_condition::<NodeCondition>(None, "Ready"));

        let conds = vec![condition("DiskPressure", "True")];
        assert!(!has_condition(Some(conds.as_slice()), "Ready"));
    }

    #[tokio::test]
    async fn poll_until_returns_once_the_condition_holds() {
        let mut polls = 0;
        poll_until(
            "test condition",
            Duration::from_secs(5),
            Duration::from_millis(1),
            || {
                polls += 1;
                let done = polls >= 3;
                async move { Ok(done) }
            },
        )
        .await
        .expect("condition should be met on the third poll");
        assert_eq!(polls, 3);
    }

    #[tokio::test]
    async fn poll_until_times_out_with_the_operation_name() {
        let err = poll_until(
            "never happens",
            Duration::from_millis(10),
            Duration::from_millis(1),
            || async { Ok(false) },
        )
        .await
        .expect_err("condition never holds");
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.to_string().contains("never happens"));
    }

    #[tokio::test]
    async fn poll_until_treats_check_errors_as_not_yet() {
        let mut polls = 0;
        poll_until(
            "flaky check",
            Duration::from_secs(5),
            Duration::from_millis(1),
            || {
                polls += 1;
                let attempt = polls;
                async move {
                    if attempt < 3 {
                        Err(Error::invalid_config("api server still starting"))
                    } else {
                        Ok(true)
                    }
                }
            },
        )
        .await
        .expect("errors during polling should not abort");
        assert_eq!(polls, 3);
    }
}
