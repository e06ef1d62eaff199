//! Integration tests for the full environment lifecycle
//!
//! These tests tell the story of a CI job using the harness: bring the
//! whole stack up, verify everything the later functional tests rely on,
//! and tear it back down without leaving kind clusters behind.

use std::time::Duration;

use strand_e2e::cluster::KindCluster;
use strand_e2e::harness::Stack;
use strand_e2e::kube_utils::{create_client, wait_for_all_deployments};
use strand_e2e::services::node_port_url;
use strand_e2e::{Sink, GATEWAY_NODE_PORT, NAMESPACE};

use super::{repo_root, test_env};

/// Story: one `up` call produces a cluster where every deployment is
/// Available and the gateway answers over its NodePort; one `down` call
/// removes the cluster again.
#[tokio::test]
#[ignore = "requires podman, kind, and kubectl - run with: cargo test --test e2e -- --ignored"]
async fn story_full_stack_comes_up_ready_and_tears_down_clean() {
    let env = test_env("strand-e2e-it-lifecycle");
    let kubeconfig = env.kubeconfig_path();
    let mut stack = Stack::new(env, repo_root(), Sink::stdout());

    stack.up().await.expect("stack should come up");

    // The cluster exists and every deployment in the namespace is Available.
    let cluster = stack.cluster().expect("up should record the cluster");
    assert!(cluster.exists().await.expect("kind get clusters"));

    let client = create_client(&kubeconfig).await.expect("client");
    wait_for_all_deployments(&client, NAMESPACE, Duration::from_secs(60))
        .await
        .expect("deployments should already be available after up");

    // The gateway answers on the host-mapped NodePort.
    let health = reqwest::get(format!("{}/healthz", node_port_url(GATEWAY_NODE_PORT)))
        .await
        .expect("gateway should be reachable");
    assert!(health.status().is_success());

    stack.down().await;

    let gone = KindCluster::attach("strand-e2e-it-lifecycle", &kubeconfig);
    assert!(
        !gone.exists().await.expect("kind get clusters"),
        "cluster should be deleted by down"
    );
    assert!(!kubeconfig.exists(), "kubeconfig should be removed");
}

/// Story: a failed bring-up does not leave a cluster behind.
///
/// Pointing the builder at a repository with no Dockerfiles makes the
/// pipeline fail fast; the stack must clean up after itself.
#[tokio::test]
#[ignore = "requires podman, kind, and kubectl - run with: cargo test --test e2e -- --ignored"]
async fn story_failed_bring_up_cleans_up_after_itself() {
    let env = test_env("strand-e2e-it-failfast");
    let kubeconfig = env.kubeconfig_path();
    let empty_repo = tempfile::tempdir().expect("tempdir");

    let mut stack = Stack::new(env, empty_repo.path(), Sink::stdout());
    stack
        .up()
        .await
        .expect_err("builds against an empty repo must fail");

    let cluster = KindCluster::attach("strand-e2e-it-failfast", &kubeconfig);
    assert!(
        !cluster.exists().await.expect("kind get clusters"),
        "failed bring-up should tear the cluster down"
    );
}
