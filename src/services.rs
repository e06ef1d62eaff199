//! Dependency stack manifests and deployment.
//!
//! The test stack is PostgreSQL and Redis (pulled from a registry) plus the
//! four Strand services (built locally or pulled in registry mode).
//! Manifests are generated in memory and applied in dependency order:
//! datastores first, then the services that crash-loop without them.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use kube::Client;
use serde_json::{json, Value};
use tracing::info;

use crate::cluster::COVERAGE_CONTAINER_PATH;
use crate::kube_utils::{
    apply_manifests, ensure_namespace, wait_for_all_deployments, wait_for_deployment,
};
use crate::{Error, Result, GATEWAY_NODE_PORT, MOCK_LLM_NODE_PORT, NAMESPACE, SERVICE_NAMES};

/// PostgreSQL image for the test database.
pub const POSTGRES_IMAGE: &str = "docker.io/library/postgres:16-alpine";

/// Redis image for the test queue/cache.
pub const REDIS_IMAGE: &str = "docker.io/library/redis:7-alpine";

/// Label key carried by every pod the stack creates.
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Database role the stack and migrations connect as.
pub const DB_USER: &str = "strand";
/// Name of the test database.
pub const DB_NAME: &str = "strand";
const DB_PASSWORD: &str = "strand-e2e";

/// Datastores are small images but may need a pull on first run.
const DATASTORE_TIMEOUT: Duration = Duration::from_secs(180);

/// Strand services wait on migrations and datastores before going Ready.
const STACK_TIMEOUT: Duration = Duration::from_secs(300);

/// HTTP endpoints answer within this budget once pods are Ready.
const HTTP_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for one stack deployment.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Target namespace
    pub namespace: String,
    /// Image reference per service name
    pub images: BTreeMap<String, String>,
    /// `imagePullPolicy` for Strand containers: `Never` for kind-loaded
    /// local images, `IfNotPresent` for registry mode
    pub pull_policy: String,
    /// NodePort for the gateway Service
    pub gateway_node_port: u16,
    /// NodePort for the mock LLM Service
    pub mock_llm_node_port: u16,
    /// Mount the coverage directory and point services at it
    pub coverage: bool,
}

impl StackConfig {
    /// Config for locally built, kind-loaded images.
    pub fn local(images: BTreeMap<String, String>) -> Self {
        Self {
            namespace: NAMESPACE.to_string(),
            images,
            pull_policy: "Never".to_string(),
            gateway_node_port: GATEWAY_NODE_PORT,
            mock_llm_node_port: MOCK_LLM_NODE_PORT,
            coverage: false,
        }
    }

    /// Config for registry mode: images are pulled, nothing is loaded.
    pub fn registry(registry: &str) -> Self {
        let images = SERVICE_NAMES
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    format!("{}/strand-{}:e2e", registry.trim_end_matches('/'), name),
                )
            })
            .collect();
        Self {
            pull_policy: "IfNotPresent".to_string(),
            ..Self::local(images)
        }
    }
}

// =============================================================================
// Manifest Generation
// =============================================================================

fn labels(name: &str) -> Value {
    json!({ LABEL_NAME: name })
}

/// PostgreSQL: credentials Secret, Deployment with a `pg_isready` probe,
/// and a ClusterIP Service on 5432.
fn postgres_manifests(namespace: &str) -> Vec<Value> {
    vec![
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "strand-db-credentials", "namespace": namespace },
            "stringData": {
                "POSTGRES_USER": DB_USER,
                "POSTGRES_PASSWORD": DB_PASSWORD,
                "POSTGRES_DB": DB_NAME,
            }
        }),
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "postgres", "namespace": namespace, "labels": labels("postgres") },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": labels("postgres") },
                "template": {
                    "metadata": { "labels": labels("postgres") },
                    "spec": {
                        "containers": [{
                            "name": "postgres",
                            "image": POSTGRES_IMAGE,
                            "ports": [{ "containerPort": 5432 }],
                            "envFrom": [{ "secretRef": { "name": "strand-db-credentials" } }],
                            "readinessProbe": {
                                "exec": { "command": ["pg_isready", "-U", DB_USER] },
                                "initialDelaySeconds": 2,
                                "periodSeconds": 2,
                            }
                        }]
                    }
                }
            }
        }),
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "postgres", "namespace": namespace },
            "spec": {
                "selector": labels("postgres"),
                "ports": [{ "port": 5432, "targetPort": 5432 }],
            }
        }),
    ]
}

/// Redis: Deployment plus ClusterIP Service on 6379.
fn redis_manifests(namespace: &str) -> Vec<Value> {
    vec![
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "redis", "namespace": namespace, "labels": labels("redis") },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": labels("redis") },
                "template": {
                    "metadata": { "labels": labels("redis") },
                    "spec": {
                        "containers": [{
                            "name": "redis",
                            "image": REDIS_IMAGE,
                            "ports": [{ "containerPort": 6379 }],
                            "readinessProbe": {
                                "exec": { "command": ["redis-cli", "ping"] },
                                "initialDelaySeconds": 1,
                                "periodSeconds": 2,
                            }
                        }]
                    }
                }
            }
        }),
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "redis", "namespace": namespace },
            "spec": {
                "selector": labels("redis"),
                "ports": [{ "port": 6379, "targetPort": 6379 }],
            }
        }),
    ]
}

fn database_url() -> String {
    format!(
        "postgres://{}:{}@postgres:5432/{}",
        DB_USER, DB_PASSWORD, DB_NAME
    )
}

/// Deployment (and Service where the component has one) for a Strand service.
fn strand_service_manifests(config: &StackConfig, name: &str, image: &str) -> Vec<Value> {
    let deployment_name = format!("strand-{}", name);

    let mut env = vec![
        json!({ "name": "DATABASE_URL", "value": database_url() }),
        json!({ "name": "REDIS_URL", "value": "redis://redis:6379" }),
    ];
    // Everything except the mock itself talks to the mock LLM in tests.
    if name != "mock-llm" {
        env.push(json!({
            "name": "STRAND_LLM_BASE_URL",
            "value": "http://strand-mock-llm:8080",
        }));
    }
    if config.coverage {
        env.push(json!({
            "name": "STRAND_COVERAGE_DIR",
            "value": COVERAGE_CONTAINER_PATH,
        }));
    }

    let mut container = json!({
        "name": name,
        "image": image,
        "imagePullPolicy": config.pull_policy,
        "ports": [{ "containerPort": 8080 }],
        "env": env,
        "readinessProbe": {
            "httpGet": { "path": "/healthz", "port": 8080 },
            "initialDelaySeconds": 2,
            "periodSeconds": 2,
        }
    });

    let mut pod_spec = json!({ "containers": [container.take()] });
    if config.coverage {
        pod_spec["containers"][0]["volumeMounts"] = json!([{
            "name": "coverage",
            "mountPath": COVERAGE_CONTAINER_PATH,
        }]);
        pod_spec["volumes"] = json!([{
            "name": "coverage",
            "hostPath": { "path": COVERAGE_CONTAINER_PATH, "type": "Directory" },
        }]);
    }

    let mut manifests = vec![json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": deployment_name,
            "namespace": config.namespace,
            "labels": labels(&deployment_name),
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": labels(&deployment_name) },
            "template": {
                "metadata": { "labels": labels(&deployment_name) },
                "spec": pod_spec,
            }
        }
    })];

    // The gateway and the mock LLM are reachable from the host; the engine
    // is cluster-internal; the worker consumes queues and has no port.
    let service_spec = match name {
        "gateway" => Some(json!({
            "type": "NodePort",
            "selector": labels(&deployment_name),
            "ports": [{ "port": 8080, "targetPort": 8080, "nodePort": config.gateway_node_port }],
        })),
        "mock-llm" => Some(json!({
            "type": "NodePort",
            "selector": labels(&deployment_name),
            "ports": [{ "port": 8080, "targetPort": 8080, "nodePort": config.mock_llm_node_port }],
        })),
        "engine" => Some(json!({
            "selector": labels(&deployment_name),
            "ports": [{ "port": 8080, "targetPort": 8080 }],
        })),
        _ => None,
    };

    if let Some(spec) = service_spec {
        manifests.push(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": deployment_name, "namespace": config.namespace },
            "spec": spec,
        }));
    }

    manifests
}

fn render_docs(docs: &[Value]) -> String {
    docs.iter()
        .map(|doc| serde_yaml::to_string(doc).expect("manifest serialization cannot fail"))
        .collect::<Vec<_>>()
        .join("---\n")
}

// =============================================================================
// Deployment
// =============================================================================

/// Deploy the full stack and wait for it to become ready.
///
/// Datastores go first and must be Available before the Strand services are
/// applied; the services then get one shared readiness deadline.
pub async fn deploy_stack(client: &Client, kubeconfig: &Path, config: &StackConfig) -> Result<()> {
    info!(namespace = %config.namespace, "deploying test stack");
    ensure_namespace(client, &config.namespace).await?;

    let mut datastores = postgres_manifests(&config.namespace);
    datastores.extend(redis_manifests(&config.namespace));
    apply_manifests(kubeconfig, &render_docs(&datastores)).await?;

    wait_for_deployment(client, "postgres", &config.namespace, DATASTORE_TIMEOUT).await?;
    wait_for_deployment(client, "redis", &config.namespace, DATASTORE_TIMEOUT).await?;
    info!("datastores ready");

    let mut services = Vec::new();
    for name in SERVICE_NAMES {
        let image = config.images.get(name).ok_or_else(|| {
            Error::invalid_config(format!("no image configured for service {}", name))
        })?;
        services.extend(strand_service_manifests(config, name, image));
    }
    apply_manifests(kubeconfig, &render_docs(&services)).await?;

    wait_for_all_deployments(client, &config.namespace, STACK_TIMEOUT).await?;
    info!("stack deployments available");
    Ok(())
}

/// Base URL for a NodePort service exposed on the host.
pub fn node_port_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

/// Poll an HTTP health endpoint until it answers 2xx.
pub async fn wait_http_ready(base_url: &str, timeout: Duration) -> Result<()> {
    let url = format!("{}/healthz", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| Error::invalid_config(format!("failed to build http client: {}", e)))?;

    crate::kube_utils::poll_until(
        &format!("wait for {}", url),
        timeout,
        crate::kube_utils::DEFAULT_POLL_INTERVAL,
        || {
            let client = client.clone();
            let url = url.clone();
            async move {
                match client.get(&url).send().await {
                    Ok(response) => Ok(response.status().is_success()),
                    // Connection refused until the NodePort backend exists.
                    Err(_) => Ok(false),
                }
            }
        },
    )
    .await
}

/// Wait for the gateway and mock LLM HTTP endpoints, with the default budget.
pub async fn wait_stack_http_ready(config: &StackConfig) -> Result<()> {
    wait_http_ready(&node_port_url(config.gateway_node_port), HTTP_READY_TIMEOUT).await?;
    wait_http_ready(&node_port_url(config.mock_llm_node_port), HTTP_READY_TIMEOUT).await?;
    Ok(())
}
