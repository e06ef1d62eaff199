//! strand-e2e - end-to-end test infrastructure for the Strand stack
//!
//! Strand is deployed as four services (gateway, engine, worker, mock-llm)
//! backed by PostgreSQL and Redis. This crate provisions everything those
//! services need to run under test: an ephemeral Kind cluster, locally built
//! container images moved through a disk-space-aware export/prune/load
//! pipeline, the dependency stack, database migrations, and seeded workflow
//! definitions. It is orchestration glue over podman, kind, kubectl, and the
//! Kubernetes API - the services themselves are external collaborators.
//!
//! # Modules
//!
//! - [`cluster`] - Kind cluster provisioning and teardown
//! - [`cmd`] - Subprocess execution with timeouts and output streaming
//! - [`config`] - Environment-driven run configuration
//! - [`disk`] - Disk usage snapshots and the per-phase disk log
//! - [`engine`] - Container engine seam (podman build/save/prune)
//! - [`error`] - Error types for the harness
//! - [`harness`] - Stack orchestration and the run-all-and-report harness
//! - [`image`] - The image lifecycle pipeline (build, export, prune, load, cleanup)
//! - [`kube_utils`] - Kubernetes API utilities (clients, readiness polling)
//! - [`migrate`] - Database migration discovery and application
//! - [`retry`] - Exponential backoff with jitter
//! - [`seed`] - Idempotent workflow definition seeding
//! - [`services`] - Dependency stack manifests and deployment
//! - [`sink`] - Caller-supplied progress output sink

#![deny(missing_docs)]

pub mod cluster;
pub mod cmd;
pub mod config;
pub mod disk;
pub mod engine;
pub mod error;
pub mod harness;
pub mod image;
pub mod kube_utils;
pub mod migrate;
pub mod retry;
pub mod seed;
pub mod services;
pub mod sink;

pub use error::Error;
pub use sink::Sink;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralized so manifests, the kind config, and test fixtures agree.

/// Namespace the whole test stack is deployed into.
pub const NAMESPACE: &str = "strand-e2e";

/// Default name for the ephemeral Kind cluster.
pub const DEFAULT_CLUSTER_NAME: &str = "strand-e2e";

/// NodePort the gateway is exposed on (mapped to the host by the kind config).
pub const GATEWAY_NODE_PORT: u16 = 30080;

/// NodePort the mock LLM is exposed on (mapped to the host by the kind config).
pub const MOCK_LLM_NODE_PORT: u16 = 30081;

/// The Strand services built from this repository.
///
/// PostgreSQL and Redis are pulled from a registry and are not listed here.
pub const SERVICE_NAMES: [&str; 4] = ["gateway", "engine", "worker", "mock-llm"];
