//! strand-e2e - bring the Strand end-to-end test environment up and down

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use strand_e2e::cluster::KindCluster;
use strand_e2e::config::EnvConfig;
use strand_e2e::engine::PodmanEngine;
use strand_e2e::harness::{default_build_specs, Stack};
use strand_e2e::image::ImagePipeline;
use strand_e2e::Sink;

/// Strand end-to-end test environment
///
/// Provisions an ephemeral kind cluster, builds and loads the Strand images
/// through the disk-aware pipeline, deploys PostgreSQL/Redis/the Strand
/// services, applies migrations, and seeds workflow definitions.
/// Configuration comes from STRAND_E2E_* environment variables.
#[derive(Parser, Debug)]
#[command(name = "strand-e2e", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring the full test environment up
    Up(RepoArgs),

    /// Tear the test environment down
    ///
    /// Deletes the kind cluster and the per-run kubeconfig. A no-op when
    /// STRAND_E2E_KEEP_CLUSTER is set.
    Down,

    /// Run only the image pipeline against an existing cluster
    ///
    /// Useful for iterating on service code without re-provisioning:
    /// rebuilds the images, exports, prunes, and loads them into the
    /// running cluster.
    Images(RepoArgs),
}

/// Arguments shared by commands that build from the repository
#[derive(Parser, Debug)]
struct RepoArgs {
    /// Path to the Strand repository root
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let env = EnvConfig::from_env();
    let sink = Sink::stdout();

    match cli.command {
        Commands::Up(args) => {
            let mut stack = Stack::new(env, args.repo_root, sink);
            stack.up().await?;
        }
        Commands::Down => {
            let mut stack = Stack::new(env, ".", sink);
            stack.down().await;
        }
        Commands::Images(args) => {
            let cluster = KindCluster::attach(env.cluster_name.clone(), env.kubeconfig_path());
            if !cluster.exists().await? {
                anyhow::bail!(
                    "kind cluster {} is not running; use `strand-e2e up` first",
                    env.cluster_name
                );
            }

            let specs = default_build_specs(&args.repo_root);
            let mut pipeline = ImagePipeline::new(
                PodmanEngine::new(),
                cluster,
                env.archive_dir.clone(),
                sink,
            );
            pipeline.run(specs).await?;
        }
    }

    Ok(())
}
