//! Database migration discovery and application.
//!
//! Migrations live as `NNNN_description.sql` files. Discovery orders them by
//! numeric version and rejects anything ambiguous - a skipped or duplicated
//! version number applied against a shared test database is exactly the kind
//! of failure that wastes an afternoon. Application streams each file into
//! `psql` inside the PostgreSQL pod over `kubectl exec -i`; no database port
//! ever needs to reach the host.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::services::{DB_NAME, DB_USER, LABEL_NAME};
use crate::{cmd, Error, Result};

/// One discovered migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Numeric version parsed from the filename prefix
    pub version: u32,
    /// Description part of the filename (without version or extension)
    pub name: String,
    /// Full path to the SQL file
    pub path: PathBuf,
}

/// Discover `NNNN_description.sql` files in `dir`, ordered by version.
///
/// Non-SQL files are ignored. SQL files that do not match the naming scheme,
/// and duplicate version numbers, are errors.
pub fn discover_migrations(dir: &Path) -> Result<Vec<Migration>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::migration(format!("failed to read migrations dir {}: {}", dir.display(), e))
    })?;

    let mut migrations: Vec<Migration> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::migration(e.to_string()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let (version_str, name) = stem.split_once('_').ok_or_else(|| {
            Error::migration(format!(
                "migration {} does not match NNNN_description.sql",
                path.display()
            ))
        })?;
        let version: u32 = version_str.parse().map_err(|_| {
            Error::migration(format!(
                "migration {} has a non-numeric version prefix {:?}",
                path.display(),
                version_str
            ))
        })?;

        if let Some(existing) = migrations.iter().find(|m| m.version == version) {
            return Err(Error::migration(format!(
                "duplicate migration version {}: {} and {}",
                version,
                existing.path.display(),
                path.display()
            )));
        }

        migrations.push(Migration {
            version,
            name: name.to_string(),
            path,
        });
    }

    migrations.sort_by_key(|m| m.version);
    Ok(migrations)
}

/// Find the name of the running PostgreSQL pod.
async fn find_postgres_pod(kubeconfig: &str, namespace: &str) -> Result<String> {
    let selector = format!("{}=postgres", LABEL_NAME);
    let output = cmd::kubectl(
        kubeconfig,
        &[
            "get",
            "pods",
            "-n",
            namespace,
            "-l",
            &selector,
            "-o",
            "jsonpath={.items[0].metadata.name}",
        ],
    )
    .await?;

    let pod = output.trim().to_string();
    if pod.is_empty() {
        return Err(Error::migration(format!(
            "no postgres pod found in namespace {}",
            namespace
        )));
    }
    Ok(pod)
}

/// Apply `migrations` in order against the in-cluster PostgreSQL.
///
/// Each file is piped to `psql -v ON_ERROR_STOP=1`, so the first failing
/// statement aborts both that file and the run. Plain SQL files are
/// idempotent by convention (`CREATE TABLE IF NOT EXISTS`, guarded inserts),
/// which keeps a second full pipeline pass harmless.
pub async fn apply_migrations(
    kubeconfig: &Path,
    namespace: &str,
    migrations: &[Migration],
) -> Result<()> {
    if migrations.is_empty() {
        info!("no migrations to apply");
        return Ok(());
    }

    let kubeconfig = kubeconfig.to_string_lossy().into_owned();
    let pod = find_postgres_pod(&kubeconfig, namespace).await?;
    info!(pod = %pod, count = migrations.len(), "applying migrations");

    for migration in migrations {
        let sql = std::fs::read_to_string(&migration.path).map_err(|e| {
            Error::migration(format!(
                "failed to read migration {}: {}",
                migration.path.display(),
                e
            ))
        })?;

        info!(
            version = migration.version,
            name = %migration.name,
            "applying migration"
        );
        cmd::kubectl_with_stdin(
            &kubeconfig,
            &[
                "exec",
                "-i",
                "-n",
                namespace,
                &pod,
                "--",
                "psql",
                "-U",
                DB_USER,
                "-d",
                DB_NAME,
                "-v",
                "ON_ERROR_STOP=1",
                "-f",
                "-",
            ],
            &sql,
        )
        .await
        .map_err(|e| {
            Error::migration(format!(
                "migration {:04}_{} failed: {}",
                migration.version, migration.name, e
            ))
        })?;
    }

    info!("all migrations applied");
    Ok(())
}
