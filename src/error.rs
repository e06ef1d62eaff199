//! Error types for the test harness

use std::time::Duration;

use thiserror::Error;

/// Main error type for harness operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// External command failed to spawn or exited non-zero
    #[error("command failed: {command} - {message}")]
    Command {
        /// The command that failed
        command: String,
        /// Captured stderr or spawn error
        message: String,
    },

    /// Image build failure (fatal to the pipeline)
    #[error("build error: {0}")]
    Build(String),

    /// Image export failure, including the archive size sanity check
    #[error("export error: {0}")]
    Export(String),

    /// Archive load into the cluster failed
    #[error("load error: {0}")]
    Load(String),

    /// Disk usage probe failed (callers downgrade this to a warning)
    #[error("disk probe error: {0}")]
    DiskProbe(String),

    /// An operation exceeded its deadline
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// How long it was allowed to run
        elapsed: Duration,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Database migration discovery or application error
    #[error("migration error: {0}")]
    Migration(String),

    /// Workflow seeding error
    #[error("seed error: {0}")]
    Seed(String),

    /// Invalid harness configuration
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a command error with the given command line and message
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a build error with the given message
    pub fn build(msg: impl Into<String>) -> Self {
        Self::Build(msg.into())
    }

    /// Create an export error with the given message
    pub fn export(msg: impl Into<String>) -> Self {
        Self::Export(msg.into())
    }

    /// Create a load error with the given message
    pub fn load(msg: impl Into<String>) -> Self {
        Self::Load(msg.into())
    }

    /// Create a disk probe error with the given message
    pub fn disk_probe(msg: impl Into<String>) -> Self {
        Self::DiskProbe(msg.into())
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Create a migration error with the given message
    pub fn migration(msg: impl Into<String>) -> Self {
        Self::Migration(msg.into())
    }

    /// Create a seed error with the given message
    pub fn seed(msg: impl Into<String>) -> Self {
        Self::Seed(msg.into())
    }

    /// Create an invalid config error with the given message
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
