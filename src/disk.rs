//! Disk usage snapshots and the per-phase disk log.
//!
//! The image pipeline moves multi-gigabyte archives through a CI runner with
//! a hard disk budget. Each phase boundary takes a snapshot of the root
//! filesystem and appends it to a [`PhaseLog`], giving a post-hoc trail of
//! where the space went when a run dies on a full disk. Tracking is
//! diagnostic, not load-bearing: a failed probe logs a warning and the run
//! continues.

use std::time::Duration;

use tracing::warn;

use crate::sink::Sink;
use crate::{cmd, Error, Result};

/// Timeout for the `df` shell-out. The probe is diagnostic, so it gets a
/// short leash.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time usage of the root filesystem. Immutable once captured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskUsage {
    /// Filesystem capacity in bytes
    pub total_bytes: u64,
    /// Bytes in use
    pub used_bytes: u64,
    /// Bytes available to unprivileged processes
    pub available_bytes: u64,
    /// used / total, as a percentage
    pub used_percent: f64,
}

impl DiskUsage {
    /// Render as a single human-readable summary, e.g.
    /// `38.2/100.0 GiB used (38.2%), 61.8 GiB free`.
    pub fn summary(&self) -> String {
        format!(
            "{:.1}/{:.1} GiB used ({:.1}%), {:.1} GiB free",
            gib(self.used_bytes),
            gib(self.total_bytes),
            self.used_percent,
            gib(self.available_bytes),
        )
    }
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

/// Capture a snapshot of root-filesystem usage via `df -kP /`.
pub async fn snapshot() -> Result<DiskUsage> {
    let output = cmd::run("df", &["-kP", "/"], PROBE_TIMEOUT)
        .await
        .map_err(|e| Error::disk_probe(format!("df failed: {}", e)))?;
    parse_df(&output)
}

/// Parse POSIX `df -kP` output (header line plus one data row for `/`).
fn parse_df(output: &str) -> Result<DiskUsage> {
    let row = output
        .lines()
        .nth(1)
        .ok_or_else(|| Error::disk_probe("df output has no data row"))?;

    // Expected: filesystem, 1024-blocks, used, available, capacity, mount
    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() < 5 {
        return Err(Error::disk_probe(format!(
            "df row has {} fields, expected at least 5: {:?}",
            fields.len(),
            row
        )));
    }

    let parse_kb = |field: &str, name: &str| -> Result<u64> {
        field
            .parse::<u64>()
            .map(|kb| kb * 1024)
            .map_err(|e| Error::disk_probe(format!("bad {} field {:?}: {}", name, field, e)))
    };

    let total_bytes = parse_kb(fields[1], "total")?;
    let used_bytes = parse_kb(fields[2], "used")?;
    let available_bytes = parse_kb(fields[3], "available")?;

    let used_percent = if total_bytes == 0 {
        0.0
    } else {
        used_bytes as f64 / total_bytes as f64 * 100.0
    };

    Ok(DiskUsage {
        total_bytes,
        used_bytes,
        available_bytes,
        used_percent,
    })
}

// =============================================================================
// Phase Log
// =============================================================================

/// Append-only record of `(phase, snapshot)` pairs, one per pipeline
/// checkpoint, mirrored as bracketed lines on the output sink.
///
/// Entries live only as long as the pipeline invocation that owns the log.
pub struct PhaseLog {
    sink: Sink,
    entries: Vec<(String, Option<DiskUsage>)>,
}

impl PhaseLog {
    /// Create a log writing checkpoint lines to `sink`.
    pub fn new(sink: Sink) -> Self {
        Self {
            sink,
            entries: Vec::new(),
        }
    }

    /// Record a checkpoint for `phase`.
    ///
    /// A probe failure is recorded as a gap and logged as a warning; it never
    /// fails the pipeline.
    pub async fn checkpoint(&mut self, phase: &str) {
        match snapshot().await {
            Ok(usage) => {
                self.sink
                    .line(format!("[{}] disk: {}", phase, usage.summary()));
                self.entries.push((phase.to_string(), Some(usage)));
            }
            Err(e) => {
                warn!(phase, error = %e, "disk probe failed, continuing without snapshot");
                self.entries.push((phase.to_string(), None));
            }
        }
    }

    /// The recorded checkpoints, in order.
    pub fn entries(&self) -> &[(String, Option<DiskUsage>)] {
        &self.entries
    }
}
