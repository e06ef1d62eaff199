//! Idempotent workflow definition seeding.
//!
//! Tests assume a known set of workflow definitions exists in the gateway.
//! Seeding lists what is already there and creates only the missing ones, so
//! re-running the harness against a surviving cluster (or a second full
//! pipeline pass) changes nothing.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// A workflow definition as the gateway API accepts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    /// Unique workflow name; the idempotency key
    pub name: String,
    /// Definition body, passed through untouched
    pub spec: serde_json::Value,
}

/// Load workflow definitions from `*.json` files in `dir`, sorted by
/// filename for a stable seeding order.
pub fn load_definitions(dir: &Path) -> Result<Vec<WorkflowDef>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| Error::seed(format!("failed to read seed dir {}: {}", dir.display(), e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();

    let mut defs = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::seed(format!("failed to read {}: {}", path.display(), e)))?;
        let def: WorkflowDef = serde_json::from_str(&content)
            .map_err(|e| Error::seed(format!("invalid workflow in {}: {}", path.display(), e)))?;
        defs.push(def);
    }
    Ok(defs)
}

/// The definitions not yet present, preserving `desired` order.
fn missing_definitions<'a>(
    existing: &[String],
    desired: &'a [WorkflowDef],
) -> Vec<&'a WorkflowDef> {
    desired
        .iter()
        .filter(|def| !existing.iter().any(|name| name == &def.name))
        .collect()
}

#[derive(Debug, Deserialize)]
struct WorkflowSummary {
    name: String,
}

/// Seed `definitions` through the gateway at `base_url`.
///
/// Returns how many definitions were actually created. Transient HTTP
/// failures are retried; a rejected definition is a hard error.
pub async fn seed_workflows(base_url: &str, definitions: &[WorkflowDef]) -> Result<usize> {
    if definitions.is_empty() {
        return Ok(0);
    }

    let base = base_url.trim_end_matches('/');
    let list_url = format!("{}/api/v1/workflows", base);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| Error::seed(format!("failed to build http client: {}", e)))?;

    let existing: Vec<WorkflowSummary> =
        retry_with_backoff(&RetryConfig::default(), "list workflows", || {
            let client = client.clone();
            let url = list_url.clone();
            async move {
                let response = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| Error::seed(format!("list workflows: {}", e)))?;
                if !response.status().is_success() {
                    return Err(Error::seed(format!(
                        "list workflows returned {}",
                        response.status()
                    )));
                }
                response
                    .json()
                    .await
                    .map_err(|e| Error::seed(format!("list workflows decode: {}", e)))
            }
        })
        .await?;

    let existing_names: Vec<String> = existing.into_iter().map(|w| w.name).collect();
    let to_create = missing_definitions(&existing_names, definitions);

    if to_create.is_empty() {
        info!("all workflow definitions already seeded");
        return Ok(0);
    }

    for def in &to_create {
        info!(workflow = %def.name, "seeding workflow definition");
        let response = client
            .post(&list_url)
            .json(def)
            .send()
            .await
            .map_err(|e| Error::seed(format!("create workflow {}: {}", def.name, e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::seed(format!(
                "create workflow {} returned {}: {}",
                def.name, status, body
            )));
        }
    }

    info!(created = to_create.len(), "workflow seeding complete");
    Ok(to_create.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str) -> WorkflowDef {
        WorkflowDef {
            name: name.to_string(),
            spec: serde_json::json!({ "steps": [] }),
        }
    }

    // ==========================================================================
    // Idempotency: only missing definitions are created
    // ==========================================================================

    #[test]
    fn only_missing_definitions_are_selected() {
        let existing = vec!["summarize".to_string()];
        let desired = vec![def("summarize"), def("classify")];

        let missing = missing_definitions(&existing, &desired);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name, "classify");
    }

    #[test]
    fn a_fully_seeded_gateway_selects_nothing() {
        let existing = vec!["summarize".to_string(), "classify".to_string()];
        let desired = vec![def("summarize"), def("classify")];
        assert!(missing_definitions(&existing, &desired).is_empty());
    }

    #[test]
    fn an_empty_gateway_selects_everything_in_order() {
        let desired = vec![def("b"), def("a")];
        let missing = missing_definitions(&[], &desired);
        let names: Vec<&str> = missing.iter().map(|d| d.name.as_str()).collect();
        // Seeding order follows the desired list, not a sort.
        assert_eq!(names, ["b", "a"]);
    }

    // ==========================================================================
    // Definition loading
    // ==========================================================================

    #[test]
    fn definitions_load_sorted_by_filename() {
        let dir = tempfile::tempdir().unwrap();
        let write = |file: &str, name: &str| {
            std::fs::write(
                dir.path().join(file),
                serde_json::to_string(&def(name)).unwrap(),
            )
            .unwrap();
        };
        write("20_classify.json", "classify");
        write("10_summarize.json", "summarize");
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let defs = load_definitions(dir.path()).unwrap();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["summarize", "classify"]);
    }

    #[test]
    fn malformed_definition_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();

        let err = load_definitions(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Seed(_)));
        assert!(err.to_string().contains("bad.json"));
    }
}
