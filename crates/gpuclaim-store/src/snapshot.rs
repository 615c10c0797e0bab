//! Seeding the store from a snapshot directory
//!
//! Layout:
//!
//! ```text
//! <dir>/claims/*.json   one AllocationClaim per file
//! <dir>/nodes/*.json    one NodeDeviceReport per file
//! ```

use gpuclaim_core::{AllocationClaim, NodeDeviceReport, SchedError, SchedResult};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::memory::MemoryStore;

/// What a snapshot load put into the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub claims: usize,
    pub nodes: usize,
}

/// Load every claim and node report under `dir` into `store`.
///
/// Missing subdirectories are skipped. A file that fails to parse aborts the
/// load; claims surface as `InvalidClaim`.
pub async fn load_snapshot(dir: &Path, store: &MemoryStore) -> SchedResult<SnapshotSummary> {
    if !dir.exists() {
        return Err(SchedError::Config(format!(
            "snapshot directory {} does not exist",
            dir.display()
        )));
    }

    let mut summary = SnapshotSummary::default();

    for path in json_files(&dir.join("claims")).await? {
        let claim: AllocationClaim = read_json(&path)
            .await
            .map_err(|e| SchedError::InvalidClaim(format!("{}: {}", path.display(), e)))?;
        store.put_claim(claim).await;
        summary.claims += 1;
    }

    for path in json_files(&dir.join("nodes")).await? {
        let report: NodeDeviceReport = read_json(&path).await?;
        store.put_node_report(report).await;
        summary.nodes += 1;
    }

    info!(
        path = %dir.display(),
        claims = summary.claims,
        nodes = summary.nodes,
        "Loaded snapshot"
    );
    Ok(summary)
}

/// JSON files in a directory, sorted by name
async fn json_files(dir: &Path) -> SchedResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        warn!(path = %dir.display(), "Snapshot subdirectory missing");
        return Ok(files);
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map_or(false, |e| e == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> SchedResult<T> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}
