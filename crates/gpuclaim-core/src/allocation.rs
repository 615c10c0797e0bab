//! Allocation record, lease and pod identity types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::SchedError;

/// Pod annotation naming the claim a pod references
pub const ANNOTATION_CLAIM: &str = "gpu.scheduling/claim";

/// Pod annotation holding the committed `node:ids` record
pub const ANNOTATION_ALLOCATED: &str = "gpu.scheduling/allocated";

/// Environment variable the admission mutator injects from the record
pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Identity of the workload being scheduled
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    /// Unique id, used as lease holder identity
    pub uid: String,
    /// Claim referenced by the pod, if any
    #[serde(default)]
    pub claim: Option<String>,
}

impl PodRef {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
            claim: None,
        }
    }

    /// Attach a claim reference
    pub fn with_claim(mut self, claim: impl Into<String>) -> Self {
        self.claim = Some(claim.into());
        self
    }
}

impl std::fmt::Display for PodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Deterministic lease name for a device on a node
pub fn lease_name(node: &str, device_id: u32) -> String {
    format!("gpu-{}-{}", node, device_id)
}

/// A live lease over one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLease {
    /// Lease namespace
    pub namespace: String,
    pub node: String,
    pub device_id: u32,
    /// Holder identity (pod uid)
    pub holder: String,
    /// When the lease was created
    pub acquired_at: DateTime<Utc>,
}

impl DeviceLease {
    pub fn new(
        namespace: impl Into<String>,
        node: impl Into<String>,
        device_id: u32,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            node: node.into(),
            device_id,
            holder: holder.into(),
            acquired_at: Utc::now(),
        }
    }

    /// Lease name within its namespace
    pub fn name(&self) -> String {
        lease_name(&self.node, self.device_id)
    }
}

/// Final placement consumed by the admission mutator
///
/// The textual form is `<node>:<id0,id1,...>` with ids ascending and no
/// whitespace. Consumers split on the first colon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub node: String,
    pub device_ids: Vec<u32>,
}

impl AllocationRecord {
    /// Create a record, sorting ids ascending
    pub fn new(node: impl Into<String>, mut device_ids: Vec<u32>) -> Self {
        device_ids.sort_unstable();
        Self {
            node: node.into(),
            device_ids,
        }
    }

    /// Comma-joined ids, the value injected as the visible devices list
    pub fn device_list(&self) -> String {
        self.device_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl std::fmt::Display for AllocationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.device_list())
    }
}

impl FromStr for AllocationRecord {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node, ids) = s.split_once(':').ok_or_else(|| {
            SchedError::Serialization(format!("allocation record missing ':': {}", s))
        })?;
        if node.is_empty() {
            return Err(SchedError::Serialization(format!(
                "allocation record has empty node: {}",
                s
            )));
        }

        let device_ids = if ids.is_empty() {
            Vec::new()
        } else {
            ids.split(',')
                .map(|id| {
                    id.parse::<u32>().map_err(|e| {
                        SchedError::Serialization(format!("bad device id {:?}: {}", id, e))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            node: node.to_string(),
            device_ids,
        })
    }
}
