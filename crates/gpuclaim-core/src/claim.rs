//! Claim and requirement type definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default device count when a claim asks for zero or fewer devices
pub const DEFAULT_DEVICE_COUNT: u32 = 1;

/// Declarative request for GPU devices, owned by the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationClaim {
    /// Namespace of the claim
    #[serde(default)]
    pub namespace: String,
    /// Claim name
    #[serde(default)]
    pub name: String,
    /// Device request
    pub devices: DeviceRequest,
    /// Topology requirement
    #[serde(default)]
    pub topology: Option<TopologyPolicy>,
    /// Node selector
    #[serde(default)]
    pub selector: Option<NodeSelector>,
    /// External gang (pod group) reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gang_ref: Option<String>,
}

impl AllocationClaim {
    /// Create a claim for `count` devices with default policy
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, count: i32) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            devices: DeviceRequest {
                count,
                ..DeviceRequest::default()
            },
            topology: None,
            selector: None,
            gang_ref: None,
        }
    }
}

/// Device count and placement policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    /// Requested device count (values <= 0 mean one device)
    #[serde(default)]
    pub count: i32,
    /// Placement policy
    #[serde(default)]
    pub policy: PlacementPolicy,
    /// Optional pinned device ids
    #[serde(default)]
    pub prefer_ids: Vec<u32>,
    /// Exclusivity mode
    #[serde(default)]
    pub exclusivity: Exclusivity,
}

/// How devices should be laid out on a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementPolicy {
    #[default]
    #[serde(rename = "contiguous", alias = "Contiguous")]
    Contiguous,
    #[serde(rename = "spread", alias = "Spread")]
    Spread,
    #[serde(rename = "preferIds", alias = "PreferIds")]
    PreferIds,
}

impl std::fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementPolicy::Contiguous => write!(f, "contiguous"),
            PlacementPolicy::Spread => write!(f, "spread"),
            PlacementPolicy::PreferIds => write!(f, "preferIds"),
        }
    }
}

/// Device sharing mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Exclusivity {
    #[default]
    #[serde(rename = "exclusive", alias = "Exclusive")]
    Exclusive,
    #[serde(rename = "shared", alias = "Shared")]
    Shared,
    #[serde(rename = "mig", alias = "MIG")]
    Mig,
}

/// Interconnect topology requirement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyPolicy {
    #[serde(default)]
    pub mode: TopologyMode,
    /// Minimum bandwidth in GB/s for the chosen set
    #[serde(default, rename = "minBandwidthGBps")]
    pub min_bandwidth_gbps: i32,
}

/// How strictly the topology requirement is enforced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyMode {
    /// Nodes without a feasible contiguous set are rejected
    #[serde(rename = "required", alias = "Required")]
    Required,
    /// Nodes without a feasible contiguous set are not ranked
    #[default]
    #[serde(rename = "preferred", alias = "Preferred")]
    Preferred,
    /// Topology does not affect feasibility
    #[serde(rename = "ignore", alias = "Ignore")]
    Ignore,
}

/// Label selector, all pairs must match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl NodeSelector {
    /// Check whether a node's labels satisfy the selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Resolved, validated form of a claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub namespace: String,
    pub claim_name: String,
    /// Normalized device count, always >= 1
    pub count: u32,
    pub policy: PlacementPolicy,
    pub pinned_ids: Vec<u32>,
    pub exclusivity: Exclusivity,
    pub topology: TopologyPolicy,
    pub selector: NodeSelector,
    pub gang_ref: Option<String>,
}

impl Requirement {
    /// Minimum bandwidth as an unsigned value
    pub fn min_bandwidth(&self) -> u32 {
        self.topology.min_bandwidth_gbps.max(0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_parse() {
        let json = r#"{
            "namespace": "ml",
            "name": "train-4",
            "devices": {"count": 4, "policy": "contiguous", "exclusivity": "Exclusive"},
            "topology": {"mode": "Required", "minBandwidthGBps": 300},
            "selector": {"matchLabels": {"gpu": "a100"}},
            "gangRef": "pg-1"
        }"#;
        let claim: AllocationClaim = serde_json::from_str(json).unwrap();
        assert_eq!(claim.devices.count, 4);
        assert_eq!(claim.devices.exclusivity, Exclusivity::Exclusive);
        let topo = claim.topology.unwrap();
        assert_eq!(topo.mode, TopologyMode::Required);
        assert_eq!(topo.min_bandwidth_gbps, 300);
        assert_eq!(claim.gang_ref.as_deref(), Some("pg-1"));
    }

    #[test]
    fn test_claim_defaults() {
        let json = r#"{"namespace": "ml", "name": "c", "devices": {}}"#;
        let claim: AllocationClaim = serde_json::from_str(json).unwrap();
        assert_eq!(claim.devices.count, 0);
        assert_eq!(claim.devices.policy, PlacementPolicy::Contiguous);
        assert!(claim.topology.is_none());
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let json = r#"{"namespace": "ml", "name": "c", "devices": {"policy": "random"}}"#;
        assert!(serde_json::from_str::<AllocationClaim>(json).is_err());
    }

    #[test]
    fn test_selector_matches() {
        let mut selector = NodeSelector::default();
        selector
            .match_labels
            .insert("gpu".to_string(), "h100".to_string());

        let mut labels = BTreeMap::new();
        assert!(!selector.matches(&labels));
        labels.insert("gpu".to_string(), "h100".to_string());
        labels.insert("zone".to_string(), "a".to_string());
        assert!(selector.matches(&labels));
        assert!(NodeSelector::default().matches(&BTreeMap::new()));
    }
}
