//! GPU device telemetry as published per node

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Represents a GPU device on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Device id
    pub id: u32,
    /// Pod uids currently using the device
    #[serde(default)]
    pub in_use_by: BTreeSet<String>,
    /// Device health
    #[serde(default)]
    pub health: DeviceHealth,
    /// Bandwidth in GB/s to peers
    #[serde(default, rename = "bandwidthGBps")]
    pub bandwidth: u32,
    /// Interconnect island identifier
    #[serde(default)]
    pub island: String,
}

impl Device {
    /// Create a healthy device
    pub fn new(id: u32, island: impl Into<String>, bandwidth: u32) -> Self {
        Self {
            id,
            in_use_by: BTreeSet::new(),
            health: DeviceHealth::Healthy,
            bandwidth,
            island: island.into(),
        }
    }

    /// Whether the device may be scored and leased
    pub fn is_usable(&self) -> bool {
        self.health != DeviceHealth::Unhealthy
    }
}

/// Device health as reported by the node agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceHealth {
    #[default]
    #[serde(rename = "healthy", alias = "Healthy")]
    Healthy,
    #[serde(rename = "unhealthy", alias = "Unhealthy")]
    Unhealthy,
    #[serde(other)]
    Other,
}

impl std::fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceHealth::Healthy => write!(f, "Healthy"),
            DeviceHealth::Unhealthy => write!(f, "Unhealthy"),
            DeviceHealth::Other => write!(f, "Other"),
        }
    }
}

/// Per-node device telemetry snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeviceReport {
    /// Node name
    #[serde(default)]
    pub node_name: String,
    /// Node labels, matched against claim selectors
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Devices ordered by id
    #[serde(default)]
    pub devices: Vec<Device>,
    /// Total number of devices
    #[serde(default)]
    pub total: u32,
}

impl NodeDeviceReport {
    /// Create a report, sorting devices by id
    pub fn new(node_name: impl Into<String>, mut devices: Vec<Device>) -> Self {
        devices.sort_by_key(|d| d.id);
        Self {
            node_name: node_name.into(),
            labels: BTreeMap::new(),
            total: devices.len() as u32,
            devices,
        }
    }

    /// Usable devices in ascending id order
    pub fn usable_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .iter()
            .filter(|d| d.is_usable())
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.id);
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_sorted_by_id() {
        let report = NodeDeviceReport::new(
            "node-a",
            vec![Device::new(2, "A", 10), Device::new(0, "A", 10)],
        );
        let ids: Vec<u32> = report.devices.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![0, 2]);
        assert_eq!(report.total, 2);
    }

    #[test]
    fn test_usable_devices() {
        let mut sick = Device::new(1, "A", 10);
        sick.health = DeviceHealth::Unhealthy;
        let mut odd = Device::new(2, "A", 10);
        odd.health = DeviceHealth::Other;

        let report = NodeDeviceReport::new("node-a", vec![Device::new(0, "A", 10), sick, odd]);
        let ids: Vec<u32> = report.usable_devices().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn test_report_parse() {
        let json = r#"{
            "nodeName": "node-a",
            "devices": [
                {"id": 0, "health": "Healthy", "bandwidthGBps": 300, "island": "nvl0"},
                {"id": 1, "health": "Unknown", "inUseBy": ["uid-1"]}
            ],
            "total": 2
        }"#;
        let report: NodeDeviceReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.devices[0].bandwidth, 300);
        assert_eq!(report.devices[1].health, DeviceHealth::Other);
        assert!(report.devices[1].in_use_by.contains("uid-1"));
    }
}
