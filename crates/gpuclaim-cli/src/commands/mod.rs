//! CLI commands implementation

use anyhow::{Context, Result};
use gpuclaim_core::{
    AllocationClaim, AllocationRecord, DeviceLease, NodeDeviceReport, ANNOTATION_ALLOCATED,
    VISIBLE_DEVICES_ENV,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Schedule response from API
#[derive(Debug, Deserialize)]
pub struct ScheduleResponse {
    pub node: String,
    pub device_ids: Vec<u32>,
    pub allocation: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Allocation response from API
#[derive(Debug, Deserialize)]
pub struct AllocationResponse {
    pub namespace: String,
    pub pod: String,
    pub node: String,
    pub device_ids: Vec<u32>,
    pub allocation: String,
}

/// Store statistics reported by the daemon
#[derive(Debug, Deserialize)]
pub struct StoreStats {
    pub claims: usize,
    pub nodes: usize,
    pub leases: usize,
    pub allocations: usize,
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub lease_namespace: String,
    pub store: StoreStats,
}

/// List node reports
pub async fn nodes(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/api/v1/nodes")).send().await?;

    if response.status().is_success() {
        let reports: Vec<NodeDeviceReport> = response.json().await?;

        if reports.is_empty() {
            println!("No nodes reported");
        } else {
            println!("{:<24} {:<8} {:<8} {:<20}", "NODE", "TOTAL", "USABLE", "ISLANDS");
            println!("{}", "-".repeat(64));
            for report in reports {
                println!(
                    "{:<24} {:<8} {:<8} {:<20}",
                    report.node_name,
                    report.total,
                    report.usable_devices().len(),
                    island_summary(&report)
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list nodes: {}", error);
    }

    Ok(())
}

/// List leases
pub async fn leases(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/api/v1/leases")).send().await?;

    if response.status().is_success() {
        let leases: Vec<DeviceLease> = response.json().await?;

        if leases.is_empty() {
            println!("No leases held");
        } else {
            println!("{:<32} {:<38} {:<25}", "LEASE", "HOLDER", "ACQUIRED");
            println!("{}", "-".repeat(96));
            for lease in leases {
                println!(
                    "{:<32} {:<38} {:<25}",
                    lease.name(),
                    lease.holder,
                    lease.acquired_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list leases: {}", error);
    }

    Ok(())
}

/// Create or replace a claim from a JSON file
pub async fn claim_apply(client: &ApiClient, file: &Path) -> Result<()> {
    let claim: AllocationClaim = read_json(file)?;
    if claim.namespace.is_empty() || claim.name.is_empty() {
        anyhow::bail!("claim in {} needs a namespace and a name", file.display());
    }

    let response = client
        .client
        .put(client.url(&format!(
            "/api/v1/claims/{}/{}",
            claim.namespace, claim.name
        )))
        .json(&claim)
        .send()
        .await?;

    if response.status().is_success() {
        println!(
            "Claim '{}/{}' applied ({} devices)",
            claim.namespace, claim.name, claim.devices.count
        );
    } else {
        let error = response.text().await?;
        eprintln!("Failed to apply claim: {}", error);
    }

    Ok(())
}

/// Publish a node report from a JSON file
pub async fn node_apply(client: &ApiClient, file: &Path) -> Result<()> {
    let report: NodeDeviceReport = read_json(file)?;
    if report.node_name.is_empty() {
        anyhow::bail!("node report in {} has no nodeName", file.display());
    }

    let response = client
        .client
        .put(client.url(&format!("/api/v1/nodes/{}", report.node_name)))
        .json(&report)
        .send()
        .await?;

    if response.status().is_success() {
        println!(
            "Node '{}' published ({} devices)",
            report.node_name,
            report.devices.len()
        );
    } else {
        let error = response.text().await?;
        eprintln!("Failed to publish node report: {}", error);
    }

    Ok(())
}

/// Run a scheduling cycle
pub async fn schedule(
    client: &ApiClient,
    namespace: String,
    pod: String,
    claim: String,
    uid: Option<String>,
    nodes: Vec<String>,
) -> Result<()> {
    #[derive(Serialize)]
    struct ScheduleRequest {
        namespace: String,
        pod: String,
        claim: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        uid: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        nodes: Option<Vec<String>>,
    }

    let req = ScheduleRequest {
        namespace: namespace.clone(),
        pod: pod.clone(),
        claim,
        uid,
        nodes: if nodes.is_empty() { None } else { Some(nodes) },
    };

    let response = client
        .client
        .post(client.url("/api/v1/schedule"))
        .json(&req)
        .send()
        .await?;

    if response.status().is_success() {
        let scheduled: ScheduleResponse = response.json().await?;
        println!("Pod '{}/{}' scheduled to {}", namespace, pod, scheduled.node);
        println!("  GPUs: {:?}", scheduled.device_ids);
        println!("  Allocation: {}", scheduled.allocation);
        for (key, value) in &scheduled.annotations {
            println!("  Annotation {}={}", key, value);
        }
        for (key, value) in &scheduled.env {
            println!("  Env {}={}", key, value);
        }
    } else {
        let status = response.status();
        let error = response.text().await?;
        eprintln!("Failed to schedule pod ({}): {}", status, error);
    }

    Ok(())
}

/// Show the allocation of a pod
pub async fn allocation(client: &ApiClient, namespace: &str, pod: &str) -> Result<()> {
    let response = client
        .client
        .get(client.url(&format!("/api/v1/allocations/{}/{}", namespace, pod)))
        .send()
        .await?;

    if response.status().is_success() {
        let allocation: AllocationResponse = response.json().await?;
        println!("Pod: {}/{}", allocation.namespace, allocation.pod);
        println!("  Node: {}", allocation.node);
        println!("  GPUs: {:?}", allocation.device_ids);
        println!("  {}: {}", ANNOTATION_ALLOCATED, allocation.allocation);
    } else {
        let error = response.text().await?;
        eprintln!("Allocation not found: {}", error);
    }

    Ok(())
}

/// Parse an allocation record locally
pub fn parse(record: &str) -> Result<()> {
    let parsed: AllocationRecord = record.parse()?;
    for line in describe_record(&parsed) {
        println!("{}", line);
    }
    Ok(())
}

/// Show daemon status
pub async fn status(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    if response.status().is_success() {
        let status: StatusResponse = response.json().await?;

        println!("gpuclaim v{}", status.version);
        println!();
        println!("Lease namespace: {}", status.lease_namespace);
        println!("Nodes: {}", status.store.nodes);
        println!("Claims: {}", status.store.claims);
        println!("Leases: {}", status.store.leases);
        println!("Allocations: {}", status.store.allocations);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get status: {}", error);
    }

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(file: &Path) -> Result<T> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", file.display()))
}

/// Islands of a node with their device counts, e.g. "A(2) B(1)"
fn island_summary(report: &NodeDeviceReport) -> String {
    let mut islands: BTreeMap<&str, usize> = BTreeMap::new();
    for device in &report.devices {
        *islands.entry(device.island.as_str()).or_default() += 1;
    }
    islands
        .iter()
        .map(|(island, count)| format!("{}({})", island, count))
        .collect::<Vec<_>>()
        .join(" ")
}

fn describe_record(record: &AllocationRecord) -> Vec<String> {
    vec![
        format!("Node: {}", record.node),
        format!("GPUs: {:?}", record.device_ids),
        format!("{}={}", VISIBLE_DEVICES_ENV, record.device_list()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuclaim_core::Device;

    #[test]
    fn test_island_summary() {
        let report = NodeDeviceReport::new(
            "node-a",
            vec![
                Device::new(0, "A", 10),
                Device::new(1, "A", 10),
                Device::new(2, "B", 10),
            ],
        );
        assert_eq!(island_summary(&report), "A(2) B(1)");
    }

    #[test]
    fn test_describe_record() {
        let record: AllocationRecord = "nodeA:0,1,2".parse().unwrap();
        let lines = describe_record(&record);
        assert_eq!(lines[0], "Node: nodeA");
        assert_eq!(lines[2], "CUDA_VISIBLE_DEVICES=0,1,2");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("no-colon").is_err());
    }
}
