//! In-memory consistent store

use async_trait::async_trait;
use gpuclaim_core::{
    lease_name, AllocationClaim, AllocationRecord, AllocationSink, CatalogSource, ClaimSource,
    DeviceLease, LeaseStore, NodeDeviceReport, PodRef, SchedError, SchedResult,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

type ClaimsMap = HashMap<(String, String), AllocationClaim>;
type NodesMap = BTreeMap<String, NodeDeviceReport>;
type LeasesMap = HashMap<(String, String), DeviceLease>;
type AllocationsMap = BTreeMap<(String, String), AllocationRecord>;

/// Store holding claims, node reports, leases and allocation records.
///
/// Lease creation checks and inserts under one write lock, which gives the
/// same create-if-absent guarantee a coordination service offers.
#[derive(Default)]
pub struct MemoryStore {
    /// Claims indexed by (namespace, name)
    claims: RwLock<ClaimsMap>,
    /// Node reports indexed by node name
    nodes: RwLock<NodesMap>,
    /// Leases indexed by (namespace, lease name)
    leases: RwLock<LeasesMap>,
    /// Allocation records indexed by (namespace, pod name)
    allocations: RwLock<AllocationsMap>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a claim
    pub async fn put_claim(&self, claim: AllocationClaim) {
        debug!(namespace = %claim.namespace, claim = %claim.name, "Stored claim");
        self.claims
            .write()
            .await
            .insert((claim.namespace.clone(), claim.name.clone()), claim);
    }

    /// Remove a claim, returning it if present
    pub async fn remove_claim(&self, namespace: &str, name: &str) -> Option<AllocationClaim> {
        self.claims
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// List all claims
    pub async fn list_claims(&self) -> Vec<AllocationClaim> {
        let claims = self.claims.read().await;
        let mut list: Vec<AllocationClaim> = claims.values().cloned().collect();
        list.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        list
    }

    /// Insert or replace a node report, keeping devices ordered by id
    pub async fn put_node_report(&self, mut report: NodeDeviceReport) {
        report.devices.sort_by_key(|d| d.id);
        if report.total == 0 {
            report.total = report.devices.len() as u32;
        }
        info!(node = %report.node_name, devices = report.devices.len(), "Published node report");
        self.nodes
            .write()
            .await
            .insert(report.node_name.clone(), report);
    }

    /// Remove a node report
    pub async fn remove_node_report(&self, node: &str) -> Option<NodeDeviceReport> {
        self.nodes.write().await.remove(node)
    }

    /// Names of all nodes with a report, ascending
    pub async fn node_names(&self) -> Vec<String> {
        self.nodes.read().await.keys().cloned().collect()
    }

    /// All node reports, ordered by node name
    pub async fn list_node_reports(&self) -> Vec<NodeDeviceReport> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Committed allocation record of a pod
    pub async fn allocation(&self, namespace: &str, pod: &str) -> Option<AllocationRecord> {
        self.allocations
            .read()
            .await
            .get(&(namespace.to_string(), pod.to_string()))
            .cloned()
    }

    /// All committed allocation records
    pub async fn list_allocations(&self) -> Vec<AllocationEntry> {
        self.allocations
            .read()
            .await
            .iter()
            .map(|((namespace, pod), record)| AllocationEntry {
                namespace: namespace.clone(),
                pod: pod.clone(),
                allocation: record.to_string(),
            })
            .collect()
    }

    /// Store statistics
    pub async fn stats(&self) -> StoreStats {
        StoreStats {
            claims: self.claims.read().await.len(),
            nodes: self.nodes.read().await.len(),
            leases: self.leases.read().await.len(),
            allocations: self.allocations.read().await.len(),
        }
    }
}

/// Allocation record with its pod
#[derive(Debug, Clone, Serialize)]
pub struct AllocationEntry {
    pub namespace: String,
    pub pod: String,
    pub allocation: String,
}

/// Store statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub claims: usize,
    pub nodes: usize,
    pub leases: usize,
    pub allocations: usize,
}

#[async_trait]
impl ClaimSource for MemoryStore {
    async fn get_claim(&self, namespace: &str, name: &str) -> SchedResult<AllocationClaim> {
        self.claims
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| SchedError::NotFound(format!("claim {}/{}", namespace, name)))
    }
}

#[async_trait]
impl CatalogSource for MemoryStore {
    async fn get_node_report(&self, node: &str) -> SchedResult<NodeDeviceReport> {
        self.nodes
            .read()
            .await
            .get(node)
            .cloned()
            .ok_or_else(|| SchedError::NotFound(format!("node report {}", node)))
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn create_if_absent(&self, lease: DeviceLease) -> SchedResult<bool> {
        let key = (lease.namespace.clone(), lease.name());
        let mut leases = self.leases.write().await;
        if leases.contains_key(&key) {
            return Ok(false);
        }
        leases.insert(key, lease);
        Ok(true)
    }

    async fn delete(&self, namespace: &str, node: &str, device_id: u32) -> SchedResult<()> {
        self.leases
            .write()
            .await
            .remove(&(namespace.to_string(), lease_name(node, device_id)));
        Ok(())
    }

    async fn get(&self, namespace: &str, node: &str, device_id: u32) -> SchedResult<Option<DeviceLease>> {
        Ok(self
            .leases
            .read()
            .await
            .get(&(namespace.to_string(), lease_name(node, device_id)))
            .cloned())
    }

    async fn list(&self, namespace: &str) -> SchedResult<Vec<DeviceLease>> {
        Ok(self
            .leases
            .read()
            .await
            .values()
            .filter(|l| l.namespace == namespace)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AllocationSink for MemoryStore {
    async fn commit(&self, pod: &PodRef, record: &AllocationRecord) -> SchedResult<()> {
        self.allocations
            .write()
            .await
            .insert((pod.namespace.clone(), pod.name.clone()), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuclaim_core::Device;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_claims() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_claim("ml", "train").await,
            Err(SchedError::NotFound(_))
        ));

        store.put_claim(AllocationClaim::new("ml", "train", 2)).await;
        assert_eq!(store.get_claim("ml", "train").await.unwrap().devices.count, 2);
        assert!(store.get_claim("other", "train").await.is_err());

        assert!(store.remove_claim("ml", "train").await.is_some());
        assert!(store.list_claims().await.is_empty());
    }

    #[tokio::test]
    async fn test_node_report_sorted() {
        let store = MemoryStore::new();
        let mut report = NodeDeviceReport::default();
        report.node_name = "node-a".to_string();
        report.devices = vec![Device::new(1, "A", 10), Device::new(0, "A", 10)];
        store.put_node_report(report).await;

        let stored = store.get_node_report("node-a").await.unwrap();
        assert_eq!(stored.devices[0].id, 0);
        assert_eq!(stored.total, 2);
        assert_eq!(store.node_names().await, vec!["node-a".to_string()]);
        assert!(matches!(
            store.get_node_report("node-b").await,
            Err(SchedError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_if_absent() {
        let store = MemoryStore::new();
        let first = DeviceLease::new("ns", "node-a", 0, "uid-1");
        let second = DeviceLease::new("ns", "node-a", 0, "uid-2");

        assert!(store.create_if_absent(first).await.unwrap());
        assert!(!store.create_if_absent(second).await.unwrap());
        assert_eq!(
            store.get("ns", "node-a", 0).await.unwrap().unwrap().holder,
            "uid-1"
        );

        // Same key in another namespace is a different lease.
        assert!(store
            .create_if_absent(DeviceLease::new("other", "node-a", 0, "uid-3"))
            .await
            .unwrap());
        assert_eq!(store.list("ns").await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .create_if_absent(DeviceLease::new("ns", "node-a", 3, format!("uid-{}", i)))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_delete_absent_succeeds() {
        let store = MemoryStore::new();
        store.delete("ns", "node-a", 0).await.unwrap();
        store
            .create_if_absent(DeviceLease::new("ns", "node-a", 0, "uid-1"))
            .await
            .unwrap();
        store.delete("ns", "node-a", 0).await.unwrap();
        assert!(store.get("ns", "node-a", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_allocation() {
        let store = MemoryStore::new();
        let pod = PodRef::new("ml", "trainer-0", "uid-1");
        let record = AllocationRecord::new("node-a", vec![2, 3]);

        store.commit(&pod, &record).await.unwrap();
        assert_eq!(store.allocation("ml", "trainer-0").await, Some(record));

        let entries = store.list_allocations().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].allocation, "node-a:2,3");
        assert_eq!(store.stats().await.allocations, 1);
    }
}
