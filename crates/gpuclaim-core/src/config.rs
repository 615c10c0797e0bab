//! Configuration types for gpuclaim

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuclaimConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Filter phase configuration
    pub filter: FilterConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl GpuclaimConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::SchedError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::SchedError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::SchedError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub rest_address: String,
    /// Port for the REST API server
    pub rest_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rest_address: "0.0.0.0".to_string(),
            rest_port: 9090,
        }
    }
}

/// Scheduling core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Namespace lease records are created in
    pub lease_namespace: String,
    /// Upper bound on every remote call, in milliseconds
    pub call_timeout_ms: u64,
    /// Largest device count a claim may request
    pub max_devices_per_node: u32,
    /// Interval the node agent republishes reports at, in seconds
    pub catalog_refresh_secs: u64,
}

impl SchedulerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_namespace: "gpuclaim-system".to_string(),
            call_timeout_ms: 5000,
            max_devices_per_node: 16,
            catalog_refresh_secs: 30,
        }
    }
}

/// Filter phase configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Reject nodes with fewer free devices than requested before scoring
    pub reject_under_capacity: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            reject_under_capacity: true,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory with `claims/*.json` and `nodes/*.json` seeded at startup
    pub snapshot_dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GpuclaimConfig::default();
        assert_eq!(config.api.rest_port, 9090);
        assert_eq!(config.scheduler.lease_namespace, "gpuclaim-system");
        assert_eq!(config.scheduler.call_timeout(), Duration::from_secs(5));
        assert!(config.filter.reject_under_capacity);
    }

    #[test]
    fn test_partial_config_parse() {
        let toml_str = r#"
[scheduler]
lease_namespace = "kube-system"
call_timeout_ms = 250

[filter]
reject_under_capacity = false

[storage]
snapshot_dir = "/etc/gpuclaim/snapshot"
"#;
        let config: GpuclaimConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.lease_namespace, "kube-system");
        assert_eq!(config.scheduler.max_devices_per_node, 16);
        assert!(!config.filter.reject_under_capacity);
        assert_eq!(config.api.rest_port, 9090);
        assert_eq!(
            config.storage.snapshot_dir,
            Some(PathBuf::from("/etc/gpuclaim/snapshot"))
        );
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("gpuclaim-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gpuclaim.toml");
        std::fs::write(&path, "[api]\nrest_port = 9191\n").unwrap();

        let config = GpuclaimConfig::from_file(&path).unwrap();
        assert_eq!(config.api.rest_port, 9191);

        std::fs::remove_dir_all(&dir).unwrap();
        assert!(matches!(
            GpuclaimConfig::from_file(&path),
            Err(crate::SchedError::Config(_))
        ));
    }
}
