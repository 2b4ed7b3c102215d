//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::client::ClientLimits;
use crate::error::{NfsError, Result};

/// Delegation heuristic tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    pub active_capacity: usize,
    pub eviction_capacity: usize,
    pub max_idle_secs: u64,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            active_capacity: 1024,
            eviction_capacity: 4096,
            max_idle_secs: 120,
        }
    }
}

/// VFS cache sizing and expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsCacheConfig {
    /// Bound on each of the lookup, attribute and parent caches
    pub max_entries: u64,
    /// Lookup and attribute expiry after write
    pub lifetime_ms: u64,
    pub parent_lifetime_ms: u64,
    /// Filesystem statistics are not memoized when unset
    pub fs_stat_lifetime_ms: Option<u64>,
}

impl Default for VfsCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 8192,
            lifetime_ms: 10_000,
            parent_lifetime_ms: 100,
            fs_stat_lifetime_ms: Some(3_000),
        }
    }
}

/// Where byte-range locks are coordinated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LockBackend {
    /// Single server, in-process
    #[default]
    Local,
    /// Cluster-wide through etcd
    Etcd {
        endpoints: Vec<String>,
        #[serde(default = "default_etcd_prefix")]
        prefix: String,
    },
}

fn default_etcd_prefix() -> String {
    "/nfs4".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub backend: LockBackend,
    /// How long to wait for a file's critical section
    pub acquire_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Local,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Top-level configuration of the state server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub lease_time_secs: u64,
    pub max_session_slots: u32,
    pub max_request_ops: u32,
    pub max_file_name: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub implementation_id: String,
    pub implementation_domain: String,
    pub log_level: String,
    pub delegation: DelegationConfig,
    pub vfs_cache: VfsCacheConfig,
    pub locks: LockConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lease_time_secs: 90,
            max_session_slots: 16,
            max_request_ops: 128,
            max_file_name: 255,
            max_read_size: 4 * 1024 * 1024,
            max_write_size: 4 * 1024 * 1024,
            implementation_id: concat!("nfs4-state ", env!("CARGO_PKG_VERSION")).to_string(),
            implementation_domain: "localdomain".to_string(),
            log_level: "info".to_string(),
            delegation: DelegationConfig::default(),
            vfs_cache: VfsCacheConfig::default(),
            locks: LockConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a `.toml` or `.json` file; missing fields take defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ServerConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ServerConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    pub fn lease_time(&self) -> Duration {
        Duration::from_secs(self.lease_time_secs)
    }

    pub fn client_limits(&self) -> ClientLimits {
        ClientLimits {
            lease_time: self.lease_time(),
            max_session_slots: self.max_session_slots,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_time_secs == 0 {
            return Err(NfsError::inval("lease time must be positive"));
        }
        if self.max_session_slots == 0 {
            return Err(NfsError::inval("max_session_slots must be positive"));
        }
        if self.max_request_ops == 0 {
            return Err(NfsError::inval("max_request_ops must be positive"));
        }
        if self.max_file_name == 0 {
            return Err(NfsError::inval("max_file_name must be positive"));
        }
        if self.max_read_size == 0 || self.max_write_size == 0 {
            return Err(NfsError::inval("max_read_size and max_write_size must be positive"));
        }
        if self.implementation_domain.is_empty() {
            return Err(NfsError::inval("implementation_domain must not be empty"));
        }
        if self.delegation.active_capacity == 0 || self.delegation.eviction_capacity == 0 {
            return Err(NfsError::inval("delegation queue capacities must be positive"));
        }
        if self.vfs_cache.max_entries == 0 {
            return Err(NfsError::inval("vfs cache max_entries must be positive"));
        }
        if self.locks.acquire_timeout_ms == 0 {
            return Err(NfsError::inval("lock acquire timeout must be positive"));
        }
        if let LockBackend::Etcd { endpoints, .. } = &self.locks.backend {
            if endpoints.is_empty() {
                return Err(NfsError::inval("etcd lock backend needs at least one endpoint"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ServerConfig::default();
        assert_eq!(config.lease_time(), Duration::from_secs(90));
        assert_eq!(config.max_session_slots, 16);
        assert_eq!(config.max_read_size, 4 * 1024 * 1024);
        assert_eq!(config.delegation.active_capacity, 1024);
        assert_eq!(config.vfs_cache.parent_lifetime_ms, 100);
        assert_eq!(config.locks.backend, LockBackend::Local);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_limits() {
        let config = ServerConfig {
            lease_time_secs: 30,
            max_session_slots: 8,
            ..Default::default()
        };
        let limits = config.client_limits();
        assert_eq!(limits.lease_time, Duration::from_secs(30));
        assert_eq!(limits.max_session_slots, 8);
    }

    #[test]
    fn test_validate_rejects_zero_lease() {
        let config = ServerConfig {
            lease_time_secs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(NfsError::Inval { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = ServerConfig::default();
        config.delegation.eviction_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_transfer_limits() {
        let mut config = ServerConfig::default();
        config.max_read_size = 0;
        assert!(matches!(config.validate(), Err(NfsError::Inval { .. })));

        let mut config = ServerConfig::default();
        config.max_file_name = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.implementation_domain = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_etcd_endpoints() {
        let mut config = ServerConfig::default();
        config.locks.backend = LockBackend::Etcd {
            endpoints: vec![],
            prefix: "/x".to_string(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
lease_time_secs = 45
log_level = "debug"

[delegation]
active_capacity = 10

[vfs_cache]
lifetime_ms = 500

[locks]
acquire_timeout_ms = 250

[locks.backend]
type = "etcd"
endpoints = ["http://127.0.0.1:2379"]
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.lease_time_secs, 45);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.delegation.active_capacity, 10);
        assert_eq!(config.delegation.eviction_capacity, 4096);
        assert_eq!(config.vfs_cache.lifetime_ms, 500);
        assert_eq!(config.locks.acquire_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.locks.backend,
            LockBackend::Etcd {
                endpoints: vec!["http://127.0.0.1:2379".to_string()],
                prefix: "/nfs4".to_string(),
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "max_session_slots": 32,
                "vfs_cache": {{ "fs_stat_lifetime_ms": null }},
                "locks": {{ "backend": {{ "type": "local" }} }}
            }}"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_session_slots, 32);
        assert_eq!(config.vfs_cache.fs_stat_lifetime_ms, None);
        assert_eq!(config.locks.backend, LockBackend::Local);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ServerConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut config = ServerConfig::default();
        config.locks.backend = LockBackend::Etcd {
            endpoints: vec!["a:2379".to_string()],
            prefix: "/p".to_string(),
        };
        let json = serde_json::to_string(&config).unwrap();
        let decoded: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, decoded);
    }
}
