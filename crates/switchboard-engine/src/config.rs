use serde::{Deserialize, Serialize};
use switchboard_routes::Profile;
use thiserror::Error;

pub const DEFAULT_CA_CERT_PATH: &str = "resources/rootCA.crt";
pub const DEFAULT_CA_KEY_PATH: &str = "resources/rootCA.key";

/// Engine-level settings. The listener port pair is process-wide; profiles
/// only alter routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct EngineConfig {
    pub listen_addr: String,
    pub http_port: u16,
    pub https_port: u16,
    pub ca_cert_pem_path: String,
    pub ca_key_pem_path: String,
    pub request_timeout_secs: u64,
    pub max_http_head_bytes: usize,
    pub leaf_cache_capacity: usize,
    pub leaf_cache_ttl_hours: u64,
    pub upstream_tls_insecure_skip_verify: bool,
    /// Upper bound on concurrently connecting/connected upstream-proxy
    /// sockets; zero means unbounded.
    pub max_upstream_proxy_sockets: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            http_port: 7990,
            https_port: 7991,
            ca_cert_pem_path: DEFAULT_CA_CERT_PATH.to_string(),
            ca_key_pem_path: DEFAULT_CA_KEY_PATH.to_string(),
            request_timeout_secs: 600,
            max_http_head_bytes: 64 * 1024,
            leaf_cache_capacity: switchboard_tls::DEFAULT_CACHE_CAPACITY,
            leaf_cache_ttl_hours: 240,
            upstream_tls_insecure_skip_verify: true,
            max_upstream_proxy_sockets: 0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::EmptyListenAddr);
        }
        if self.http_port != 0 && self.http_port == self.https_port {
            return Err(ConfigError::PortPairConflict {
                port: self.http_port,
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("requestTimeoutSecs"));
        }
        if self.max_http_head_bytes == 0 {
            return Err(ConfigError::ZeroValue("maxHttpHeadBytes"));
        }
        if self.leaf_cache_capacity == 0 {
            return Err(ConfigError::ZeroValue("leafCacheCapacity"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn leaf_cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.leaf_cache_ttl_hours * 60 * 60)
    }
}

/// The configuration document owned by the external collaborator: the
/// process-wide port pair plus the profile list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct AppConfig {
    pub config_version: Option<u32>,
    pub app_port: Vec<u16>,
    pub profile: Vec<Profile>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_port.len() != 2 {
            return Err(ConfigError::InvalidPortPair);
        }
        for profile in &self.profile {
            profile
                .validate()
                .map_err(|error| ConfigError::InvalidProfile {
                    name: profile.name.clone(),
                    detail: error.to_string(),
                })?;
        }
        Ok(())
    }

    pub fn http_port(&self) -> u16 {
        self.app_port.first().copied().unwrap_or(0)
    }

    pub fn https_port(&self) -> u16 {
        self.app_port.get(1).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("listenAddr must not be empty")]
    EmptyListenAddr,
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("http and https listeners cannot share port {port}")]
    PortPairConflict { port: u16 },
    #[error("appPort must be an array of exactly two ports")]
    InvalidPortPair,
    #[error("profile {name:?} is invalid: {detail}")]
    InvalidProfile { name: String, detail: String },
    #[error("profile index {index} is out of range (0..{count})")]
    InvalidProfileIndex { index: i32, count: usize },
}
