use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub cluster: ClusterConfig,
}

impl AppConfig {
    pub fn load() -> CommonResult<Self> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .merge(Env::prefixed("CAPSTAN_").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub enable_tls: bool,
    /// The stable resource ID of the master process,
    /// or empty to generate a random one at startup.
    pub master_resource_id: String,
    pub master_listen_host: String,
    pub master_listen_port: u16,
    pub master_external_host: String,
    /// The master port advertised to other nodes,
    /// or zero to use the port the server binds to.
    pub master_external_port: u16,
    pub blob_server_host: String,
    pub blob_server_port: u16,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub job_leader_id_timeout_secs: u64,
    pub rpc_retry_strategy: RetryStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed {
        max_count: usize,
        delay_secs: u64,
    },
    ExponentialBackoff {
        max_count: usize,
        initial_delay_secs: u64,
        max_delay_secs: u64,
        factor: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::load().unwrap();
        assert!(!config.cluster.enable_tls);
        assert!(config.cluster.master_resource_id.is_empty());
        assert!(config.cluster.heartbeat_timeout_secs > config.cluster.heartbeat_interval_secs);
    }
}
