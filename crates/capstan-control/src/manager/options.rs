use std::sync::Arc;
use std::time::Duration;

use capstan_common::config::AppConfig;
use capstan_server::retry::RetryStrategy;
use uuid::Uuid;

use crate::backend::ClusterBackend;
use crate::error::{ClusterError, ClusterResult, FatalErrorHandler};
use crate::ha::{JobLeaderRetrieval, LeaderElection};
use crate::id::ResourceId;
use crate::manager::event::ClusterInformation;
use crate::slots::SlotManager;

/// The advisory timeout applied when a request does not carry one.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    pub enable_tls: bool,
    pub listen_host: String,
    pub listen_port: u16,
    pub external_host: String,
    /// The port advertised to other participants, or zero to advertise
    /// the port the server binds to.
    pub external_port: u16,
    /// The stable resource ID of this resource manager process.
    pub resource_id: ResourceId,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub job_leader_id_timeout: Duration,
    pub rpc_retry_strategy: RetryStrategy,
    pub cluster_information: ClusterInformation,
}

impl TryFrom<&AppConfig> for ResourceManagerConfig {
    type Error = ClusterError;

    fn try_from(config: &AppConfig) -> ClusterResult<Self> {
        let cluster = &config.cluster;
        if cluster.heartbeat_timeout_secs <= cluster.heartbeat_interval_secs {
            return Err(ClusterError::InvalidArgument(
                "the heartbeat timeout must be larger than the heartbeat interval".to_string(),
            ));
        }
        let resource_id = if cluster.master_resource_id.is_empty() {
            ResourceId::from(Uuid::new_v4().to_string())
        } else {
            ResourceId::from(cluster.master_resource_id.as_str())
        };
        Ok(Self {
            enable_tls: cluster.enable_tls,
            listen_host: cluster.master_listen_host.clone(),
            listen_port: cluster.master_listen_port,
            external_host: cluster.master_external_host.clone(),
            external_port: cluster.master_external_port,
            resource_id,
            heartbeat_interval: Duration::from_secs(cluster.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(cluster.heartbeat_timeout_secs),
            job_leader_id_timeout: Duration::from_secs(cluster.job_leader_id_timeout_secs),
            rpc_retry_strategy: RetryStrategy::from(&cluster.rpc_retry_strategy),
            cluster_information: ClusterInformation {
                blob_server_host: cluster.blob_server_host.clone(),
                blob_server_port: cluster.blob_server_port,
            },
        })
    }
}

/// The external collaborators of the resource manager.
pub struct ResourceManagerServices {
    pub leader_election: Arc<dyn LeaderElection>,
    pub job_leader_retrieval: Arc<dyn JobLeaderRetrieval>,
    pub slot_manager: Box<dyn SlotManager>,
    pub backend: Arc<dyn ClusterBackend>,
    pub fatal_error_handler: Arc<dyn FatalErrorHandler>,
}

pub struct ResourceManagerOptions {
    pub config: ResourceManagerConfig,
    pub services: ResourceManagerServices,
}
