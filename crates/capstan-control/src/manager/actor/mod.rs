mod core;
mod handler;
mod rpc;

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::backend::ClusterBackend;
use crate::error::FatalErrorHandler;
use crate::ha::LeaderElection;
use crate::id::ResourceManagerId;
use crate::job_leader::JobLeaderIdService;
use crate::manager::heartbeat::HeartbeatTracker;
use crate::manager::options::ResourceManagerConfig;
use crate::manager::state::ResourceManagerState;
use crate::rpc::ServerMonitor;
use crate::slots::SlotManager;

/// The resource manager endpoint. All registration tables, heartbeat
/// bookkeeping, leader state and slot manager interaction are owned by this
/// actor and mutated only on its event loop.
pub struct ResourceManagerActor {
    config: ResourceManagerConfig,
    leader_election: Arc<dyn LeaderElection>,
    backend: Arc<dyn ClusterBackend>,
    fatal_error_handler: Arc<dyn FatalErrorHandler>,
    slot_manager: Box<dyn SlotManager>,
    job_leader_id_service: JobLeaderIdService,
    server: ServerMonitor,
    server_port: Option<u16>,
    state: ResourceManagerState,
    /// The fencing token of the current leader session, or `None` while
    /// this resource manager is a follower.
    fencing_token: Option<ResourceManagerId>,
    task_manager_heartbeats: Option<HeartbeatTracker>,
    job_manager_heartbeats: Option<HeartbeatTracker>,
    /// Completion of the asynchronous state clearing started by the last
    /// leadership loss. The next leadership grant waits for it.
    clear_state_signal: Option<oneshot::Receiver<()>>,
}

impl ResourceManagerActor {
    /// The address advertised to other participants, available once the
    /// server has bound its listen port.
    fn external_address(&self) -> Option<String> {
        let port = if self.config.external_port > 0 {
            self.config.external_port
        } else {
            self.server_port?
        };
        Some(format!("{}:{}", self.config.external_host, port))
    }
}
