use std::time::Duration;

use log::debug;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backend::ApplicationStatus;
use crate::error::{ClusterError, ClusterResult};
use crate::id::{
    AllocationId, InstanceId, JobId, JobMasterId, ResourceId, ResourceManagerId, SlotId,
};
use crate::job_manager::JobManagerClient;
use crate::manager::state::{HardwareDescription, TaskManagerInfo, ResourceOverview};
use crate::slots::{ResourceProfile, SlotReport, SlotRequest};
use crate::task_executor::{FileType, TaskExecutorClient};

/// The outcome of a job manager registration, distinguishing a semantic
/// decline from a transport failure.
#[derive(Debug)]
pub enum JobManagerRegistrationReply {
    Success {
        resource_manager_id: ResourceManagerId,
        resource_manager_resource_id: ResourceId,
    },
    Decline(String),
}

#[derive(Debug)]
pub enum TaskExecutorRegistrationReply {
    Success {
        instance_id: InstanceId,
        resource_manager_resource_id: ResourceId,
        cluster_information: ClusterInformation,
    },
    Decline(String),
}

/// Static cluster metadata returned to task executors at registration.
#[derive(Debug, Clone)]
pub struct ClusterInformation {
    pub blob_server_host: String,
    pub blob_server_port: u16,
}

/// One command processed by the resource manager event loop. RPC handlers
/// and internal services communicate with the loop exclusively through
/// these events, so every state transition is atomic within one turn.
pub enum ResourceManagerEvent {
    /// The RPC server has bound its listen port.
    ServerReady {
        port: u16,
        signal: oneshot::Sender<()>,
    },

    // --- the RPC surface ---
    RegisterJobManager {
        token: ResourceManagerId,
        job_master_id: JobMasterId,
        job_manager_resource_id: ResourceId,
        job_manager_address: String,
        job_id: JobId,
        timeout: Duration,
        reply: oneshot::Sender<ClusterResult<JobManagerRegistrationReply>>,
    },
    RegisterTaskExecutor {
        token: ResourceManagerId,
        task_executor_address: String,
        resource_id: ResourceId,
        data_port: u16,
        hardware: HardwareDescription,
        timeout: Duration,
        reply: oneshot::Sender<ClusterResult<TaskExecutorRegistrationReply>>,
    },
    SendSlotReport {
        token: ResourceManagerId,
        resource_id: ResourceId,
        instance_id: InstanceId,
        slot_report: SlotReport,
        reply: oneshot::Sender<ClusterResult<()>>,
    },
    HeartbeatFromTaskManager {
        token: ResourceManagerId,
        resource_id: ResourceId,
        slot_report: SlotReport,
    },
    HeartbeatFromJobManager {
        token: ResourceManagerId,
        resource_id: ResourceId,
    },
    DisconnectTaskManager {
        token: ResourceManagerId,
        resource_id: ResourceId,
        cause: String,
    },
    DisconnectJobManager {
        token: ResourceManagerId,
        job_id: JobId,
        cause: String,
    },
    RequestSlot {
        token: ResourceManagerId,
        job_master_id: JobMasterId,
        slot_request: SlotRequest,
        reply: oneshot::Sender<ClusterResult<()>>,
    },
    CancelSlotRequest {
        token: ResourceManagerId,
        allocation_id: AllocationId,
    },
    NotifySlotAvailable {
        token: ResourceManagerId,
        instance_id: InstanceId,
        slot_id: SlotId,
        allocation_id: AllocationId,
    },
    DeregisterApplication {
        token: ResourceManagerId,
        status: ApplicationStatus,
        diagnostics: Option<String>,
        reply: oneshot::Sender<ClusterResult<()>>,
    },
    GetRegisteredTaskManagerCount {
        token: ResourceManagerId,
        reply: oneshot::Sender<ClusterResult<usize>>,
    },
    ListTaskManagers {
        token: ResourceManagerId,
        reply: oneshot::Sender<ClusterResult<Vec<TaskManagerInfo>>>,
    },
    GetTaskManager {
        token: ResourceManagerId,
        resource_id: ResourceId,
        reply: oneshot::Sender<ClusterResult<TaskManagerInfo>>,
    },
    GetResourceOverview {
        token: ResourceManagerId,
        reply: oneshot::Sender<ClusterResult<ResourceOverview>>,
    },
    ListTaskManagerMetricAddresses {
        token: ResourceManagerId,
        timeout: Duration,
        reply: oneshot::Sender<ClusterResult<Vec<(ResourceId, String)>>>,
    },
    RequestTaskManagerFileUpload {
        token: ResourceManagerId,
        resource_id: ResourceId,
        file_type: FileType,
        timeout: Duration,
        reply: oneshot::Sender<ClusterResult<String>>,
    },

    // --- registration continuations ---
    CompleteJobManagerRegistration {
        token: ResourceManagerId,
        job_id: JobId,
        job_master_id: JobMasterId,
        job_manager_resource_id: ResourceId,
        job_manager_address: String,
        /// The connected gateway and the authoritative leading job master
        /// ID, or the failure message to decline with.
        outcome: Result<(JobManagerClient, JobMasterId), String>,
        reply: oneshot::Sender<ClusterResult<JobManagerRegistrationReply>>,
    },
    CompleteTaskExecutorRegistration {
        token: ResourceManagerId,
        resource_id: ResourceId,
        task_executor_address: String,
        data_port: u16,
        hardware: HardwareDescription,
        attempt: u64,
        connection: Result<TaskExecutorClient, String>,
        reply: oneshot::Sender<ClusterResult<TaskExecutorRegistrationReply>>,
    },

    // --- heartbeat plumbing ---
    TriggerTaskManagerHeartbeats {
        token: ResourceManagerId,
    },
    TriggerJobManagerHeartbeats {
        token: ResourceManagerId,
    },
    ProbeTaskManagerHeartbeat {
        token: ResourceManagerId,
        resource_id: ResourceId,
        instant: Instant,
    },
    ProbeJobManagerHeartbeat {
        token: ResourceManagerId,
        resource_id: ResourceId,
        instant: Instant,
    },

    // --- resource actions from the slot manager ---
    ReleaseResource {
        token: ResourceManagerId,
        instance_id: InstanceId,
        cause: String,
    },
    AllocateResource {
        token: ResourceManagerId,
        profile: ResourceProfile,
    },
    NotifyAllocationFailure {
        token: ResourceManagerId,
        job_id: JobId,
        allocation_id: AllocationId,
        cause: String,
    },

    // --- job leader ID service callbacks ---
    JobLeaderLostLeadership {
        job_id: JobId,
        old_job_master_id: JobMasterId,
    },
    JobTimeout {
        job_id: JobId,
        timeout_id: Uuid,
    },

    // --- leadership transitions (unfenced by definition) ---
    GrantLeadership {
        session: Uuid,
    },
    AcceptLeadership {
        session: Uuid,
    },
    RevokeLeadership,
    LeaderElectionError {
        message: String,
    },

    Shutdown,
}

/// How an event is admitted by the fencing check.
pub enum Fencing {
    /// Admitted only when the token matches the current fencing token.
    Fenced(ResourceManagerId),
    /// Admitted regardless of the current fencing token.
    Unfenced,
}

impl ResourceManagerEvent {
    pub fn fencing(&self) -> Fencing {
        use ResourceManagerEvent::*;
        match self {
            RegisterJobManager { token, .. }
            | RegisterTaskExecutor { token, .. }
            | SendSlotReport { token, .. }
            | HeartbeatFromTaskManager { token, .. }
            | HeartbeatFromJobManager { token, .. }
            | DisconnectTaskManager { token, .. }
            | DisconnectJobManager { token, .. }
            | RequestSlot { token, .. }
            | CancelSlotRequest { token, .. }
            | NotifySlotAvailable { token, .. }
            | DeregisterApplication { token, .. }
            | GetRegisteredTaskManagerCount { token, .. }
            | ListTaskManagers { token, .. }
            | GetTaskManager { token, .. }
            | GetResourceOverview { token, .. }
            | ListTaskManagerMetricAddresses { token, .. }
            | RequestTaskManagerFileUpload { token, .. }
            | CompleteJobManagerRegistration { token, .. }
            | CompleteTaskExecutorRegistration { token, .. }
            | TriggerTaskManagerHeartbeats { token }
            | TriggerJobManagerHeartbeats { token }
            | ProbeTaskManagerHeartbeat { token, .. }
            | ProbeJobManagerHeartbeat { token, .. }
            | ReleaseResource { token, .. }
            | AllocateResource { token, .. }
            | NotifyAllocationFailure { token, .. } => Fencing::Fenced(*token),
            ServerReady { .. }
            | JobLeaderLostLeadership { .. }
            | JobTimeout { .. }
            | GrantLeadership { .. }
            | AcceptLeadership { .. }
            | RevokeLeadership
            | LeaderElectionError { .. }
            | Shutdown => Fencing::Unfenced,
        }
    }

    /// Resolve an event that failed the fencing check: events carrying a
    /// reply channel answer with the error, everything else is dropped.
    pub fn reject(self, error: ClusterError) {
        use ResourceManagerEvent::*;
        match self {
            RegisterJobManager { reply, .. } | CompleteJobManagerRegistration { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            RegisterTaskExecutor { reply, .. }
            | CompleteTaskExecutorRegistration { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            SendSlotReport { reply, .. }
            | RequestSlot { reply, .. }
            | DeregisterApplication { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            GetRegisteredTaskManagerCount { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            ListTaskManagers { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            GetTaskManager { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            GetResourceOverview { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            ListTaskManagerMetricAddresses { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            RequestTaskManagerFileUpload { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            _ => {
                debug!("dropping event rejected by the fencing check: {error}");
            }
        }
    }
}
