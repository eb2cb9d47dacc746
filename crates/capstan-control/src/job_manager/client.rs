use tonic::transport::Channel;

use crate::error::ClusterResult;
use crate::id::{AllocationId, JobMasterId, ResourceId, ResourceManagerId};
use crate::proto::capstan::job_manager as gen;
use crate::proto::capstan::job_manager::job_manager_service_client::JobManagerServiceClient;
use crate::rpc::{ClientHandle, ClientOptions};

/// A gateway to a remote job manager, fenced by the job master ID under
/// which the job manager registered.
#[derive(Debug, Clone)]
pub struct JobManagerClient {
    job_master_id: JobMasterId,
    inner: ClientHandle<JobManagerServiceClient<Channel>>,
}

impl JobManagerClient {
    pub fn new(job_master_id: JobMasterId, options: ClientOptions) -> Self {
        Self {
            job_master_id,
            inner: ClientHandle::new(options),
        }
    }

    pub fn job_master_id(&self) -> JobMasterId {
        self.job_master_id
    }

    /// Establish the connection eagerly so that registration can fail fast
    /// when the job manager address is unreachable.
    pub async fn connect(&self) -> ClusterResult<()> {
        self.inner.lock().await?;
        Ok(())
    }

    pub async fn heartbeat_from_resource_manager(
        &self,
        resource_id: &ResourceId,
    ) -> ClusterResult<()> {
        let request = tonic::Request::new(gen::JobManagerHeartbeatRequest {
            job_master_id: self.job_master_id.to_string(),
            resource_manager_resource_id: resource_id.to_string(),
        });
        let response = self
            .inner
            .lock()
            .await?
            .heartbeat_from_resource_manager(request)
            .await?;
        let gen::JobManagerHeartbeatResponse {} = response.into_inner();
        Ok(())
    }

    pub async fn disconnect_resource_manager(
        &self,
        resource_manager_id: ResourceManagerId,
        cause: String,
    ) -> ClusterResult<()> {
        let request = tonic::Request::new(gen::DisconnectResourceManagerRequest {
            job_master_id: self.job_master_id.to_string(),
            resource_manager_id: resource_manager_id.to_string(),
            cause,
        });
        let response = self
            .inner
            .lock()
            .await?
            .disconnect_resource_manager(request)
            .await?;
        let gen::DisconnectResourceManagerResponse {} = response.into_inner();
        Ok(())
    }

    pub async fn notify_allocation_failure(
        &self,
        allocation_id: &AllocationId,
        cause: String,
    ) -> ClusterResult<()> {
        let request = tonic::Request::new(gen::NotifyAllocationFailureRequest {
            job_master_id: self.job_master_id.to_string(),
            allocation_id: allocation_id.to_string(),
            cause,
        });
        let response = self
            .inner
            .lock()
            .await?
            .notify_allocation_failure(request)
            .await?;
        let gen::NotifyAllocationFailureResponse {} = response.into_inner();
        Ok(())
    }
}
