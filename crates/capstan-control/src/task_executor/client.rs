use tonic::transport::Channel;

use crate::error::ClusterResult;
use crate::id::ResourceId;
use crate::proto::capstan::task_executor as gen;
use crate::proto::capstan::task_executor::task_executor_service_client::TaskExecutorServiceClient;
use crate::rpc::{ClientHandle, ClientOptions};
use crate::task_executor::FileType;

/// A gateway to a remote task executor.
#[derive(Debug, Clone)]
pub struct TaskExecutorClient {
    inner: ClientHandle<TaskExecutorServiceClient<Channel>>,
}

impl TaskExecutorClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            inner: ClientHandle::new(options),
        }
    }

    /// Establish the connection eagerly so that registration can fail fast
    /// when the task executor address is unreachable.
    pub async fn connect(&self) -> ClusterResult<()> {
        self.inner.lock().await?;
        Ok(())
    }

    pub async fn heartbeat_from_resource_manager(
        &self,
        resource_id: &ResourceId,
    ) -> ClusterResult<()> {
        let request = tonic::Request::new(gen::TaskExecutorHeartbeatRequest {
            resource_manager_resource_id: resource_id.to_string(),
        });
        let response = self
            .inner
            .lock()
            .await?
            .heartbeat_from_resource_manager(request)
            .await?;
        let gen::TaskExecutorHeartbeatResponse {} = response.into_inner();
        Ok(())
    }

    pub async fn disconnect_resource_manager(&self, cause: String) -> ClusterResult<()> {
        let request = tonic::Request::new(gen::DisconnectResourceManagerRequest { cause });
        let response = self
            .inner
            .lock()
            .await?
            .disconnect_resource_manager(request)
            .await?;
        let gen::DisconnectResourceManagerResponse {} = response.into_inner();
        Ok(())
    }

    pub async fn get_metric_query_service_address(&self) -> ClusterResult<Option<String>> {
        let request = tonic::Request::new(gen::GetMetricQueryServiceAddressRequest {});
        let response = self
            .inner
            .lock()
            .await?
            .get_metric_query_service_address(request)
            .await?;
        let gen::GetMetricQueryServiceAddressResponse { address } = response.into_inner();
        Ok(address)
    }

    pub async fn request_file_upload(&self, file_type: FileType) -> ClusterResult<String> {
        let request = tonic::Request::new(gen::RequestFileUploadRequest {
            file_type: crate::proto::capstan::common::FileType::from(file_type) as i32,
        });
        let response = self
            .inner
            .lock()
            .await?
            .request_file_upload(request)
            .await?;
        let gen::RequestFileUploadResponse { blob_key } = response.into_inner();
        Ok(blob_key)
    }
}
