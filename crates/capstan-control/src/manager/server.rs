use std::time::Duration;

use capstan_server::actor::ActorHandle;
use log::debug;
use tokio::sync::oneshot;
use tonic::{Request, Response, Status};

use crate::error::ClusterError;
use crate::id::{InstanceId, JobMasterId, ResourceManagerId, SlotId};
use crate::manager::event::{
    JobManagerRegistrationReply, ResourceManagerEvent, TaskExecutorRegistrationReply,
};
use crate::manager::gen;
use crate::manager::gen::resource_manager_service_server::ResourceManagerService;
use crate::manager::options::DEFAULT_RPC_TIMEOUT;
use crate::manager::ResourceManagerActor;
use crate::slots::{ResourceProfile, SlotReport, SlotRequest};
use crate::task_executor::FileType;

pub struct ResourceManagerServer {
    handle: ActorHandle<ResourceManagerActor>,
}

impl ResourceManagerServer {
    pub fn new(handle: ActorHandle<ResourceManagerActor>) -> Self {
        Self { handle }
    }
}

fn rpc_timeout(timeout_ms: u64) -> Duration {
    if timeout_ms == 0 {
        DEFAULT_RPC_TIMEOUT
    } else {
        Duration::from_millis(timeout_ms)
    }
}

#[tonic::async_trait]
impl ResourceManagerService for ResourceManagerServer {
    async fn register_job_manager(
        &self,
        request: Request<gen::RegisterJobManagerRequest>,
    ) -> Result<Response<gen::RegisterJobManagerResponse>, Status> {
        let request = request.into_inner();
        debug!("{request:?}");
        let gen::RegisterJobManagerRequest {
            resource_manager_id,
            job_master_id,
            job_manager_resource_id,
            job_manager_address,
            job_id,
            timeout_ms,
        } = request;
        let token = resource_manager_id.parse::<ResourceManagerId>()?;
        let job_master_id = job_master_id.parse::<JobMasterId>()?;
        let (tx, rx) = oneshot::channel();
        let event = ResourceManagerEvent::RegisterJobManager {
            token,
            job_master_id,
            job_manager_resource_id: job_manager_resource_id.into(),
            job_manager_address,
            job_id: job_id.into(),
            timeout: rpc_timeout(timeout_ms),
            reply: tx,
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        let reply = rx.await.map_err(ClusterError::from)??;
        let result = match reply {
            JobManagerRegistrationReply::Success {
                resource_manager_id,
                resource_manager_resource_id,
            } => gen::register_job_manager_response::Result::Success(
                gen::JobManagerRegistrationSuccess {
                    resource_manager_id: resource_manager_id.to_string(),
                    resource_manager_resource_id: resource_manager_resource_id.to_string(),
                },
            ),
            JobManagerRegistrationReply::Decline(reason) => {
                gen::register_job_manager_response::Result::Decline(gen::RegistrationDecline {
                    reason,
                })
            }
        };
        let response = gen::RegisterJobManagerResponse {
            result: Some(result),
        };
        debug!("{response:?}");
        Ok(Response::new(response))
    }

    async fn register_task_executor(
        &self,
        request: Request<gen::RegisterTaskExecutorRequest>,
    ) -> Result<Response<gen::RegisterTaskExecutorResponse>, Status> {
        let request = request.into_inner();
        debug!("{request:?}");
        let gen::RegisterTaskExecutorRequest {
            resource_manager_id,
            task_executor_address,
            resource_id,
            data_port,
            hardware,
            timeout_ms,
        } = request;
        let token = resource_manager_id.parse::<ResourceManagerId>()?;
        let data_port = u16::try_from(data_port).map_err(|_| {
            Status::invalid_argument("the data port must be a valid 16-bit unsigned integer")
        })?;
        let (tx, rx) = oneshot::channel();
        let event = ResourceManagerEvent::RegisterTaskExecutor {
            token,
            task_executor_address,
            resource_id: resource_id.into(),
            data_port,
            hardware: hardware.map(Into::into).unwrap_or_default(),
            timeout: rpc_timeout(timeout_ms),
            reply: tx,
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        let reply = rx.await.map_err(ClusterError::from)??;
        let result = match reply {
            TaskExecutorRegistrationReply::Success {
                instance_id,
                resource_manager_resource_id,
                cluster_information,
            } => gen::register_task_executor_response::Result::Success(
                gen::TaskExecutorRegistrationSuccess {
                    instance_id: instance_id.into(),
                    resource_manager_resource_id: resource_manager_resource_id.to_string(),
                    cluster_information: Some(crate::proto::capstan::common::ClusterInformation {
                        blob_server_host: cluster_information.blob_server_host,
                        blob_server_port: cluster_information.blob_server_port as u32,
                    }),
                },
            ),
            TaskExecutorRegistrationReply::Decline(reason) => {
                gen::register_task_executor_response::Result::Decline(gen::RegistrationDecline {
                    reason,
                })
            }
        };
        let response = gen::RegisterTaskExecutorResponse {
            result: Some(result),
        };
        debug!("{response:?}");
        Ok(Response::new(response))
    }

    async fn send_slot_report(
        &self,
        request: Request<gen::SendSlotReportRequest>,
    ) -> Result<Response<gen::SendSlotReportResponse>, Status> {
        let request = request.into_inner();
        debug!("{request:?}");
        let gen::SendSlotReportRequest {
            resource_manager_id,
            resource_id,
            instance_id,
            slot_report,
            timeout_ms: _,
        } = request;
        let token = resource_manager_id.parse::<ResourceManagerId>()?;
        let slot_report = slot_report
            .map(SlotReport::try_from)
            .transpose()?
            .unwrap_or_default();
        let (tx, rx) = oneshot::channel();
        let event = ResourceManagerEvent::SendSlotReport {
            token,
            resource_id: resource_id.into(),
            instance_id: InstanceId::from(instance_id),
            slot_report,
            reply: tx,
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        rx.await.map_err(ClusterError::from)??;
        Ok(Response::new(gen::SendSlotReportResponse {}))
    }

    async fn heartbeat_from_task_manager(
        &self,
        request: Request<gen::HeartbeatFromTaskManagerRequest>,
    ) -> Result<Response<gen::HeartbeatFromTaskManagerResponse>, Status> {
        let request = request.into_inner();
        let gen::HeartbeatFromTaskManagerRequest {
            resource_manager_id,
            resource_id,
            slot_report,
        } = request;
        let token = resource_manager_id.parse::<ResourceManagerId>()?;
        let slot_report = slot_report
            .map(SlotReport::try_from)
            .transpose()?
            .unwrap_or_default();
        let event = ResourceManagerEvent::HeartbeatFromTaskManager {
            token,
            resource_id: resource_id.into(),
            slot_report,
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        Ok(Response::new(gen::HeartbeatFromTaskManagerResponse {}))
    }

    async fn heartbeat_from_job_manager(
        &self,
        request: Request<gen::HeartbeatFromJobManagerRequest>,
    ) -> Result<Response<gen::HeartbeatFromJobManagerResponse>, Status> {
        let request = request.into_inner();
        let gen::HeartbeatFromJobManagerRequest {
            resource_manager_id,
            resource_id,
        } = request;
        let token = resource_manager_id.parse::<ResourceManagerId>()?;
        let event = ResourceManagerEvent::HeartbeatFromJobManager {
            token,
            resource_id: resource_id.into(),
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        Ok(Response::new(gen::HeartbeatFromJobManagerResponse {}))
    }

    async fn disconnect_task_manager(
        &self,
        request: Request<gen::DisconnectTaskManagerRequest>,
    ) -> Result<Response<gen::DisconnectTaskManagerResponse>, Status> {
        let request = request.into_inner();
        debug!("{request:?}");
        let gen::DisconnectTaskManagerRequest {
            resource_manager_id,
            resource_id,
            cause,
        } = request;
        let token = resource_manager_id.parse::<ResourceManagerId>()?;
        let event = ResourceManagerEvent::DisconnectTaskManager {
            token,
            resource_id: resource_id.into(),
            cause,
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        Ok(Response::new(gen::DisconnectTaskManagerResponse {}))
    }

    async fn disconnect_job_manager(
        &self,
        request: Request<gen::DisconnectJobManagerRequest>,
    ) -> Result<Response<gen::DisconnectJobManagerResponse>, Status> {
        let request = request.into_inner();
        debug!("{request:?}");
        let gen::DisconnectJobManagerRequest {
            resource_manager_id,
            job_id,
            cause,
        } = request;
        let token = resource_manager_id.parse::<ResourceManagerId>()?;
        let event = ResourceManagerEvent::DisconnectJobManager {
            token,
            job_id: job_id.into(),
            cause,
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        Ok(Response::new(gen::DisconnectJobManagerResponse {}))
    }

    async fn request_slot(
        &self,
        request: Request<gen::RequestSlotRequest>,
    ) -> Result<Response<gen::RequestSlotResponse>, Status> {
        let request = request.into_inner();
        debug!("{request:?}");
        let gen::RequestSlotRequest {
            resource_manager_id,
            job_master_id,
            slot_request,
            timeout_ms: _,
        } = request;
        let token = resource_manager_id.parse::<ResourceManagerId>()?;
        let job_master_id = job_master_id.parse::<JobMasterId>()?;
        let slot_request = slot_request
            .ok_or_else(|| Status::invalid_argument("missing slot request"))?;
        let slot_request = SlotRequest {
            job_id: slot_request.job_id.into(),
            allocation_id: slot_request.allocation_id.into(),
            profile: slot_request
                .profile
                .map(ResourceProfile::from)
                .unwrap_or(ResourceProfile::ANY),
            target_address: slot_request.target_address,
        };
        let (tx, rx) = oneshot::channel();
        let event = ResourceManagerEvent::RequestSlot {
            token,
            job_master_id,
            slot_request,
            reply: tx,
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        rx.await.map_err(ClusterError::from)??;
        Ok(Response::new(gen::RequestSlotResponse {}))
    }

    async fn cancel_slot_request(
        &self,
        request: Request<gen::CancelSlotRequestRequest>,
    ) -> Result<Response<gen::CancelSlotRequestResponse>, Status> {
        let request = request.into_inner();
        debug!("{request:?}");
        let gen::CancelSlotRequestRequest {
            resource_manager_id,
            allocation_id,
        } = request;
        let token = resource_manager_id.parse::<ResourceManagerId>()?;
        let event = ResourceManagerEvent::CancelSlotRequest {
            token,
            allocation_id: allocation_id.into(),
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        Ok(Response::new(gen::CancelSlotRequestResponse {}))
    }

    async fn notify_slot_available(
        &self,
        request: Request<gen::NotifySlotAvailableRequest>,
    ) -> Result<Response<gen::NotifySlotAvailableResponse>, Status> {
        let request = request.into_inner();
        debug!("{request:?}");
        let gen::NotifySlotAvailableRequest {
            resource_manager_id,
            instance_id,
            slot_id,
            allocation_id,
        } = request;
        let token = resource_manager_id.parse::<ResourceManagerId>()?;
        let slot_id = slot_id
            .map(SlotId::from)
            .ok_or_else(|| Status::invalid_argument("missing slot ID"))?;
        let event = ResourceManagerEvent::NotifySlotAvailable {
            token,
            instance_id: InstanceId::from(instance_id),
            slot_id,
            allocation_id: allocation_id.into(),
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        Ok(Response::new(gen::NotifySlotAvailableResponse {}))
    }

    async fn deregister_application(
        &self,
        request: Request<gen::DeregisterApplicationRequest>,
    ) -> Result<Response<gen::DeregisterApplicationResponse>, Status> {
        let request = request.into_inner();
        debug!("{request:?}");
        let token = request.resource_manager_id.parse::<ResourceManagerId>()?;
        let status = request.status();
        let (tx, rx) = oneshot::channel();
        let event = ResourceManagerEvent::DeregisterApplication {
            token,
            status: status.into(),
            diagnostics: request.diagnostics,
            reply: tx,
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        rx.await.map_err(ClusterError::from)??;
        Ok(Response::new(gen::DeregisterApplicationResponse {}))
    }

    async fn get_registered_task_manager_count(
        &self,
        request: Request<gen::GetRegisteredTaskManagerCountRequest>,
    ) -> Result<Response<gen::GetRegisteredTaskManagerCountResponse>, Status> {
        let request = request.into_inner();
        let token = request.resource_manager_id.parse::<ResourceManagerId>()?;
        let (tx, rx) = oneshot::channel();
        let event = ResourceManagerEvent::GetRegisteredTaskManagerCount { token, reply: tx };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        let count = rx.await.map_err(ClusterError::from)??;
        Ok(Response::new(gen::GetRegisteredTaskManagerCountResponse {
            count: count as u32,
        }))
    }

    async fn list_task_managers(
        &self,
        request: Request<gen::ListTaskManagersRequest>,
    ) -> Result<Response<gen::ListTaskManagersResponse>, Status> {
        let request = request.into_inner();
        let token = request.resource_manager_id.parse::<ResourceManagerId>()?;
        let (tx, rx) = oneshot::channel();
        let event = ResourceManagerEvent::ListTaskManagers { token, reply: tx };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        let infos = rx.await.map_err(ClusterError::from)??;
        let response = gen::ListTaskManagersResponse {
            task_managers: infos.into_iter().map(task_manager_info_to_proto).collect(),
        };
        Ok(Response::new(response))
    }

    async fn get_task_manager(
        &self,
        request: Request<gen::GetTaskManagerRequest>,
    ) -> Result<Response<gen::GetTaskManagerResponse>, Status> {
        let request = request.into_inner();
        let gen::GetTaskManagerRequest {
            resource_manager_id,
            resource_id,
        } = request;
        let token = resource_manager_id.parse::<ResourceManagerId>()?;
        let (tx, rx) = oneshot::channel();
        let event = ResourceManagerEvent::GetTaskManager {
            token,
            resource_id: resource_id.into(),
            reply: tx,
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        let info = rx.await.map_err(ClusterError::from)??;
        Ok(Response::new(gen::GetTaskManagerResponse {
            task_manager: Some(task_manager_info_to_proto(info)),
        }))
    }

    async fn get_resource_overview(
        &self,
        request: Request<gen::GetResourceOverviewRequest>,
    ) -> Result<Response<gen::GetResourceOverviewResponse>, Status> {
        let request = request.into_inner();
        let token = request.resource_manager_id.parse::<ResourceManagerId>()?;
        let (tx, rx) = oneshot::channel();
        let event = ResourceManagerEvent::GetResourceOverview { token, reply: tx };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        let overview = rx.await.map_err(ClusterError::from)??;
        Ok(Response::new(gen::GetResourceOverviewResponse {
            task_manager_count: overview.task_manager_count as u32,
            slot_count: overview.slot_count as u32,
            free_slot_count: overview.free_slot_count as u32,
        }))
    }

    async fn list_task_manager_metric_addresses(
        &self,
        request: Request<gen::ListTaskManagerMetricAddressesRequest>,
    ) -> Result<Response<gen::ListTaskManagerMetricAddressesResponse>, Status> {
        let request = request.into_inner();
        debug!("{request:?}");
        let gen::ListTaskManagerMetricAddressesRequest {
            resource_manager_id,
            timeout_ms,
        } = request;
        let token = resource_manager_id.parse::<ResourceManagerId>()?;
        let (tx, rx) = oneshot::channel();
        let event = ResourceManagerEvent::ListTaskManagerMetricAddresses {
            token,
            timeout: rpc_timeout(timeout_ms),
            reply: tx,
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        let addresses = rx.await.map_err(ClusterError::from)??;
        let response = gen::ListTaskManagerMetricAddressesResponse {
            addresses: addresses
                .into_iter()
                .map(|(resource_id, address)| gen::TaskManagerMetricAddress {
                    resource_id: resource_id.to_string(),
                    address,
                })
                .collect(),
        };
        Ok(Response::new(response))
    }

    async fn request_task_manager_file_upload(
        &self,
        request: Request<gen::RequestTaskManagerFileUploadRequest>,
    ) -> Result<Response<gen::RequestTaskManagerFileUploadResponse>, Status> {
        let request = request.into_inner();
        debug!("{request:?}");
        let token = request.resource_manager_id.parse::<ResourceManagerId>()?;
        let file_type = FileType::try_from(request.file_type())?;
        let (tx, rx) = oneshot::channel();
        let event = ResourceManagerEvent::RequestTaskManagerFileUpload {
            token,
            resource_id: request.resource_id.into(),
            file_type,
            timeout: rpc_timeout(request.timeout_ms),
            reply: tx,
        };
        self.handle.send(event).await.map_err(ClusterError::from)?;
        let blob_key = rx.await.map_err(ClusterError::from)??;
        Ok(Response::new(gen::RequestTaskManagerFileUploadResponse {
            blob_key,
        }))
    }
}

fn task_manager_info_to_proto(
    info: crate::manager::state::TaskManagerInfo,
) -> gen::TaskManagerInfo {
    gen::TaskManagerInfo {
        resource_id: info.resource_id.to_string(),
        address: info.address,
        data_port: info.data_port as u32,
        last_heartbeat_ms: info.last_heartbeat_ms,
        slot_count: info.slot_count as u32,
        free_slot_count: info.free_slot_count as u32,
        hardware: Some(info.hardware.into()),
    }
}
