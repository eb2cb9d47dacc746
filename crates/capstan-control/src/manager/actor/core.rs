use std::mem;

use capstan_server::actor::{Actor, ActorAction, ActorContext};
use log::info;

use crate::error::ClusterError;
use crate::job_leader::JobLeaderIdService;
use crate::manager::event::{Fencing, ResourceManagerEvent};
use crate::manager::options::{ResourceManagerOptions, ResourceManagerServices};
use crate::manager::state::ResourceManagerState;
use crate::manager::ResourceManagerActor;
use crate::rpc::ServerMonitor;

#[tonic::async_trait]
impl Actor for ResourceManagerActor {
    type Message = ResourceManagerEvent;
    type Options = ResourceManagerOptions;

    fn name() -> &'static str {
        "ResourceManagerActor"
    }

    fn new(options: ResourceManagerOptions) -> Self {
        let ResourceManagerOptions {
            config,
            services:
                ResourceManagerServices {
                    leader_election,
                    job_leader_retrieval,
                    slot_manager,
                    backend,
                    fatal_error_handler,
                },
        } = options;
        let job_leader_id_service =
            JobLeaderIdService::new(job_leader_retrieval, config.job_leader_id_timeout);
        Self {
            config,
            leader_election,
            backend,
            fatal_error_handler,
            slot_manager,
            job_leader_id_service,
            server: ServerMonitor::new(),
            server_port: None,
            state: ResourceManagerState::new(),
            fencing_token: None,
            task_manager_heartbeats: None,
            job_manager_heartbeats: None,
            clear_state_signal: None,
        }
    }

    async fn start(&mut self, ctx: &mut ActorContext<Self>) {
        let addr = (self.config.listen_host.clone(), self.config.listen_port);
        let server = mem::take(&mut self.server);
        self.server = server.start(Self::serve(ctx.handle().clone(), addr)).await;
    }

    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: ResourceManagerEvent) -> ActorAction {
        if let Fencing::Fenced(token) = message.fencing() {
            if Some(token) != self.fencing_token {
                let expected = self
                    .fencing_token
                    .map(|x| x.to_string())
                    .unwrap_or_else(|| "none".to_string());
                message.reject(ClusterError::FencingTokenMismatch {
                    expected,
                    found: token.to_string(),
                });
                return ActorAction::Continue;
            }
        }
        match message {
            ResourceManagerEvent::ServerReady { port, signal } => {
                self.handle_server_ready(ctx, port, signal)
            }
            ResourceManagerEvent::RegisterJobManager {
                token,
                job_master_id,
                job_manager_resource_id,
                job_manager_address,
                job_id,
                timeout,
                reply,
            } => self.handle_register_job_manager(
                ctx,
                token,
                job_master_id,
                job_manager_resource_id,
                job_manager_address,
                job_id,
                timeout,
                reply,
            ),
            ResourceManagerEvent::CompleteJobManagerRegistration {
                token,
                job_id,
                job_master_id,
                job_manager_resource_id,
                job_manager_address,
                outcome,
                reply,
            } => self.handle_complete_job_manager_registration(
                ctx,
                token,
                job_id,
                job_master_id,
                job_manager_resource_id,
                job_manager_address,
                outcome,
                reply,
            ),
            ResourceManagerEvent::RegisterTaskExecutor {
                token,
                task_executor_address,
                resource_id,
                data_port,
                hardware,
                timeout,
                reply,
            } => self.handle_register_task_executor(
                ctx,
                token,
                task_executor_address,
                resource_id,
                data_port,
                hardware,
                timeout,
                reply,
            ),
            ResourceManagerEvent::CompleteTaskExecutorRegistration {
                token,
                resource_id,
                task_executor_address,
                data_port,
                hardware,
                attempt,
                connection,
                reply,
            } => self.handle_complete_task_executor_registration(
                ctx,
                token,
                resource_id,
                task_executor_address,
                data_port,
                hardware,
                attempt,
                connection,
                reply,
            ),
            ResourceManagerEvent::SendSlotReport {
                token,
                resource_id,
                instance_id,
                slot_report,
                reply,
            } => self.handle_send_slot_report(ctx, token, resource_id, instance_id, slot_report, reply),
            ResourceManagerEvent::HeartbeatFromTaskManager {
                token,
                resource_id,
                slot_report,
            } => self.handle_heartbeat_from_task_manager(ctx, token, resource_id, slot_report),
            ResourceManagerEvent::HeartbeatFromJobManager { token, resource_id } => {
                self.handle_heartbeat_from_job_manager(ctx, token, resource_id)
            }
            ResourceManagerEvent::DisconnectTaskManager {
                token: _,
                resource_id,
                cause,
            } => self.handle_disconnect_task_manager(ctx, resource_id, cause),
            ResourceManagerEvent::DisconnectJobManager {
                token: _,
                job_id,
                cause,
            } => self.handle_disconnect_job_manager(ctx, job_id, cause),
            ResourceManagerEvent::RequestSlot {
                token,
                job_master_id,
                slot_request,
                reply,
            } => self.handle_request_slot(ctx, token, job_master_id, slot_request, reply),
            ResourceManagerEvent::CancelSlotRequest {
                token: _,
                allocation_id,
            } => self.handle_cancel_slot_request(ctx, allocation_id),
            ResourceManagerEvent::NotifySlotAvailable {
                token,
                instance_id,
                slot_id,
                allocation_id,
            } => self.handle_notify_slot_available(ctx, token, instance_id, slot_id, allocation_id),
            ResourceManagerEvent::DeregisterApplication {
                token: _,
                status,
                diagnostics,
                reply,
            } => self.handle_deregister_application(ctx, status, diagnostics, reply),
            ResourceManagerEvent::GetRegisteredTaskManagerCount { token: _, reply } => {
                self.handle_get_registered_task_manager_count(ctx, reply)
            }
            ResourceManagerEvent::ListTaskManagers { token: _, reply } => {
                self.handle_list_task_managers(ctx, reply)
            }
            ResourceManagerEvent::GetTaskManager {
                token: _,
                resource_id,
                reply,
            } => self.handle_get_task_manager(ctx, resource_id, reply),
            ResourceManagerEvent::GetResourceOverview { token: _, reply } => {
                self.handle_get_resource_overview(ctx, reply)
            }
            ResourceManagerEvent::ListTaskManagerMetricAddresses {
                token: _,
                timeout,
                reply,
            } => self.handle_list_task_manager_metric_addresses(ctx, timeout, reply),
            ResourceManagerEvent::RequestTaskManagerFileUpload {
                token: _,
                resource_id,
                file_type,
                timeout,
                reply,
            } => self.handle_request_task_manager_file_upload(ctx, resource_id, file_type, timeout, reply),
            ResourceManagerEvent::TriggerTaskManagerHeartbeats { token } => {
                self.handle_trigger_task_manager_heartbeats(ctx, token)
            }
            ResourceManagerEvent::TriggerJobManagerHeartbeats { token } => {
                self.handle_trigger_job_manager_heartbeats(ctx, token)
            }
            ResourceManagerEvent::ProbeTaskManagerHeartbeat {
                token: _,
                resource_id,
                instant,
            } => self.handle_probe_task_manager_heartbeat(ctx, resource_id, instant),
            ResourceManagerEvent::ProbeJobManagerHeartbeat {
                token: _,
                resource_id,
                instant,
            } => self.handle_probe_job_manager_heartbeat(ctx, resource_id, instant),
            ResourceManagerEvent::ReleaseResource {
                token: _,
                instance_id,
                cause,
            } => self.handle_release_resource(ctx, instance_id, cause),
            ResourceManagerEvent::AllocateResource { token: _, profile } => {
                self.handle_allocate_resource(ctx, profile)
            }
            ResourceManagerEvent::NotifyAllocationFailure {
                token: _,
                job_id,
                allocation_id,
                cause,
            } => self.handle_notify_allocation_failure(ctx, job_id, allocation_id, cause),
            ResourceManagerEvent::JobLeaderLostLeadership {
                job_id,
                old_job_master_id,
            } => self.handle_job_leader_lost_leadership(ctx, job_id, old_job_master_id),
            ResourceManagerEvent::JobTimeout { job_id, timeout_id } => {
                self.handle_job_timeout(ctx, job_id, timeout_id)
            }
            ResourceManagerEvent::GrantLeadership { session } => {
                self.handle_grant_leadership(ctx, session)
            }
            ResourceManagerEvent::AcceptLeadership { session } => {
                self.handle_accept_leadership(ctx, session)
            }
            ResourceManagerEvent::RevokeLeadership => self.handle_revoke_leadership(ctx),
            ResourceManagerEvent::LeaderElectionError { message } => {
                self.handle_leader_election_error(ctx, message)
            }
            ResourceManagerEvent::Shutdown => ActorAction::Stop,
        }
    }

    async fn stop(mut self, _ctx: &mut ActorContext<Self>) {
        self.stop_resource_manager_services().await;
        info!("stopping resource manager server");
        let server = mem::take(&mut self.server);
        server.stop().await;
        info!("resource manager server has stopped");
    }
}
