use std::mem;
use std::time::Duration;

use capstan_server::actor::{ActorAction, ActorContext};
use capstan_server::retry::Retryable;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::backend::ApplicationStatus;
use crate::error::{ClusterError, ClusterResult};
use crate::id::{
    AllocationId, InstanceId, JobId, JobMasterId, ResourceId, ResourceManagerId, SlotId,
};
use crate::ha::LeadershipEvent;
use crate::job_leader::JobLeaderIdEvent;
use crate::job_manager::JobManagerClient;
use crate::manager::event::{
    JobManagerRegistrationReply, ResourceManagerEvent, TaskExecutorRegistrationReply,
};
use crate::manager::heartbeat::HeartbeatTracker;
use crate::manager::state::{
    HardwareDescription, JobManagerRegistration, ResourceOverview, TaskManagerInfo,
    WorkerRegistration,
};
use crate::manager::ResourceManagerActor;
use crate::rpc::ClientOptions;
use crate::slots::{ResourceActions, ResourceProfile, SlotReport, SlotRequest};
use crate::task_executor::{FileType, TaskExecutorClient};

/// Buffers slot manager callbacks as commands on the resource manager
/// event loop. The commands carry the fencing token of the turn in which
/// they were produced, so they die in the fencing check if leadership has
/// changed by the time they run.
struct ResourceActionBuffer<'a> {
    ctx: &'a mut ActorContext<ResourceManagerActor>,
    token: ResourceManagerId,
}

impl ResourceActions for ResourceActionBuffer<'_> {
    fn release_resource(&mut self, instance_id: InstanceId, cause: &str) {
        self.ctx.send(ResourceManagerEvent::ReleaseResource {
            token: self.token,
            instance_id,
            cause: cause.to_string(),
        });
    }

    fn allocate_resource(&mut self, profile: ResourceProfile) {
        self.ctx.send(ResourceManagerEvent::AllocateResource {
            token: self.token,
            profile,
        });
    }

    fn notify_allocation_failure(
        &mut self,
        job_id: JobId,
        allocation_id: AllocationId,
        cause: &str,
    ) {
        self.ctx.send(ResourceManagerEvent::NotifyAllocationFailure {
            token: self.token,
            job_id,
            allocation_id,
            cause: cause.to_string(),
        });
    }
}

impl ResourceManagerActor {
    pub(super) fn handle_server_ready(
        &mut self,
        ctx: &mut ActorContext<Self>,
        port: u16,
        signal: oneshot::Sender<()>,
    ) -> ActorAction {
        let server = mem::take(&mut self.server);
        self.server = match server.ready(signal, port) {
            Ok(x) => x,
            Err(e) => {
                error!("{e}");
                return ActorAction::Stop;
            }
        };
        self.server_port = Some(port);
        info!("resource manager server is ready on port {port}");

        let (job_leader_tx, mut job_leader_rx) = mpsc::unbounded_channel();
        self.job_leader_id_service.start(job_leader_tx);
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            while let Some(event) = job_leader_rx.recv().await {
                let event = match event {
                    JobLeaderIdEvent::JobLeaderLostLeadership {
                        job_id,
                        old_job_master_id,
                    } => ResourceManagerEvent::JobLeaderLostLeadership {
                        job_id,
                        old_job_master_id,
                    },
                    JobLeaderIdEvent::JobTimeout { job_id, timeout_id } => {
                        ResourceManagerEvent::JobTimeout { job_id, timeout_id }
                    }
                };
                if handle.send(event).await.is_err() {
                    break;
                }
            }
        });

        let (leadership_tx, mut leadership_rx) = mpsc::unbounded_channel();
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            while let Some(event) = leadership_rx.recv().await {
                let event = match event {
                    LeadershipEvent::Granted { session } => {
                        ResourceManagerEvent::GrantLeadership { session }
                    }
                    LeadershipEvent::Revoked => ResourceManagerEvent::RevokeLeadership,
                    LeadershipEvent::Error { message } => {
                        ResourceManagerEvent::LeaderElectionError { message }
                    }
                };
                if handle.send(event).await.is_err() {
                    break;
                }
            }
        });

        let backend = self.backend.clone();
        let leader_election = self.leader_election.clone();
        let fatal_error_handler = self.fatal_error_handler.clone();
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            if let Err(e) = backend.initialize().await {
                error!("could not initialize the cluster backend: {e}");
                fatal_error_handler.on_fatal_error(&e);
                let _ = handle.send(ResourceManagerEvent::Shutdown).await;
                return;
            }
            if let Err(e) = leader_election.start(leadership_tx).await {
                error!("could not start the leader election service: {e}");
                fatal_error_handler.on_fatal_error(&e);
                let _ = handle.send(ResourceManagerEvent::Shutdown).await;
            }
        });
        ActorAction::Continue
    }

    // ------------------------------------------------------------------
    // registration state machine
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_register_job_manager(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
        job_master_id: JobMasterId,
        job_manager_resource_id: ResourceId,
        job_manager_address: String,
        job_id: JobId,
        timeout: Duration,
        reply: oneshot::Sender<ClusterResult<JobManagerRegistrationReply>>,
    ) -> ActorAction {
        if !self.job_leader_id_service.contains_job(&job_id) {
            if let Err(e) = self.job_leader_id_service.add_job(&job_id) {
                error!("could not add job {job_id} to the job leader ID service: {e}");
                self.on_fatal_error(&e);
                let _ = reply.send(Err(e));
                return ActorAction::Continue;
            }
        }

        info!("registering job manager {job_master_id}@{job_manager_address} for job {job_id}");

        let leader_id = match self.job_leader_id_service.get_leader_id(&job_id) {
            Ok(x) => x,
            Err(e) => {
                // without the leader ID the claimed job master cannot be verified
                self.on_fatal_error(&e);
                let _ = reply.send(Err(e));
                return ActorAction::Continue;
            }
        };

        let client_options =
            match ClientOptions::from_address(self.config.enable_tls, &job_manager_address) {
                Ok(x) => x,
                Err(e) => {
                    let _ = reply.send(Ok(JobManagerRegistrationReply::Decline(e.to_string())));
                    return ActorAction::Continue;
                }
            };
        let client = JobManagerClient::new(job_master_id, client_options);
        let retry_strategy = self.config.rpc_retry_strategy.clone();
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            let connect_client = client.clone();
            let connect = move || {
                let client = connect_client.clone();
                async move { client.connect().await }
            };
            let outcome = tokio::time::timeout(timeout, async move {
                connect.retry(retry_strategy).await?;
                let leading_job_master_id = leader_id.await?;
                Ok::<_, ClusterError>(leading_job_master_id)
            })
            .await;
            let outcome = match outcome {
                Ok(Ok(leading_job_master_id)) => Ok((client, leading_job_master_id)),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "registration of job manager {job_master_id} timed out"
                )),
            };
            let _ = handle
                .send(ResourceManagerEvent::CompleteJobManagerRegistration {
                    token,
                    job_id,
                    job_master_id,
                    job_manager_resource_id,
                    job_manager_address,
                    outcome,
                    reply,
                })
                .await;
        });
        ActorAction::Continue
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_complete_job_manager_registration(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
        job_id: JobId,
        job_master_id: JobMasterId,
        job_manager_resource_id: ResourceId,
        job_manager_address: String,
        outcome: Result<(JobManagerClient, JobMasterId), String>,
        reply: oneshot::Sender<ClusterResult<JobManagerRegistrationReply>>,
    ) -> ActorAction {
        let (client, leading_job_master_id) = match outcome {
            Ok(x) => x,
            Err(message) => {
                info!(
                    "registration of job manager {job_master_id}@{job_manager_address} failed: {message}"
                );
                let _ = reply.send(Ok(JobManagerRegistrationReply::Decline(message)));
                return ActorAction::Continue;
            }
        };

        if leading_job_master_id != job_master_id {
            let message = format!(
                "the leading job master ID {leading_job_master_id} did not match the received job master ID {job_master_id}; a job master leader change has happened"
            );
            debug!("{message}");
            let _ = reply.send(Ok(JobManagerRegistrationReply::Decline(message)));
            return ActorAction::Continue;
        }

        let existing = self
            .state
            .get_job_manager(&job_id)
            .map(|registration| registration.job_master_id);
        match existing {
            Some(registered) if registered == job_master_id => {
                debug!(
                    "job manager {job_master_id}@{job_manager_address} was already registered for job {job_id}"
                );
            }
            replaced => {
                if replaced.is_some() {
                    // tell the old job manager that it is no longer the job leader
                    self.close_job_manager_connection(
                        ctx,
                        &job_id,
                        format!("a new job leader for job {job_id} was found"),
                    );
                }
                self.state.insert_job_manager(JobManagerRegistration {
                    job_id: job_id.clone(),
                    job_manager_resource_id: job_manager_resource_id.clone(),
                    job_master_id,
                    client,
                });
                info!(
                    "registered job manager {job_master_id}@{job_manager_address} for job {job_id}"
                );
                self.monitor_job_manager(ctx, token, job_manager_resource_id);
            }
        }

        let _ = reply.send(Ok(JobManagerRegistrationReply::Success {
            resource_manager_id: token,
            resource_manager_resource_id: self.config.resource_id.clone(),
        }));
        ActorAction::Continue
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_register_task_executor(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
        task_executor_address: String,
        resource_id: ResourceId,
        data_port: u16,
        hardware: HardwareDescription,
        timeout: Duration,
        reply: oneshot::Sender<ClusterResult<TaskExecutorRegistrationReply>>,
    ) -> ActorAction {
        let client_options =
            match ClientOptions::from_address(self.config.enable_tls, &task_executor_address) {
                Ok(x) => x,
                Err(e) => {
                    let _ = reply.send(Ok(TaskExecutorRegistrationReply::Decline(e.to_string())));
                    return ActorAction::Continue;
                }
            };

        // A later attempt for the same resource ID supersedes this one;
        // the continuation checks that the attempt is still current.
        let attempt = self.state.begin_task_executor_registration(resource_id.clone());

        let client = TaskExecutorClient::new(client_options);
        let retry_strategy = self.config.rpc_retry_strategy.clone();
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            let connect_client = client.clone();
            let connect = move || {
                let client = connect_client.clone();
                async move { client.connect().await }
            };
            let connection = match tokio::time::timeout(timeout, connect.retry(retry_strategy)).await
            {
                Ok(Ok(())) => Ok(client),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "connection to task executor {task_executor_address} timed out"
                )),
            };
            let _ = handle
                .send(ResourceManagerEvent::CompleteTaskExecutorRegistration {
                    token,
                    resource_id,
                    task_executor_address,
                    data_port,
                    hardware,
                    attempt,
                    connection,
                    reply,
                })
                .await;
        });
        ActorAction::Continue
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_complete_task_executor_registration(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
        resource_id: ResourceId,
        task_executor_address: String,
        data_port: u16,
        hardware: HardwareDescription,
        attempt: u64,
        connection: Result<TaskExecutorClient, String>,
        reply: oneshot::Sender<ClusterResult<TaskExecutorRegistrationReply>>,
    ) -> ActorAction {
        if !self.state.finish_task_executor_registration(&resource_id, attempt) {
            let _ = reply.send(Ok(TaskExecutorRegistrationReply::Decline(
                "outdated task executor registration".to_string(),
            )));
            return ActorAction::Continue;
        }

        let client = match connection {
            Ok(x) => x,
            Err(message) => {
                info!(
                    "registration of task executor {resource_id} at {task_executor_address} failed: {message}"
                );
                let _ = reply.send(Ok(TaskExecutorRegistrationReply::Decline(message)));
                return ActorAction::Continue;
            }
        };

        if let Some(old) = self.state.remove_task_executor(&resource_id) {
            debug!("replacing old registration of task executor {resource_id}");
            self.slot_manager.unregister_task_manager(
                old.instance_id,
                &format!("task executor {resource_id} re-connected to the resource manager"),
            );
        }

        let Some(worker) = self.backend.worker_started(&resource_id) else {
            warn!(
                "discarding registration from task executor {resource_id} at {task_executor_address} because the framework did not recognize it"
            );
            let _ = reply.send(Ok(TaskExecutorRegistrationReply::Decline(
                "unrecognized task executor".to_string(),
            )));
            return ActorAction::Continue;
        };

        let instance_id = match self.state.next_instance_id() {
            Ok(x) => x,
            Err(e) => {
                self.on_fatal_error(&e);
                let _ = reply.send(Err(e));
                return ActorAction::Continue;
            }
        };
        self.state.insert_task_executor(
            resource_id.clone(),
            WorkerRegistration {
                instance_id,
                client,
                worker,
                address: task_executor_address.clone(),
                data_port,
                hardware,
            },
        );
        info!(
            "registered task executor {resource_id} ({task_executor_address}) with instance ID {instance_id}"
        );
        self.monitor_task_manager(ctx, token, resource_id);

        let _ = reply.send(Ok(TaskExecutorRegistrationReply::Success {
            instance_id,
            resource_manager_resource_id: self.config.resource_id.clone(),
            cluster_information: self.config.cluster_information.clone(),
        }));
        ActorAction::Continue
    }

    pub(super) fn handle_send_slot_report(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
        resource_id: ResourceId,
        instance_id: InstanceId,
        slot_report: SlotReport,
        reply: oneshot::Sender<ClusterResult<()>>,
    ) -> ActorAction {
        let registered_instance_id = self
            .state
            .get_task_executor(&resource_id)
            .map(|registration| registration.instance_id);
        let result = match registered_instance_id {
            None => Err(ClusterError::UnknownTaskExecutor(resource_id)),
            Some(registered) if registered != instance_id => Err(ClusterError::InvalidArgument(
                format!("unknown task manager registration ID {instance_id}"),
            )),
            Some(registered) => {
                let mut actions = ResourceActionBuffer { ctx, token };
                self.slot_manager.register_task_manager(
                    registered,
                    &resource_id,
                    slot_report,
                    &mut actions,
                );
                Ok(())
            }
        };
        let _ = reply.send(result);
        ActorAction::Continue
    }

    // ------------------------------------------------------------------
    // heartbeats
    // ------------------------------------------------------------------

    fn monitor_task_manager(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
        resource_id: ResourceId,
    ) {
        let Some(tracker) = &mut self.task_manager_heartbeats else {
            warn!("task manager heartbeat monitoring is not active");
            return;
        };
        let instant = tracker.monitor(resource_id.clone());
        let timeout = tracker.timeout();
        ctx.send_with_delay(
            ResourceManagerEvent::ProbeTaskManagerHeartbeat {
                token,
                resource_id,
                instant,
            },
            timeout,
        );
    }

    fn monitor_job_manager(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
        resource_id: ResourceId,
    ) {
        let Some(tracker) = &mut self.job_manager_heartbeats else {
            warn!("job manager heartbeat monitoring is not active");
            return;
        };
        let instant = tracker.monitor(resource_id.clone());
        let timeout = tracker.timeout();
        ctx.send_with_delay(
            ResourceManagerEvent::ProbeJobManagerHeartbeat {
                token,
                resource_id,
                instant,
            },
            timeout,
        );
    }

    pub(super) fn handle_heartbeat_from_task_manager(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
        resource_id: ResourceId,
        slot_report: SlotReport,
    ) -> ActorAction {
        let Some(tracker) = &mut self.task_manager_heartbeats else {
            return ActorAction::Continue;
        };
        let Some(instant) = tracker.record(&resource_id) else {
            debug!("received a heartbeat from unmonitored task manager {resource_id}");
            return ActorAction::Continue;
        };
        let timeout = tracker.timeout();
        ctx.send_with_delay(
            ResourceManagerEvent::ProbeTaskManagerHeartbeat {
                token,
                resource_id: resource_id.clone(),
                instant,
            },
            timeout,
        );

        let instance_id = self
            .state
            .get_task_executor(&resource_id)
            .map(|registration| registration.instance_id);
        match instance_id {
            Some(instance_id) => self.slot_manager.report_slot_status(instance_id, slot_report),
            None => debug!(
                "received a slot report from task manager {resource_id} which is no longer registered"
            ),
        }
        ActorAction::Continue
    }

    pub(super) fn handle_heartbeat_from_job_manager(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
        resource_id: ResourceId,
    ) -> ActorAction {
        let Some(tracker) = &mut self.job_manager_heartbeats else {
            return ActorAction::Continue;
        };
        let Some(instant) = tracker.record(&resource_id) else {
            debug!("received a heartbeat from unmonitored job manager {resource_id}");
            return ActorAction::Continue;
        };
        let timeout = tracker.timeout();
        ctx.send_with_delay(
            ResourceManagerEvent::ProbeJobManagerHeartbeat {
                token,
                resource_id,
                instant,
            },
            timeout,
        );
        ActorAction::Continue
    }

    pub(super) fn handle_trigger_task_manager_heartbeats(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
    ) -> ActorAction {
        if self.task_manager_heartbeats.is_none() {
            return ActorAction::Continue;
        }
        let own_resource_id = self.config.resource_id.clone();
        for (resource_id, registration) in self.state.list_task_executors() {
            let client = registration.client.clone();
            let own_resource_id = own_resource_id.clone();
            let target = resource_id.clone();
            ctx.spawn(async move {
                if let Err(e) = client.heartbeat_from_resource_manager(&own_resource_id).await {
                    debug!("failed to request a heartbeat from task manager {target}: {e}");
                }
            });
        }
        ctx.send_with_delay(
            ResourceManagerEvent::TriggerTaskManagerHeartbeats { token },
            self.config.heartbeat_interval,
        );
        ActorAction::Continue
    }

    pub(super) fn handle_trigger_job_manager_heartbeats(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
    ) -> ActorAction {
        if self.job_manager_heartbeats.is_none() {
            return ActorAction::Continue;
        }
        let own_resource_id = self.config.resource_id.clone();
        for registration in self.state.list_job_managers() {
            let client = registration.client.clone();
            let own_resource_id = own_resource_id.clone();
            let target = registration.job_manager_resource_id.clone();
            ctx.spawn(async move {
                if let Err(e) = client.heartbeat_from_resource_manager(&own_resource_id).await {
                    debug!("failed to request a heartbeat from job manager {target}: {e}");
                }
            });
        }
        ctx.send_with_delay(
            ResourceManagerEvent::TriggerJobManagerHeartbeats { token },
            self.config.heartbeat_interval,
        );
        ActorAction::Continue
    }

    pub(super) fn handle_probe_task_manager_heartbeat(
        &mut self,
        ctx: &mut ActorContext<Self>,
        resource_id: ResourceId,
        instant: Instant,
    ) -> ActorAction {
        let timed_out = self
            .task_manager_heartbeats
            .as_ref()
            .is_some_and(|tracker| tracker.is_timed_out(&resource_id, instant));
        if timed_out {
            info!("the heartbeat of task manager {resource_id} timed out");
            self.close_task_manager_connection(
                ctx,
                &resource_id,
                format!("the heartbeat of task manager {resource_id} timed out"),
            );
        }
        ActorAction::Continue
    }

    pub(super) fn handle_probe_job_manager_heartbeat(
        &mut self,
        ctx: &mut ActorContext<Self>,
        resource_id: ResourceId,
        instant: Instant,
    ) -> ActorAction {
        let timed_out = self
            .job_manager_heartbeats
            .as_ref()
            .is_some_and(|tracker| tracker.is_timed_out(&resource_id, instant));
        if timed_out {
            info!("the heartbeat of job manager {resource_id} timed out");
            let job_id = self
                .state
                .get_job_manager_by_resource(&resource_id)
                .map(|registration| registration.job_id.clone());
            if let Some(job_id) = job_id {
                self.close_job_manager_connection(
                    ctx,
                    &job_id,
                    format!("the heartbeat of job manager {resource_id} timed out"),
                );
            }
        }
        ActorAction::Continue
    }

    // ------------------------------------------------------------------
    // disconnects
    // ------------------------------------------------------------------

    pub(super) fn handle_disconnect_task_manager(
        &mut self,
        ctx: &mut ActorContext<Self>,
        resource_id: ResourceId,
        cause: String,
    ) -> ActorAction {
        self.close_task_manager_connection(ctx, &resource_id, cause);
        ActorAction::Continue
    }

    pub(super) fn handle_disconnect_job_manager(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        cause: String,
    ) -> ActorAction {
        self.close_job_manager_connection(ctx, &job_id, cause);
        ActorAction::Continue
    }

    fn close_task_manager_connection(
        &mut self,
        ctx: &mut ActorContext<Self>,
        resource_id: &ResourceId,
        cause: String,
    ) {
        if let Some(tracker) = &mut self.task_manager_heartbeats {
            tracker.unmonitor(resource_id);
        }
        if let Some(registration) = self.state.remove_task_executor(resource_id) {
            info!("closing task executor connection {resource_id}: {cause}");
            self.slot_manager
                .unregister_task_manager(registration.instance_id, &cause);
            let client = registration.client;
            let target = resource_id.clone();
            ctx.spawn(async move {
                if let Err(e) = client.disconnect_resource_manager(cause).await {
                    debug!("failed to notify task executor {target} about the disconnect: {e}");
                }
            });
        } else {
            debug!("no open task executor connection {resource_id}; ignoring the disconnect: {cause}");
        }
    }

    fn close_job_manager_connection(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: &JobId,
        cause: String,
    ) {
        if let Some(registration) = self.state.remove_job_manager(job_id) {
            info!(
                "disconnecting job manager {} for job {job_id}: {cause}",
                registration.job_master_id
            );
            if let Some(tracker) = &mut self.job_manager_heartbeats {
                tracker.unmonitor(&registration.job_manager_resource_id);
            }
            // the remote side verifies the disconnect against our token
            if let Some(token) = self.fencing_token {
                let client = registration.client;
                ctx.spawn(async move {
                    if let Err(e) = client.disconnect_resource_manager(token, cause).await {
                        debug!("failed to notify job manager about the disconnect: {e}");
                    }
                });
            }
        } else {
            debug!("there was no registered job manager for job {job_id}");
        }
    }

    // ------------------------------------------------------------------
    // slot request dispatch
    // ------------------------------------------------------------------

    pub(super) fn handle_request_slot(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
        job_master_id: JobMasterId,
        slot_request: SlotRequest,
        reply: oneshot::Sender<ClusterResult<()>>,
    ) -> ActorAction {
        let job_id = slot_request.job_id.clone();
        let registered = self
            .state
            .get_job_manager(&job_id)
            .map(|registration| registration.job_master_id);
        let result = match registered {
            None => Err(ClusterError::SlotRequestFailure(format!(
                "could not find a registered job manager for job {job_id}"
            ))),
            Some(registered) if registered != job_master_id => {
                Err(ClusterError::FencingTokenMismatch {
                    expected: registered.to_string(),
                    found: job_master_id.to_string(),
                })
            }
            Some(_) => {
                info!(
                    "request slot with profile {} for job {job_id} with allocation ID {}",
                    slot_request.profile, slot_request.allocation_id
                );
                let mut actions = ResourceActionBuffer { ctx, token };
                self.slot_manager
                    .register_slot_request(slot_request, &mut actions)
            }
        };
        let _ = reply.send(result);
        ActorAction::Continue
    }

    pub(super) fn handle_cancel_slot_request(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        allocation_id: AllocationId,
    ) -> ActorAction {
        // slot allocations are asynchronous, so cancellation is best effort
        self.slot_manager.unregister_slot_request(&allocation_id);
        ActorAction::Continue
    }

    pub(super) fn handle_notify_slot_available(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
        instance_id: InstanceId,
        slot_id: SlotId,
        allocation_id: AllocationId,
    ) -> ActorAction {
        let registered = self
            .state
            .get_task_executor(&slot_id.resource_id)
            .map(|registration| registration.instance_id);
        match registered {
            Some(registered) if registered == instance_id => {
                let mut actions = ResourceActionBuffer { ctx, token };
                self.slot_manager
                    .free_slot(&slot_id, &allocation_id, &mut actions);
            }
            Some(_) => debug!(
                "invalid registration ID for the slot available message; this indicates an outdated request"
            ),
            None => debug!(
                "could not find a registration for resource ID {}; discarding the slot available message for slot {slot_id}",
                slot_id.resource_id
            ),
        }
        ActorAction::Continue
    }

    // ------------------------------------------------------------------
    // resource actions
    // ------------------------------------------------------------------

    pub(super) fn handle_release_resource(
        &mut self,
        ctx: &mut ActorContext<Self>,
        instance_id: InstanceId,
        cause: String,
    ) -> ActorAction {
        let found = self
            .state
            .find_task_executor_by_instance(instance_id)
            .map(|(resource_id, registration)| {
                (
                    resource_id.clone(),
                    self.backend.stop_worker(registration.worker.as_ref()),
                )
            });
        match found {
            Some((resource_id, true)) => {
                self.close_task_manager_connection(ctx, &resource_id, cause)
            }
            Some((resource_id, false)) => debug!("worker {resource_id} could not be stopped"),
            None => {
                // unregister in order to clean up potential leftover state
                self.slot_manager.unregister_task_manager(instance_id, &cause);
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_allocate_resource(
        &mut self,
        ctx: &mut ActorContext<Self>,
        profile: ResourceProfile,
    ) -> ActorAction {
        let backend = self.backend.clone();
        ctx.spawn(async move {
            match backend.start_new_worker(&profile).await {
                Ok(profiles) if profiles.is_empty() => {
                    debug!("the backend refused to start a worker with profile {profile}")
                }
                Ok(profiles) => {
                    info!(
                        "requested a new worker advertising {} slots for profile {profile}",
                        profiles.len()
                    )
                }
                Err(e) => warn!("failed to start a new worker with profile {profile}: {e}"),
            }
        });
        ActorAction::Continue
    }

    pub(super) fn handle_notify_allocation_failure(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        allocation_id: AllocationId,
        cause: String,
    ) -> ActorAction {
        if let Some(registration) = self.state.get_job_manager(&job_id) {
            let client = registration.client.clone();
            ctx.spawn(async move {
                if let Err(e) = client.notify_allocation_failure(&allocation_id, cause).await {
                    debug!("failed to notify the job manager of job {job_id} about an allocation failure: {e}");
                }
            });
        }
        // a missing job manager has already disconnected; nothing to report
        ActorAction::Continue
    }

    // ------------------------------------------------------------------
    // job leader ID service callbacks
    // ------------------------------------------------------------------

    pub(super) fn handle_job_leader_lost_leadership(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        old_job_master_id: JobMasterId,
    ) -> ActorAction {
        let registered = self
            .state
            .get_job_manager(&job_id)
            .map(|registration| registration.job_master_id == old_job_master_id);
        match registered {
            Some(true) => {
                self.close_job_manager_connection(
                    ctx,
                    &job_id,
                    "the job leader lost leadership".to_string(),
                );
            }
            Some(false) => debug!(
                "discarding job leader lost leadership because a new job leader was found for job {job_id}"
            ),
            None => debug!(
                "discarding job leader lost leadership for outdated leader {old_job_master_id} for job {job_id}"
            ),
        }
        ActorAction::Continue
    }

    pub(super) fn handle_job_timeout(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        timeout_id: Uuid,
    ) -> ActorAction {
        if self.job_leader_id_service.is_valid_timeout(&job_id, timeout_id) {
            info!("removing job {job_id} after running without a leader for too long");
            self.remove_job(ctx, &job_id);
        } else {
            debug!("ignoring an outdated timeout for job {job_id}");
        }
        ActorAction::Continue
    }

    fn remove_job(&mut self, ctx: &mut ActorContext<Self>, job_id: &JobId) {
        if let Err(e) = self.job_leader_id_service.remove_job(job_id) {
            warn!("could not properly remove job {job_id} from the job leader ID service: {e}");
        }
        if self.state.get_job_manager(job_id).is_some() {
            self.close_job_manager_connection(ctx, job_id, format!("job {job_id} was removed"));
        }
    }

    // ------------------------------------------------------------------
    // application teardown and introspection
    // ------------------------------------------------------------------

    pub(super) fn handle_deregister_application(
        &mut self,
        ctx: &mut ActorContext<Self>,
        status: ApplicationStatus,
        diagnostics: Option<String>,
        reply: oneshot::Sender<ClusterResult<()>>,
    ) -> ActorAction {
        info!(
            "shutting down the cluster because the application is in status {status}: {}",
            diagnostics.as_deref().unwrap_or("no diagnostics")
        );
        let backend = self.backend.clone();
        ctx.spawn(async move {
            if let Err(e) = backend.deregister_application(status, diagnostics).await {
                warn!("could not properly deregister the application: {e}");
            }
            let _ = reply.send(Ok(()));
        });
        ActorAction::Continue
    }

    pub(super) fn handle_get_registered_task_manager_count(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        reply: oneshot::Sender<ClusterResult<usize>>,
    ) -> ActorAction {
        let _ = reply.send(Ok(self.state.task_executor_count()));
        ActorAction::Continue
    }

    pub(super) fn handle_list_task_managers(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        reply: oneshot::Sender<ClusterResult<Vec<TaskManagerInfo>>>,
    ) -> ActorAction {
        let infos = self
            .state
            .list_task_executors()
            .map(|(resource_id, registration)| self.task_manager_info(resource_id, registration))
            .collect();
        let _ = reply.send(Ok(infos));
        ActorAction::Continue
    }

    pub(super) fn handle_get_task_manager(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        resource_id: ResourceId,
        reply: oneshot::Sender<ClusterResult<TaskManagerInfo>>,
    ) -> ActorAction {
        let result = match self.state.get_task_executor(&resource_id) {
            Some(registration) => Ok(self.task_manager_info(&resource_id, registration)),
            None => Err(ClusterError::UnknownTaskExecutor(resource_id)),
        };
        let _ = reply.send(result);
        ActorAction::Continue
    }

    pub(super) fn handle_get_resource_overview(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        reply: oneshot::Sender<ClusterResult<ResourceOverview>>,
    ) -> ActorAction {
        let _ = reply.send(Ok(ResourceOverview {
            task_manager_count: self.state.task_executor_count(),
            slot_count: self.slot_manager.registered_slot_count(),
            free_slot_count: self.slot_manager.free_slot_count(),
        }));
        ActorAction::Continue
    }

    pub(super) fn handle_list_task_manager_metric_addresses(
        &mut self,
        ctx: &mut ActorContext<Self>,
        timeout: Duration,
        reply: oneshot::Sender<ClusterResult<Vec<(ResourceId, String)>>>,
    ) -> ActorAction {
        let queries = self
            .state
            .list_task_executors()
            .map(|(resource_id, registration)| (resource_id.clone(), registration.client.clone()))
            .collect::<Vec<_>>();
        ctx.spawn(async move {
            let queries = queries.into_iter().map(|(resource_id, client)| async move {
                let address =
                    tokio::time::timeout(timeout, client.get_metric_query_service_address())
                        .await
                        .map_err(|_| {
                            ClusterError::InternalError(format!(
                                "metric query service address request to {resource_id} timed out"
                            ))
                        })??;
                // executors without a metric query service are dropped
                Ok::<_, ClusterError>(address.map(|address| (resource_id, address)))
            });
            let result = futures::future::try_join_all(queries)
                .await
                .map(|entries| entries.into_iter().flatten().collect());
            let _ = reply.send(result);
        });
        ActorAction::Continue
    }

    pub(super) fn handle_request_task_manager_file_upload(
        &mut self,
        ctx: &mut ActorContext<Self>,
        resource_id: ResourceId,
        file_type: FileType,
        timeout: Duration,
        reply: oneshot::Sender<ClusterResult<String>>,
    ) -> ActorAction {
        debug!("request file {file_type} upload from task executor {resource_id}");
        let Some(registration) = self.state.get_task_executor(&resource_id) else {
            debug!("requested file {file_type} upload from unregistered task executor {resource_id}");
            let _ = reply.send(Err(ClusterError::UnknownTaskExecutor(resource_id)));
            return ActorAction::Continue;
        };
        let client = registration.client.clone();
        ctx.spawn(async move {
            let result = match tokio::time::timeout(timeout, client.request_file_upload(file_type))
                .await
            {
                Ok(x) => x,
                Err(_) => Err(ClusterError::InternalError(format!(
                    "file upload request to {resource_id} timed out"
                ))),
            };
            let _ = reply.send(result);
        });
        ActorAction::Continue
    }

    fn task_manager_info(
        &self,
        resource_id: &ResourceId,
        registration: &WorkerRegistration,
    ) -> TaskManagerInfo {
        TaskManagerInfo {
            resource_id: resource_id.clone(),
            address: registration.address.clone(),
            data_port: registration.data_port,
            last_heartbeat_ms: self
                .task_manager_heartbeats
                .as_ref()
                .and_then(|tracker| tracker.last_heartbeat_ms(resource_id))
                .unwrap_or(0),
            slot_count: self.slot_manager.registered_slot_count_of(registration.instance_id),
            free_slot_count: self.slot_manager.free_slot_count_of(registration.instance_id),
            hardware: registration.hardware,
        }
    }

    // ------------------------------------------------------------------
    // leadership
    // ------------------------------------------------------------------

    pub(super) fn handle_grant_leadership(
        &mut self,
        ctx: &mut ActorContext<Self>,
        session: Uuid,
    ) -> ActorAction {
        info!("resource manager was granted leadership with session {session}");
        // any in-flight clear-state work must settle before the new
        // session is accepted
        let clear_state_signal = self.clear_state_signal.take();
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            if let Some(signal) = clear_state_signal {
                let _ = signal.await;
            }
            let _ = handle
                .send(ResourceManagerEvent::AcceptLeadership { session })
                .await;
        });
        ActorAction::Continue
    }

    pub(super) fn handle_accept_leadership(
        &mut self,
        ctx: &mut ActorContext<Self>,
        session: Uuid,
    ) -> ActorAction {
        if !self.leader_election.has_leadership(session) {
            debug!("ignoring leadership acceptance for stale session {session}");
            return ActorAction::Continue;
        }

        // clear the state if we have been the leader before
        if self.fencing_token.is_some() {
            self.clear_state_internal(ctx);
        }

        let token = ResourceManagerId::from(session);
        self.fencing_token = Some(token);
        info!("resource manager is now the leader with fencing token {token}");
        self.start_services_on_leadership(ctx, token);

        let Some(address) = self.external_address() else {
            self.on_fatal_error(&ClusterError::InternalError(
                "cannot confirm leadership before the server is ready".to_string(),
            ));
            return ActorAction::Continue;
        };

        // downstream participants must not see the leader announcement
        // before the services above are ready to accept traffic
        let backend = self.backend.clone();
        let leader_election = self.leader_election.clone();
        let fatal_error_handler = self.fatal_error_handler.clone();
        ctx.spawn(async move {
            let result = async {
                backend.prepare_leadership().await?;
                leader_election.confirm_leadership(session, address).await
            }
            .await;
            if let Err(e) = result {
                error!("could not confirm leadership for session {session}: {e}");
                fatal_error_handler.on_fatal_error(&e);
            }
        });
        ActorAction::Continue
    }

    pub(super) fn handle_revoke_leadership(&mut self, ctx: &mut ActorContext<Self>) -> ActorAction {
        info!("resource manager was revoked leadership; clearing the fencing token");
        self.clear_state_internal(ctx);
        self.fencing_token = None;
        self.slot_manager.suspend();
        self.stop_heartbeat_services();
        ActorAction::Continue
    }

    pub(super) fn handle_leader_election_error(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        message: String,
    ) -> ActorAction {
        self.on_fatal_error(&ClusterError::InternalError(format!(
            "received an error from the leader election service: {message}"
        )));
        ActorAction::Continue
    }

    fn start_services_on_leadership(
        &mut self,
        ctx: &mut ActorContext<Self>,
        token: ResourceManagerId,
    ) {
        self.task_manager_heartbeats =
            Some(HeartbeatTracker::new(self.config.heartbeat_timeout));
        self.job_manager_heartbeats = Some(HeartbeatTracker::new(self.config.heartbeat_timeout));
        ctx.send_with_delay(
            ResourceManagerEvent::TriggerTaskManagerHeartbeats { token },
            self.config.heartbeat_interval,
        );
        ctx.send_with_delay(
            ResourceManagerEvent::TriggerJobManagerHeartbeats { token },
            self.config.heartbeat_interval,
        );
        self.slot_manager.start(token);
    }

    fn stop_heartbeat_services(&mut self) {
        // outstanding probe and trigger events die in the fencing check
        self.task_manager_heartbeats = None;
        self.job_manager_heartbeats = None;
    }

    fn clear_state_internal(&mut self, ctx: &mut ActorContext<Self>) {
        self.state.clear();
        if let Err(e) = self.job_leader_id_service.clear() {
            self.on_fatal_error(&ClusterError::InternalError(format!(
                "could not properly clear the job leader ID service: {e}"
            )));
        }
        let (tx, rx) = oneshot::channel();
        let backend = self.backend.clone();
        ctx.spawn(async move {
            if let Err(e) = backend.clear_state().await {
                error!("failed to clear the backend state: {e}");
            }
            let _ = tx.send(());
        });
        self.clear_state_signal = Some(rx);
    }

    pub(super) fn on_fatal_error(&self, error: &ClusterError) {
        error!("fatal error occurred in the resource manager: {error}");
        // the handler implementation is expected to be non-blocking
        self.fatal_error_handler.on_fatal_error(error);
    }

    pub(super) async fn stop_resource_manager_services(&mut self) {
        let mut errors: Vec<ClusterError> = vec![];
        self.stop_heartbeat_services();
        if let Err(e) = self.slot_manager.close() {
            errors.push(e);
        }
        if let Err(e) = self.leader_election.stop().await {
            errors.push(e);
        }
        if let Err(e) = self.job_leader_id_service.stop() {
            errors.push(e);
        }
        self.state.clear();
        if let Err(e) = self.backend.clear_state().await {
            errors.push(e);
        }
        // every stop is attempted; failures are surfaced together
        for e in &errors {
            error!("failure while stopping resource manager services: {e}");
        }
    }
}
