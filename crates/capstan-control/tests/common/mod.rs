#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use capstan_control::backend::{ApplicationStatus, ClusterBackend, WorkerNode};
use capstan_control::error::{ClusterError, ClusterResult, FatalErrorHandler};
use capstan_control::ha::{LeaderElection, LeadershipEvent, StandaloneHaServices};
use capstan_control::id::{AllocationId, InstanceId, ResourceId, ResourceManagerId, SlotId};
use capstan_control::manager::event::ClusterInformation;
use capstan_control::manager::options::{
    ResourceManagerConfig, ResourceManagerOptions, ResourceManagerServices,
};
use capstan_control::proto::capstan::job_manager as jm_gen;
use capstan_control::proto::capstan::resource_manager::resource_manager_service_client::ResourceManagerServiceClient;
use capstan_control::proto::capstan::task_executor as te_gen;
use capstan_control::slots::{
    ResourceActions, ResourceProfile, SlotManager, SlotReport, SlotRequest,
};
use capstan_control::ResourceManagerRunner;
use capstan_server::retry::RetryStrategy;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tonic::transport::server::TcpIncoming;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use uuid::Uuid;

pub fn lock<T>(value: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    value.lock().unwrap_or_else(PoisonError::into_inner)
}

pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_until_async<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------
// recording slot manager
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct SlotManagerCalls {
    pub started: Vec<String>,
    pub suspended: usize,
    pub closed: usize,
    pub registered_task_managers: Vec<(u64, String)>,
    pub unregistered_task_managers: Vec<(u64, String)>,
    pub slot_requests: Vec<(String, String)>,
    pub canceled_requests: Vec<String>,
    pub freed_slots: Vec<(String, String)>,
    pub slot_reports: Vec<u64>,
}

/// Scripted reactions of the recording slot manager, keyed by allocation ID.
#[derive(Default)]
pub struct SlotManagerScript {
    /// Report an allocation failure with the given cause when the request
    /// arrives.
    pub fail_requests: HashMap<String, String>,
    /// Ask the resource manager to release the given instance when the
    /// request arrives.
    pub release_on_request: HashMap<String, u64>,
}

pub struct RecordingSlotManager {
    calls: Arc<Mutex<SlotManagerCalls>>,
    script: SlotManagerScript,
    slots: HashMap<u64, usize>,
}

impl RecordingSlotManager {
    pub fn new(calls: Arc<Mutex<SlotManagerCalls>>, script: SlotManagerScript) -> Self {
        Self {
            calls,
            script,
            slots: HashMap::new(),
        }
    }
}

impl SlotManager for RecordingSlotManager {
    fn start(&mut self, leader_id: ResourceManagerId) {
        lock(&self.calls).started.push(leader_id.to_string());
    }

    fn suspend(&mut self) {
        lock(&self.calls).suspended += 1;
        self.slots.clear();
    }

    fn close(&mut self) -> ClusterResult<()> {
        lock(&self.calls).closed += 1;
        Ok(())
    }

    fn register_task_manager(
        &mut self,
        instance_id: InstanceId,
        resource_id: &ResourceId,
        report: SlotReport,
        _actions: &mut dyn ResourceActions,
    ) {
        self.slots.insert(instance_id.into(), report.slots.len());
        lock(&self.calls)
            .registered_task_managers
            .push((instance_id.into(), resource_id.to_string()));
    }

    fn unregister_task_manager(&mut self, instance_id: InstanceId, cause: &str) -> bool {
        lock(&self.calls)
            .unregistered_task_managers
            .push((instance_id.into(), cause.to_string()));
        self.slots.remove(&u64::from(instance_id)).is_some()
    }

    fn register_slot_request(
        &mut self,
        request: SlotRequest,
        actions: &mut dyn ResourceActions,
    ) -> ClusterResult<()> {
        let allocation = request.allocation_id.to_string();
        if let Some(cause) = self.script.fail_requests.get(&allocation) {
            actions.notify_allocation_failure(
                request.job_id.clone(),
                request.allocation_id.clone(),
                cause,
            );
        }
        if let Some(instance) = self.script.release_on_request.get(&allocation) {
            actions.release_resource(InstanceId::from(*instance), "released by test script");
        }
        lock(&self.calls)
            .slot_requests
            .push((request.job_id.to_string(), allocation));
        Ok(())
    }

    fn unregister_slot_request(&mut self, allocation_id: &AllocationId) {
        lock(&self.calls)
            .canceled_requests
            .push(allocation_id.to_string());
    }

    fn free_slot(
        &mut self,
        slot_id: &SlotId,
        allocation_id: &AllocationId,
        _actions: &mut dyn ResourceActions,
    ) {
        lock(&self.calls)
            .freed_slots
            .push((slot_id.to_string(), allocation_id.to_string()));
    }

    fn report_slot_status(&mut self, instance_id: InstanceId, report: SlotReport) {
        self.slots.insert(instance_id.into(), report.slots.len());
        lock(&self.calls).slot_reports.push(instance_id.into());
    }

    fn registered_slot_count(&self) -> usize {
        self.slots.values().sum()
    }

    fn free_slot_count(&self) -> usize {
        self.slots.values().sum()
    }

    fn registered_slot_count_of(&self, instance_id: InstanceId) -> usize {
        self.slots.get(&u64::from(instance_id)).copied().unwrap_or(0)
    }

    fn free_slot_count_of(&self, instance_id: InstanceId) -> usize {
        self.registered_slot_count_of(instance_id)
    }
}

// ---------------------------------------------------------------------
// test backend
// ---------------------------------------------------------------------

#[derive(Debug)]
struct TestWorkerNode {
    resource_id: ResourceId,
}

impl WorkerNode for TestWorkerNode {
    fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }
}

#[derive(Default)]
pub struct TestBackend {
    /// Task executors the framework refuses to recognize.
    pub rejected_workers: Mutex<HashSet<String>>,
    pub started_profiles: Mutex<Vec<ResourceProfile>>,
    pub stopped_workers: Mutex<Vec<String>>,
    pub deregistrations: Mutex<Vec<ApplicationStatus>>,
    /// When set, `clear_state` blocks until the notify is signalled.
    pub clear_state_gate: Mutex<Option<Arc<Notify>>>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[tonic::async_trait]
impl ClusterBackend for TestBackend {
    async fn initialize(&self) -> ClusterResult<()> {
        Ok(())
    }

    async fn start_new_worker(
        &self,
        profile: &ResourceProfile,
    ) -> ClusterResult<Vec<ResourceProfile>> {
        lock(&self.started_profiles).push(*profile);
        Ok(vec![*profile])
    }

    fn worker_started(&self, resource_id: &ResourceId) -> Option<Box<dyn WorkerNode>> {
        if lock(&self.rejected_workers).contains(resource_id.as_str()) {
            return None;
        }
        Some(Box::new(TestWorkerNode {
            resource_id: resource_id.clone(),
        }))
    }

    fn stop_worker(&self, worker: &dyn WorkerNode) -> bool {
        lock(&self.stopped_workers).push(worker.resource_id().to_string());
        true
    }

    async fn deregister_application(
        &self,
        status: ApplicationStatus,
        _diagnostics: Option<String>,
    ) -> ClusterResult<()> {
        lock(&self.deregistrations).push(status);
        Ok(())
    }

    async fn prepare_leadership(&self) -> ClusterResult<()> {
        Ok(())
    }

    async fn clear_state(&self) -> ClusterResult<()> {
        let gate = lock(&self.clear_state_gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// fake remote participants
// ---------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct JobManagerRecorder {
    pub heartbeats: Arc<Mutex<Vec<String>>>,
    pub disconnects: Arc<Mutex<Vec<(String, String)>>>,
    pub allocation_failures: Arc<Mutex<Vec<(String, String)>>>,
}

struct FakeJobManager {
    recorder: JobManagerRecorder,
}

#[tonic::async_trait]
impl jm_gen::job_manager_service_server::JobManagerService for FakeJobManager {
    async fn heartbeat_from_resource_manager(
        &self,
        request: Request<jm_gen::JobManagerHeartbeatRequest>,
    ) -> Result<Response<jm_gen::JobManagerHeartbeatResponse>, Status> {
        let request = request.into_inner();
        lock(&self.recorder.heartbeats).push(request.resource_manager_resource_id);
        Ok(Response::new(jm_gen::JobManagerHeartbeatResponse {}))
    }

    async fn disconnect_resource_manager(
        &self,
        request: Request<jm_gen::DisconnectResourceManagerRequest>,
    ) -> Result<Response<jm_gen::DisconnectResourceManagerResponse>, Status> {
        let request = request.into_inner();
        lock(&self.recorder.disconnects).push((request.resource_manager_id, request.cause));
        Ok(Response::new(jm_gen::DisconnectResourceManagerResponse {}))
    }

    async fn notify_allocation_failure(
        &self,
        request: Request<jm_gen::NotifyAllocationFailureRequest>,
    ) -> Result<Response<jm_gen::NotifyAllocationFailureResponse>, Status> {
        let request = request.into_inner();
        lock(&self.recorder.allocation_failures).push((request.allocation_id, request.cause));
        Ok(Response::new(jm_gen::NotifyAllocationFailureResponse {}))
    }
}

pub async fn spawn_job_manager() -> (String, JobManagerRecorder) {
    let recorder = JobManagerRecorder::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let service = jm_gen::job_manager_service_server::JobManagerServiceServer::new(FakeJobManager {
        recorder: recorder.clone(),
    });
    tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpIncoming::from(listener))
            .await;
    });
    (address, recorder)
}

#[derive(Clone, Default)]
pub struct TaskExecutorRecorder {
    pub heartbeats: Arc<Mutex<Vec<String>>>,
    pub disconnects: Arc<Mutex<Vec<String>>>,
}

struct FakeTaskExecutor {
    recorder: TaskExecutorRecorder,
    metric_address: Option<String>,
}

#[tonic::async_trait]
impl te_gen::task_executor_service_server::TaskExecutorService for FakeTaskExecutor {
    async fn heartbeat_from_resource_manager(
        &self,
        request: Request<te_gen::TaskExecutorHeartbeatRequest>,
    ) -> Result<Response<te_gen::TaskExecutorHeartbeatResponse>, Status> {
        let request = request.into_inner();
        lock(&self.recorder.heartbeats).push(request.resource_manager_resource_id);
        Ok(Response::new(te_gen::TaskExecutorHeartbeatResponse {}))
    }

    async fn disconnect_resource_manager(
        &self,
        request: Request<te_gen::DisconnectResourceManagerRequest>,
    ) -> Result<Response<te_gen::DisconnectResourceManagerResponse>, Status> {
        let request = request.into_inner();
        lock(&self.recorder.disconnects).push(request.cause);
        Ok(Response::new(te_gen::DisconnectResourceManagerResponse {}))
    }

    async fn get_metric_query_service_address(
        &self,
        _request: Request<te_gen::GetMetricQueryServiceAddressRequest>,
    ) -> Result<Response<te_gen::GetMetricQueryServiceAddressResponse>, Status> {
        Ok(Response::new(te_gen::GetMetricQueryServiceAddressResponse {
            address: self.metric_address.clone(),
        }))
    }

    async fn request_file_upload(
        &self,
        request: Request<te_gen::RequestFileUploadRequest>,
    ) -> Result<Response<te_gen::RequestFileUploadResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(te_gen::RequestFileUploadResponse {
            blob_key: format!("blob-{}", request.file_type),
        }))
    }
}

pub async fn spawn_task_executor(
    metric_address: Option<String>,
) -> (String, TaskExecutorRecorder) {
    let recorder = TaskExecutorRecorder::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let service =
        te_gen::task_executor_service_server::TaskExecutorServiceServer::new(FakeTaskExecutor {
            recorder: recorder.clone(),
            metric_address,
        });
    tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpIncoming::from(listener))
            .await;
    });
    (address, recorder)
}

// ---------------------------------------------------------------------
// resource manager test cluster
// ---------------------------------------------------------------------

pub struct RecordingFatalErrorHandler {
    pub errors: Arc<Mutex<Vec<String>>>,
}

impl FatalErrorHandler for RecordingFatalErrorHandler {
    fn on_fatal_error(&self, error: &ClusterError) {
        lock(&self.errors).push(error.to_string());
    }
}

/// A leader election service that never grants leadership.
pub struct NoopElection;

#[tonic::async_trait]
impl LeaderElection for NoopElection {
    async fn start(
        &self,
        _listener: mpsc::UnboundedSender<LeadershipEvent>,
    ) -> ClusterResult<()> {
        Ok(())
    }

    async fn stop(&self) -> ClusterResult<()> {
        Ok(())
    }

    async fn confirm_leadership(&self, _session: Uuid, _address: String) -> ClusterResult<()> {
        Ok(())
    }

    fn has_leadership(&self, _session: Uuid) -> bool {
        false
    }
}

pub struct TestClusterBuilder {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub retry: RetryStrategy,
    pub script: SlotManagerScript,
    pub clear_state_gate: Option<Arc<Notify>>,
    pub follower_only: bool,
}

impl Default for TestClusterBuilder {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(50),
            retry: RetryStrategy::Fixed {
                max_count: 0,
                delay: Duration::from_millis(10),
            },
            script: SlotManagerScript::default(),
            clear_state_gate: None,
            follower_only: false,
        }
    }
}

pub struct TestCluster {
    pub runner: ResourceManagerRunner,
    pub ha: Arc<StandaloneHaServices>,
    pub backend: Arc<TestBackend>,
    pub slot_calls: Arc<Mutex<SlotManagerCalls>>,
    pub fatal_errors: Arc<Mutex<Vec<String>>>,
    pub address: Option<String>,
    pub client: Option<ResourceManagerServiceClient<Channel>>,
    pub token: Option<ResourceManagerId>,
}

impl TestClusterBuilder {
    pub async fn start(self) -> TestCluster {
        let _ = env_logger::builder().is_test(true).try_init();

        let ha = Arc::new(StandaloneHaServices::new());
        let backend = Arc::new(TestBackend::new());
        *lock(&backend.clear_state_gate) = self.clear_state_gate.clone();
        let slot_calls = Arc::new(Mutex::new(SlotManagerCalls::default()));
        let fatal_errors = Arc::new(Mutex::new(Vec::new()));

        let leader_election: Arc<dyn LeaderElection> = if self.follower_only {
            Arc::new(NoopElection)
        } else {
            ha.clone()
        };
        let services = ResourceManagerServices {
            leader_election,
            job_leader_retrieval: ha.clone(),
            slot_manager: Box::new(RecordingSlotManager::new(slot_calls.clone(), self.script)),
            backend: backend.clone(),
            fatal_error_handler: Arc::new(RecordingFatalErrorHandler {
                errors: fatal_errors.clone(),
            }),
        };
        let config = ResourceManagerConfig {
            enable_tls: false,
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            external_host: "127.0.0.1".to_string(),
            external_port: 0,
            resource_id: ResourceId::from("rm-test"),
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            job_leader_id_timeout: Duration::from_secs(60),
            rpc_retry_strategy: self.retry,
            cluster_information: ClusterInformation {
                blob_server_host: "127.0.0.1".to_string(),
                blob_server_port: 6124,
            },
        };
        let runner = ResourceManagerRunner::new(ResourceManagerOptions { config, services });

        let mut cluster = TestCluster {
            runner,
            ha,
            backend,
            slot_calls,
            fatal_errors,
            address: None,
            client: None,
            token: None,
        };
        if !self.follower_only {
            cluster.wait_for_leadership().await;
        }
        cluster
    }
}

impl TestCluster {
    /// Wait until the resource manager has confirmed leadership and
    /// refresh the client and fencing token.
    pub async fn wait_for_leadership(&mut self) {
        let ha = self.ha.clone();
        let mut address = None;
        for _ in 0..400 {
            if let Some(x) = ha.confirmed_leader_address() {
                address = Some(x);
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let address = address.expect("timed out waiting for leadership confirmation");
        let client = ResourceManagerServiceClient::connect(format!("http://{address}"))
            .await
            .expect("failed to connect to the resource manager");
        let session = ha.current_session().expect("no leadership session");
        self.token = Some(ResourceManagerId::from(session));
        self.client = Some(client);
        self.address = Some(address);
    }

    pub fn client(&self) -> ResourceManagerServiceClient<Channel> {
        self.client.clone().expect("the cluster has no leader")
    }

    pub fn token(&self) -> String {
        self.token.expect("the cluster has no leader").to_string()
    }
}

// ---------------------------------------------------------------------
// request helpers
// ---------------------------------------------------------------------

pub fn hardware() -> capstan_control::proto::capstan::common::HardwareDescription {
    capstan_control::proto::capstan::common::HardwareDescription {
        cpu_cores: 8,
        physical_memory: 16 << 30,
        available_memory: 8 << 30,
    }
}

pub fn slot_report(
    resource_id: &str,
    slot_count: u32,
) -> capstan_control::proto::capstan::common::SlotReport {
    let slots = (0..slot_count)
        .map(|slot_number| capstan_control::proto::capstan::common::SlotStatus {
            slot_id: Some(capstan_control::proto::capstan::common::SlotId {
                resource_id: resource_id.to_string(),
                slot_number,
            }),
            profile: Some(capstan_control::proto::capstan::common::ResourceProfile {
                cpu_cores: 1.0,
                memory_mb: 1024,
            }),
            allocation_id: None,
        })
        .collect();
    capstan_control::proto::capstan::common::SlotReport { slots }
}

pub fn profile() -> capstan_control::proto::capstan::common::ResourceProfile {
    capstan_control::proto::capstan::common::ResourceProfile {
        cpu_cores: 1.0,
        memory_mb: 1024,
    }
}

pub fn slot_request(
    job_id: &str,
    allocation_id: &str,
) -> capstan_control::proto::capstan::resource_manager::SlotRequest {
    capstan_control::proto::capstan::resource_manager::SlotRequest {
        job_id: job_id.to_string(),
        allocation_id: allocation_id.to_string(),
        profile: Some(profile()),
        target_address: None,
    }
}
