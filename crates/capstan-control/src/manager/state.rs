use std::collections::HashMap;

use log::warn;

use crate::backend::WorkerNode;
use crate::error::ClusterResult;
use crate::id::{IdGenerator, InstanceId, JobId, JobMasterId, ResourceId};
use crate::job_manager::JobManagerClient;
use crate::proto::capstan::common as gen;
use crate::task_executor::TaskExecutorClient;

/// The registration of one job manager, indexed both by its job and by the
/// resource ID of the job manager process.
#[derive(Debug)]
pub struct JobManagerRegistration {
    pub job_id: JobId,
    pub job_manager_resource_id: ResourceId,
    pub job_master_id: JobMasterId,
    pub client: JobManagerClient,
}

/// The registration of one task executor together with the
/// framework-specific worker behind it.
#[derive(Debug)]
pub struct WorkerRegistration {
    pub instance_id: InstanceId,
    pub client: TaskExecutorClient,
    pub worker: Box<dyn WorkerNode>,
    pub address: String,
    pub data_port: u16,
    pub hardware: HardwareDescription,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareDescription {
    pub cpu_cores: u32,
    pub physical_memory: u64,
    pub available_memory: u64,
}

impl From<gen::HardwareDescription> for HardwareDescription {
    fn from(value: gen::HardwareDescription) -> Self {
        Self {
            cpu_cores: value.cpu_cores,
            physical_memory: value.physical_memory,
            available_memory: value.available_memory,
        }
    }
}

impl From<HardwareDescription> for gen::HardwareDescription {
    fn from(value: HardwareDescription) -> Self {
        Self {
            cpu_cores: value.cpu_cores,
            physical_memory: value.physical_memory,
            available_memory: value.available_memory,
        }
    }
}

/// A read-only view of one registered task manager.
#[derive(Debug, Clone)]
pub struct TaskManagerInfo {
    pub resource_id: ResourceId,
    pub address: String,
    pub data_port: u16,
    pub last_heartbeat_ms: u64,
    pub slot_count: usize,
    pub free_slot_count: usize,
    pub hardware: HardwareDescription,
}

/// Cluster-wide resource totals.
#[derive(Debug, Clone, Copy)]
pub struct ResourceOverview {
    pub task_manager_count: usize,
    pub slot_count: usize,
    pub free_slot_count: usize,
}

/// The registration tables of the resource manager. All mutation happens
/// on the resource manager event loop.
pub struct ResourceManagerState {
    /// All currently registered job managers scoped by job ID.
    jobs: HashMap<JobId, JobManagerRegistration>,
    /// The job served by each registered job manager process.
    job_resources: HashMap<ResourceId, JobId>,
    /// All currently registered task executors.
    task_executors: HashMap<ResourceId, WorkerRegistration>,
    /// The latest registration attempt per task executor. A completed
    /// connection whose attempt number is not the stored one has been
    /// superseded by a newer registration.
    pending_task_executors: HashMap<ResourceId, u64>,
    registration_attempts: u64,
    instance_id_generator: IdGenerator<InstanceId>,
}

impl Default for ResourceManagerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManagerState {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            job_resources: HashMap::new(),
            task_executors: HashMap::new(),
            pending_task_executors: HashMap::new(),
            registration_attempts: 0,
            instance_id_generator: IdGenerator::new(),
        }
    }

    pub fn insert_job_manager(&mut self, registration: JobManagerRegistration) {
        self.job_resources.insert(
            registration.job_manager_resource_id.clone(),
            registration.job_id.clone(),
        );
        self.jobs.insert(registration.job_id.clone(), registration);
    }

    pub fn get_job_manager(&self, job_id: &JobId) -> Option<&JobManagerRegistration> {
        self.jobs.get(job_id)
    }

    pub fn get_job_manager_by_resource(
        &self,
        resource_id: &ResourceId,
    ) -> Option<&JobManagerRegistration> {
        let job_id = self.job_resources.get(resource_id)?;
        self.jobs.get(job_id)
    }

    pub fn remove_job_manager(&mut self, job_id: &JobId) -> Option<JobManagerRegistration> {
        let registration = self.jobs.remove(job_id)?;
        self.job_resources
            .remove(&registration.job_manager_resource_id);
        Some(registration)
    }

    pub fn list_job_managers(&self) -> impl Iterator<Item = &JobManagerRegistration> {
        self.jobs.values()
    }

    pub fn insert_task_executor(
        &mut self,
        resource_id: ResourceId,
        registration: WorkerRegistration,
    ) {
        self.task_executors.insert(resource_id, registration);
    }

    pub fn get_task_executor(&self, resource_id: &ResourceId) -> Option<&WorkerRegistration> {
        self.task_executors.get(resource_id)
    }

    pub fn remove_task_executor(&mut self, resource_id: &ResourceId) -> Option<WorkerRegistration> {
        self.task_executors.remove(resource_id)
    }

    pub fn find_task_executor_by_instance(
        &self,
        instance_id: InstanceId,
    ) -> Option<(&ResourceId, &WorkerRegistration)> {
        // TODO: maintain an InstanceId index if clusters grow to the point
        // where the linear scan shows up in profiles
        self.task_executors
            .iter()
            .find(|(_, registration)| registration.instance_id == instance_id)
    }

    pub fn list_task_executors(&self) -> impl Iterator<Item = (&ResourceId, &WorkerRegistration)> {
        self.task_executors.iter()
    }

    pub fn task_executor_count(&self) -> usize {
        self.task_executors.len()
    }

    pub fn next_instance_id(&mut self) -> ClusterResult<InstanceId> {
        self.instance_id_generator.next()
    }

    /// Record the start of a task executor registration attempt and return
    /// its attempt number.
    pub fn begin_task_executor_registration(&mut self, resource_id: ResourceId) -> u64 {
        self.registration_attempts += 1;
        let attempt = self.registration_attempts;
        self.pending_task_executors.insert(resource_id, attempt);
        attempt
    }

    /// Whether the completed attempt is still the current one for the
    /// resource ID. The pending entry is consumed when it matches.
    pub fn finish_task_executor_registration(
        &mut self,
        resource_id: &ResourceId,
        attempt: u64,
    ) -> bool {
        if self.pending_task_executors.get(resource_id) == Some(&attempt) {
            self.pending_task_executors.remove(resource_id);
            true
        } else {
            warn!("ignoring outdated registration attempt {attempt} for {resource_id}");
            false
        }
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
        self.job_resources.clear();
        self.task_executors.clear();
        self.pending_task_executors.clear();
    }
}
