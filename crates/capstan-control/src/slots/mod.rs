mod manager;

pub use manager::DefaultSlotManager;

use crate::error::{ClusterError, ClusterResult};
use crate::id::{AllocationId, InstanceId, JobId, ResourceId, ResourceManagerId, SlotId};
use crate::proto::capstan::common as gen;

/// A description of the resources offered by one slot or required by one
/// slot request. An all-zero profile matches any slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceProfile {
    pub cpu_cores: f64,
    pub memory_mb: u64,
}

impl ResourceProfile {
    pub const ANY: ResourceProfile = ResourceProfile {
        cpu_cores: 0.0,
        memory_mb: 0,
    };

    /// Whether a slot with this profile can host a request with the
    /// required profile.
    pub fn is_matching(&self, required: &ResourceProfile) -> bool {
        self.cpu_cores >= required.cpu_cores && self.memory_mb >= required.memory_mb
    }
}

impl std::fmt::Display for ResourceProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(cpu={}, memory={}MB)", self.cpu_cores, self.memory_mb)
    }
}

impl From<gen::ResourceProfile> for ResourceProfile {
    fn from(value: gen::ResourceProfile) -> Self {
        Self {
            cpu_cores: value.cpu_cores,
            memory_mb: value.memory_mb,
        }
    }
}

impl From<ResourceProfile> for gen::ResourceProfile {
    fn from(value: ResourceProfile) -> Self {
        Self {
            cpu_cores: value.cpu_cores,
            memory_mb: value.memory_mb,
        }
    }
}

/// The state of one slot as observed by its task executor.
#[derive(Debug, Clone)]
pub struct SlotStatus {
    pub slot_id: SlotId,
    pub profile: ResourceProfile,
    pub allocation_id: Option<AllocationId>,
}

/// A task executor's snapshot of all its slots and their allocations.
#[derive(Debug, Clone, Default)]
pub struct SlotReport {
    pub slots: Vec<SlotStatus>,
}

impl TryFrom<gen::SlotReport> for SlotReport {
    type Error = ClusterError;

    fn try_from(value: gen::SlotReport) -> ClusterResult<Self> {
        let slots = value
            .slots
            .into_iter()
            .map(|slot| {
                let slot_id = slot
                    .slot_id
                    .map(SlotId::from)
                    .ok_or_else(|| ClusterError::InvalidArgument("missing slot ID".to_string()))?;
                Ok(SlotStatus {
                    slot_id,
                    profile: slot
                        .profile
                        .map(ResourceProfile::from)
                        .unwrap_or(ResourceProfile::ANY),
                    allocation_id: slot.allocation_id.map(AllocationId::from),
                })
            })
            .collect::<ClusterResult<Vec<_>>>()?;
        Ok(Self { slots })
    }
}

impl From<SlotReport> for gen::SlotReport {
    fn from(value: SlotReport) -> Self {
        let slots = value
            .slots
            .into_iter()
            .map(|slot| gen::SlotStatus {
                slot_id: Some(slot.slot_id.into()),
                profile: Some(slot.profile.into()),
                allocation_id: slot.allocation_id.map(String::from),
            })
            .collect();
        Self { slots }
    }
}

/// A request for one slot, issued by the job manager of a job.
#[derive(Debug, Clone)]
pub struct SlotRequest {
    pub job_id: JobId,
    pub allocation_id: AllocationId,
    pub profile: ResourceProfile,
    /// The preferred task executor address, if any.
    pub target_address: Option<String>,
}

/// The callback surface the slot manager uses to ask the resource manager
/// for new workers, release existing ones, or signal allocation failures
/// back to job managers. Calls are buffered as commands on the resource
/// manager event loop, so the single-writer property is preserved.
pub trait ResourceActions {
    fn release_resource(&mut self, instance_id: InstanceId, cause: &str);
    fn allocate_resource(&mut self, profile: ResourceProfile);
    fn notify_allocation_failure(&mut self, job_id: JobId, allocation_id: AllocationId, cause: &str);
}

/// The table of slot supply and demand.
///
/// The slot manager is owned by the resource manager and every method is
/// invoked from the resource manager event loop, so implementations need no
/// internal synchronization. Methods that take a [ResourceActions] argument
/// may invoke any of its callbacks before returning.
pub trait SlotManager: Send + 'static {
    /// Start serving with the fencing token of the new leader session.
    fn start(&mut self, leader_id: ResourceManagerId);

    /// Stop serving and drop the supply and demand state. No new requests
    /// are accepted until the next [SlotManager::start].
    fn suspend(&mut self);

    /// Release all state on resource manager shutdown.
    fn close(&mut self) -> ClusterResult<()>;

    fn register_task_manager(
        &mut self,
        instance_id: InstanceId,
        resource_id: &ResourceId,
        report: SlotReport,
        actions: &mut dyn ResourceActions,
    );

    /// Returns whether a task manager with the given instance ID was known.
    fn unregister_task_manager(&mut self, instance_id: InstanceId, cause: &str) -> bool;

    fn register_slot_request(
        &mut self,
        request: SlotRequest,
        actions: &mut dyn ResourceActions,
    ) -> ClusterResult<()>;

    fn unregister_slot_request(&mut self, allocation_id: &AllocationId);

    fn free_slot(
        &mut self,
        slot_id: &SlotId,
        allocation_id: &AllocationId,
        actions: &mut dyn ResourceActions,
    );

    fn report_slot_status(&mut self, instance_id: InstanceId, report: SlotReport);

    fn registered_slot_count(&self) -> usize;

    fn free_slot_count(&self) -> usize;

    fn registered_slot_count_of(&self, instance_id: InstanceId) -> usize;

    fn free_slot_count_of(&self, instance_id: InstanceId) -> usize;
}
