use std::collections::HashMap;

use log::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::id::{AllocationId, InstanceId, ResourceId, ResourceManagerId, SlotId};
use crate::slots::{ResourceActions, ResourceProfile, SlotManager, SlotReport, SlotRequest};

#[derive(Debug)]
struct SlotEntry {
    profile: ResourceProfile,
    allocation_id: Option<AllocationId>,
}

#[derive(Debug)]
struct TaskManagerSlots {
    resource_id: ResourceId,
    slots: HashMap<SlotId, SlotEntry>,
}

/// A slot manager with a first-fit matching policy and no queuing limits.
/// It keeps the supply side (slots reported by task managers) and the demand
/// side (slot requests from job managers) and matches them greedily as
/// either side changes.
#[derive(Debug, Default)]
pub struct DefaultSlotManager {
    leader_id: Option<ResourceManagerId>,
    task_managers: HashMap<InstanceId, TaskManagerSlots>,
    pending_requests: Vec<SlotRequest>,
}

impl DefaultSlotManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn assign_pending_requests(&mut self) {
        let mut remaining = Vec::with_capacity(self.pending_requests.len());
        let requests = std::mem::take(&mut self.pending_requests);
        for request in requests {
            if !Self::try_assign(&mut self.task_managers, &request) {
                remaining.push(request);
            }
        }
        self.pending_requests = remaining;
    }

    fn try_assign(
        task_managers: &mut HashMap<InstanceId, TaskManagerSlots>,
        request: &SlotRequest,
    ) -> bool {
        for task_manager in task_managers.values_mut() {
            for (slot_id, entry) in task_manager.slots.iter_mut() {
                if entry.allocation_id.is_none() && entry.profile.is_matching(&request.profile) {
                    debug!(
                        "assigning slot {slot_id} to allocation {} for job {}",
                        request.allocation_id, request.job_id
                    );
                    entry.allocation_id = Some(request.allocation_id.clone());
                    return true;
                }
            }
        }
        false
    }

    fn is_known_allocation(&self, allocation_id: &AllocationId) -> bool {
        self.pending_requests
            .iter()
            .any(|request| &request.allocation_id == allocation_id)
            || self.task_managers.values().any(|task_manager| {
                task_manager
                    .slots
                    .values()
                    .any(|entry| entry.allocation_id.as_ref() == Some(allocation_id))
            })
    }
}

impl SlotManager for DefaultSlotManager {
    fn start(&mut self, leader_id: ResourceManagerId) {
        info!("starting the slot manager with leader session {leader_id}");
        self.leader_id = Some(leader_id);
    }

    fn suspend(&mut self) {
        info!("suspending the slot manager");
        self.leader_id = None;
        self.task_managers.clear();
        self.pending_requests.clear();
    }

    fn close(&mut self) -> ClusterResult<()> {
        self.suspend();
        Ok(())
    }

    fn register_task_manager(
        &mut self,
        instance_id: InstanceId,
        resource_id: &ResourceId,
        report: SlotReport,
        _actions: &mut dyn ResourceActions,
    ) {
        let slots = report
            .slots
            .into_iter()
            .map(|status| {
                (
                    status.slot_id,
                    SlotEntry {
                        profile: status.profile,
                        allocation_id: status.allocation_id,
                    },
                )
            })
            .collect();
        self.task_managers.insert(
            instance_id,
            TaskManagerSlots {
                resource_id: resource_id.clone(),
                slots,
            },
        );
        self.assign_pending_requests();
    }

    fn unregister_task_manager(&mut self, instance_id: InstanceId, cause: &str) -> bool {
        match self.task_managers.remove(&instance_id) {
            Some(task_manager) => {
                info!(
                    "unregistering task manager {} with instance ID {instance_id}: {cause}",
                    task_manager.resource_id
                );
                // Allocations that lived on the removed slots are gone;
                // job managers re-request slots when they observe the loss.
                true
            }
            None => {
                debug!("no task manager with instance ID {instance_id} to unregister");
                false
            }
        }
    }

    fn register_slot_request(
        &mut self,
        request: SlotRequest,
        actions: &mut dyn ResourceActions,
    ) -> ClusterResult<()> {
        if self.leader_id.is_none() {
            return Err(ClusterError::SlotRequestFailure(
                "the slot manager has not been started".to_string(),
            ));
        }
        if self.is_known_allocation(&request.allocation_id) {
            return Err(ClusterError::SlotRequestFailure(format!(
                "duplicate allocation ID {}",
                request.allocation_id
            )));
        }
        if !Self::try_assign(&mut self.task_managers, &request) {
            debug!(
                "no free slot for allocation {} with profile {}; requesting a new worker",
                request.allocation_id, request.profile
            );
            actions.allocate_resource(request.profile);
            self.pending_requests.push(request);
        }
        Ok(())
    }

    fn unregister_slot_request(&mut self, allocation_id: &AllocationId) {
        self.pending_requests
            .retain(|request| &request.allocation_id != allocation_id);
        for task_manager in self.task_managers.values_mut() {
            for entry in task_manager.slots.values_mut() {
                if entry.allocation_id.as_ref() == Some(allocation_id) {
                    entry.allocation_id = None;
                }
            }
        }
        self.assign_pending_requests();
    }

    fn free_slot(
        &mut self,
        slot_id: &SlotId,
        allocation_id: &AllocationId,
        _actions: &mut dyn ResourceActions,
    ) {
        for task_manager in self.task_managers.values_mut() {
            if let Some(entry) = task_manager.slots.get_mut(slot_id) {
                if entry.allocation_id.as_ref() == Some(allocation_id) {
                    entry.allocation_id = None;
                } else {
                    warn!(
                        "cannot free slot {slot_id}: it is not allocated to {allocation_id}"
                    );
                }
                break;
            }
        }
        self.assign_pending_requests();
    }

    fn report_slot_status(&mut self, instance_id: InstanceId, report: SlotReport) {
        let Some(task_manager) = self.task_managers.get_mut(&instance_id) else {
            debug!("ignoring slot report from unknown instance ID {instance_id}");
            return;
        };
        for status in report.slots {
            let entry = task_manager
                .slots
                .entry(status.slot_id)
                .or_insert(SlotEntry {
                    profile: status.profile,
                    allocation_id: None,
                });
            entry.profile = status.profile;
            // An empty allocation in the report does not clear a local
            // assignment, since the task executor may not have observed
            // an in-flight allocation yet.
            if status.allocation_id.is_some() {
                entry.allocation_id = status.allocation_id;
            }
        }
        self.assign_pending_requests();
    }

    fn registered_slot_count(&self) -> usize {
        self.task_managers
            .values()
            .map(|task_manager| task_manager.slots.len())
            .sum()
    }

    fn free_slot_count(&self) -> usize {
        self.task_managers
            .values()
            .flat_map(|task_manager| task_manager.slots.values())
            .filter(|entry| entry.allocation_id.is_none())
            .count()
    }

    fn registered_slot_count_of(&self, instance_id: InstanceId) -> usize {
        self.task_managers
            .get(&instance_id)
            .map(|task_manager| task_manager.slots.len())
            .unwrap_or(0)
    }

    fn free_slot_count_of(&self, instance_id: InstanceId) -> usize {
        self.task_managers
            .get(&instance_id)
            .map(|task_manager| {
                task_manager
                    .slots
                    .values()
                    .filter(|entry| entry.allocation_id.is_none())
                    .count()
            })
            .unwrap_or(0)
    }
}
