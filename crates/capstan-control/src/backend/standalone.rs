use std::sync::{Mutex, PoisonError};

use log::{info, warn};

use crate::backend::{ApplicationStatus, ClusterBackend, WorkerNode};
use crate::error::ClusterResult;
use crate::id::ResourceId;
use crate::slots::ResourceProfile;

#[derive(Debug)]
struct StandaloneWorkerNode {
    resource_id: ResourceId,
}

impl WorkerNode for StandaloneWorkerNode {
    fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }
}

/// The backend for clusters whose task executors are launched externally
/// (for example by an init system). Every registering task executor is
/// accepted, and no workers can be provisioned on demand.
#[derive(Debug, Default)]
pub struct StandaloneBackend {
    final_status: Mutex<Option<ApplicationStatus>>,
}

impl StandaloneBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The final application status, once the application has deregistered.
    pub fn final_status(&self) -> Option<ApplicationStatus> {
        *self
            .final_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[tonic::async_trait]
impl ClusterBackend for StandaloneBackend {
    async fn initialize(&self) -> ClusterResult<()> {
        Ok(())
    }

    async fn start_new_worker(
        &self,
        profile: &ResourceProfile,
    ) -> ClusterResult<Vec<ResourceProfile>> {
        warn!("cannot start a worker with profile {profile} in a standalone cluster");
        Ok(vec![])
    }

    fn worker_started(&self, resource_id: &ResourceId) -> Option<Box<dyn WorkerNode>> {
        Some(Box::new(StandaloneWorkerNode {
            resource_id: resource_id.clone(),
        }))
    }

    fn stop_worker(&self, worker: &dyn WorkerNode) -> bool {
        // Externally launched workers cannot be stopped from here; the
        // release still proceeds so that the registration is dropped.
        info!("releasing externally managed worker {}", worker.resource_id());
        true
    }

    async fn deregister_application(
        &self,
        status: ApplicationStatus,
        diagnostics: Option<String>,
    ) -> ClusterResult<()> {
        info!(
            "standalone cluster deregistered with status {status}: {}",
            diagnostics.as_deref().unwrap_or("no diagnostics")
        );
        *self
            .final_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(status);
        Ok(())
    }

    async fn prepare_leadership(&self) -> ClusterResult<()> {
        Ok(())
    }

    async fn clear_state(&self) -> ClusterResult<()> {
        Ok(())
    }
}
