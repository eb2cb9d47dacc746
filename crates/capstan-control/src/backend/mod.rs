mod standalone;

pub use standalone::StandaloneBackend;

use crate::error::ClusterResult;
use crate::id::ResourceId;
use crate::proto::capstan::common as gen;
use crate::slots::ResourceProfile;

/// The final status of the cluster application, reported when the
/// application deregisters itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationStatus {
    Succeeded,
    Failed,
    Canceled,
    Unknown,
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplicationStatus::Succeeded => write!(f, "SUCCEEDED"),
            ApplicationStatus::Failed => write!(f, "FAILED"),
            ApplicationStatus::Canceled => write!(f, "CANCELED"),
            ApplicationStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl From<gen::ApplicationStatus> for ApplicationStatus {
    fn from(value: gen::ApplicationStatus) -> Self {
        match value {
            gen::ApplicationStatus::Succeeded => Self::Succeeded,
            gen::ApplicationStatus::Failed => Self::Failed,
            gen::ApplicationStatus::Canceled => Self::Canceled,
            gen::ApplicationStatus::Unknown | gen::ApplicationStatus::Unspecified => Self::Unknown,
        }
    }
}

impl From<ApplicationStatus> for gen::ApplicationStatus {
    fn from(value: ApplicationStatus) -> Self {
        match value {
            ApplicationStatus::Succeeded => Self::Succeeded,
            ApplicationStatus::Failed => Self::Failed,
            ApplicationStatus::Canceled => Self::Canceled,
            ApplicationStatus::Unknown => Self::Unknown,
        }
    }
}

/// A handle to a physical worker known to the framework backend.
pub trait WorkerNode: Send + Sync + std::fmt::Debug {
    fn resource_id(&self) -> &ResourceId;
}

/// The framework-specific side of worker lifecycle management.
///
/// The resource manager core drives registration, liveness and slot
/// arbitration; the backend knows how to start and stop physical workers
/// in a particular environment (standalone processes, a container
/// orchestrator, a cloud scheduler).
#[tonic::async_trait]
pub trait ClusterBackend: Send + Sync + 'static {
    /// Initialize framework-specific services. Called once before the
    /// resource manager takes part in leader election; failure is fatal.
    async fn initialize(&self) -> ClusterResult<()>;

    /// Provision a new worker able to host slots with the given profile.
    /// Returns the slot profiles the worker will advertise, or an empty
    /// collection when provisioning was refused. The worker announces
    /// itself later through an ordinary registration RPC.
    async fn start_new_worker(&self, profile: &ResourceProfile) -> ClusterResult<Vec<ResourceProfile>>;

    /// Resolve the worker behind a registering task executor, or `None`
    /// when the framework does not recognize it. Returning `None` rejects
    /// task executors that were not launched through this backend.
    fn worker_started(&self, resource_id: &ResourceId) -> Option<Box<dyn WorkerNode>>;

    /// Stop the given worker. Returns whether the worker was stopped.
    fn stop_worker(&self, worker: &dyn WorkerNode) -> bool;

    /// Report the final application status and release framework resources,
    /// including workers that were provisioned but never registered.
    async fn deregister_application(
        &self,
        status: ApplicationStatus,
        diagnostics: Option<String>,
    ) -> ClusterResult<()>;

    /// A non-blocking routine run after leadership is granted but before
    /// it is confirmed to the election service.
    async fn prepare_leadership(&self) -> ClusterResult<()>;

    /// A non-blocking state-clearing routine run when leadership is
    /// revoked. The next leadership grant waits for its completion.
    async fn clear_state(&self) -> ClusterResult<()>;
}
