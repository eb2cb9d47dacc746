mod standalone;

pub use standalone::StandaloneHaServices;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::ClusterResult;
use crate::id::{JobId, JobMasterId};

/// A leadership change reported by the leader election service.
#[derive(Debug, Clone)]
pub enum LeadershipEvent {
    Granted { session: Uuid },
    Revoked,
    Error { message: String },
}

/// The leader election side of the high-availability services.
///
/// The resource manager registers itself as a contender via
/// [LeaderElection::start] and receives leadership changes on the listener
/// channel. A granted session must be confirmed back once the contender has
/// started its leader services; until then other participants must not
/// observe the new leader.
#[tonic::async_trait]
pub trait LeaderElection: Send + Sync + 'static {
    async fn start(&self, listener: mpsc::UnboundedSender<LeadershipEvent>) -> ClusterResult<()>;

    async fn stop(&self) -> ClusterResult<()>;

    async fn confirm_leadership(&self, session: Uuid, address: String) -> ClusterResult<()>;

    /// Whether the contender still holds the leadership for the session.
    /// The answer may be outdated by the time it is observed; fencing
    /// tokens protect the RPC surface against such races.
    fn has_leadership(&self, session: Uuid) -> bool;
}

/// The job master leader discovery side of the high-availability services.
pub trait JobLeaderRetrieval: Send + Sync + 'static {
    /// Watch the leading job master of a job. The receiver holds the
    /// currently known leader and observes every change.
    fn job_leader_updates(&self, job_id: &JobId) -> watch::Receiver<Option<JobMasterId>>;
}
