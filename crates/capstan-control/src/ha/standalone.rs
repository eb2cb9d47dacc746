use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use log::debug;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::ClusterResult;
use crate::ha::{JobLeaderRetrieval, LeaderElection, LeadershipEvent};
use crate::id::{JobId, JobMasterId};

#[derive(Default)]
struct StandaloneHaState {
    listener: Option<mpsc::UnboundedSender<LeadershipEvent>>,
    session: Option<Uuid>,
    confirmed_address: Option<String>,
    job_leaders: HashMap<JobId, watch::Sender<Option<JobMasterId>>>,
}

/// High-availability services for a cluster without an external coordination
/// service. There is exactly one resource manager, which is granted
/// leadership as soon as it registers; job master leaders are published
/// in process via [StandaloneHaServices::publish_job_leader].
#[derive(Default)]
pub struct StandaloneHaServices {
    state: Mutex<StandaloneHaState>,
}

impl StandaloneHaServices {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StandaloneHaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the leading job master of a job, or `None` when the job
    /// currently has no leader.
    pub fn publish_job_leader(&self, job_id: &JobId, leader: Option<JobMasterId>) {
        let mut state = self.lock();
        let sender = state
            .job_leaders
            .entry(job_id.clone())
            .or_insert_with(|| watch::channel(None).0);
        let _ = sender.send(leader);
    }

    /// The address the current leader confirmed, if any.
    pub fn confirmed_leader_address(&self) -> Option<String> {
        self.lock().confirmed_address.clone()
    }

    /// The current leadership session, if one has been granted.
    pub fn current_session(&self) -> Option<Uuid> {
        self.lock().session
    }

    /// Grant a fresh leadership session to the registered contender.
    /// Mostly useful to hand leadership back after [StandaloneHaServices::revoke_leadership].
    pub fn grant_leadership(&self) -> Option<Uuid> {
        let mut state = self.lock();
        let session = Uuid::new_v4();
        state.session = Some(session);
        state.confirmed_address = None;
        if let Some(listener) = &state.listener {
            let _ = listener.send(LeadershipEvent::Granted { session });
            Some(session)
        } else {
            None
        }
    }

    /// Revoke the current leadership session.
    pub fn revoke_leadership(&self) {
        let mut state = self.lock();
        state.session = None;
        state.confirmed_address = None;
        if let Some(listener) = &state.listener {
            let _ = listener.send(LeadershipEvent::Revoked);
        }
    }
}

#[tonic::async_trait]
impl LeaderElection for StandaloneHaServices {
    async fn start(&self, listener: mpsc::UnboundedSender<LeadershipEvent>) -> ClusterResult<()> {
        let session = Uuid::new_v4();
        let mut state = self.lock();
        state.listener = Some(listener.clone());
        state.session = Some(session);
        let _ = listener.send(LeadershipEvent::Granted { session });
        Ok(())
    }

    async fn stop(&self) -> ClusterResult<()> {
        let mut state = self.lock();
        state.listener = None;
        state.session = None;
        state.confirmed_address = None;
        Ok(())
    }

    async fn confirm_leadership(&self, session: Uuid, address: String) -> ClusterResult<()> {
        let mut state = self.lock();
        if state.session == Some(session) {
            debug!("leader confirmed at {address} for session {session}");
            state.confirmed_address = Some(address);
        } else {
            debug!("ignoring leadership confirmation for stale session {session}");
        }
        Ok(())
    }

    fn has_leadership(&self, session: Uuid) -> bool {
        self.lock().session == Some(session)
    }
}

impl JobLeaderRetrieval for StandaloneHaServices {
    fn job_leader_updates(&self, job_id: &JobId) -> watch::Receiver<Option<JobMasterId>> {
        let mut state = self.lock();
        state
            .job_leaders
            .entry(job_id.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_leadership_granted_on_start() {
        let services = StandaloneHaServices::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        services.start(tx).await.unwrap();
        let event = rx.recv().await.unwrap();
        let session = match event {
            LeadershipEvent::Granted { session } => session,
            _ => panic!("expected leadership grant"),
        };
        assert!(services.has_leadership(session));

        services
            .confirm_leadership(session, "127.0.0.1:6123".to_string())
            .await
            .unwrap();
        assert_eq!(
            services.confirmed_leader_address(),
            Some("127.0.0.1:6123".to_string())
        );

        services.revoke_leadership();
        assert!(!services.has_leadership(session));
        assert!(matches!(rx.recv().await, Some(LeadershipEvent::Revoked)));
    }

    #[tokio::test]
    async fn test_job_leader_updates() {
        let services = StandaloneHaServices::new();
        let job_id = JobId::from("job-1");
        let mut updates = services.job_leader_updates(&job_id);
        assert_eq!(*updates.borrow(), None);

        let leader = JobMasterId::random();
        services.publish_job_leader(&job_id, Some(leader));
        updates.changed().await.unwrap();
        assert_eq!(*updates.borrow(), Some(leader));
    }
}
