use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::debug;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{ClusterError, ClusterResult};
use crate::ha::JobLeaderRetrieval;
use crate::id::{JobId, JobMasterId};

/// A notification from the job leader ID service, delivered to the
/// resource manager event loop.
#[derive(Debug)]
pub enum JobLeaderIdEvent {
    JobLeaderLostLeadership {
        job_id: JobId,
        old_job_master_id: JobMasterId,
    },
    JobTimeout {
        job_id: JobId,
        timeout_id: Uuid,
    },
}

struct JobLeaderIdListener {
    leader: watch::Receiver<Option<JobMasterId>>,
    /// The identity of the currently armed idle timeout. A timeout
    /// notification is only acted upon while its identity is still stored
    /// here; finding a leader clears it.
    timeout_id: Arc<Mutex<Option<Uuid>>>,
    task: JoinHandle<()>,
}

impl Drop for JobLeaderIdListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Tracks, for every job of interest, which job master replica currently
/// leads the job. Jobs without a leader for longer than the configured
/// timeout are reported so that the resource manager can drop them.
pub struct JobLeaderIdService {
    retrieval: Arc<dyn JobLeaderRetrieval>,
    job_timeout: Duration,
    events: Option<mpsc::UnboundedSender<JobLeaderIdEvent>>,
    jobs: HashMap<JobId, JobLeaderIdListener>,
}

impl JobLeaderIdService {
    pub fn new(retrieval: Arc<dyn JobLeaderRetrieval>, job_timeout: Duration) -> Self {
        Self {
            retrieval,
            job_timeout,
            events: None,
            jobs: HashMap::new(),
        }
    }

    pub fn start(&mut self, events: mpsc::UnboundedSender<JobLeaderIdEvent>) {
        self.events = Some(events);
    }

    pub fn stop(&mut self) -> ClusterResult<()> {
        self.clear()?;
        self.events = None;
        Ok(())
    }

    pub fn contains_job(&self, job_id: &JobId) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn add_job(&mut self, job_id: &JobId) -> ClusterResult<()> {
        let Some(events) = self.events.clone() else {
            return Err(ClusterError::InternalError(
                "the job leader ID service has not been started".to_string(),
            ));
        };
        if self.jobs.contains_key(job_id) {
            return Ok(());
        }
        debug!("tracking the leader ID for job {job_id}");
        let leader = self.retrieval.job_leader_updates(job_id);
        let timeout_id = Arc::new(Mutex::new(None));
        let task = tokio::spawn(run_job_leader_listener(
            job_id.clone(),
            leader.clone(),
            self.job_timeout,
            Arc::clone(&timeout_id),
            events,
        ));
        self.jobs.insert(
            job_id.clone(),
            JobLeaderIdListener {
                leader,
                timeout_id,
                task,
            },
        );
        Ok(())
    }

    pub fn remove_job(&mut self, job_id: &JobId) -> ClusterResult<()> {
        if self.jobs.remove(job_id).is_none() {
            return Err(ClusterError::InvalidArgument(format!(
                "job {job_id} is not tracked by the job leader ID service"
            )));
        }
        Ok(())
    }

    pub fn clear(&mut self) -> ClusterResult<()> {
        self.jobs.clear();
        Ok(())
    }

    pub fn is_valid_timeout(&self, job_id: &JobId, timeout_id: Uuid) -> bool {
        self.jobs.get(job_id).is_some_and(|listener| {
            *lock_timeout_id(&listener.timeout_id) == Some(timeout_id)
        })
    }

    /// A future that resolves to the leading job master ID for the job.
    /// The future may resolve long after this call if the job has no
    /// leader yet.
    pub fn get_leader_id(
        &self,
        job_id: &JobId,
    ) -> ClusterResult<impl Future<Output = ClusterResult<JobMasterId>> + Send + 'static> {
        let listener = self.jobs.get(job_id).ok_or_else(|| {
            ClusterError::InternalError(format!(
                "job {job_id} is not tracked by the job leader ID service"
            ))
        })?;
        let mut updates = listener.leader.clone();
        Ok(async move {
            let leader = updates.wait_for(|leader| leader.is_some()).await.map_err(|_| {
                ClusterError::InternalError("the job leader watch has been closed".to_string())
            })?;
            (*leader).ok_or_else(|| {
                ClusterError::InternalError("the job leader is unknown".to_string())
            })
        })
    }
}

fn lock_timeout_id(timeout_id: &Mutex<Option<Uuid>>) -> std::sync::MutexGuard<'_, Option<Uuid>> {
    timeout_id.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_job_leader_listener(
    job_id: JobId,
    mut updates: watch::Receiver<Option<JobMasterId>>,
    job_timeout: Duration,
    timeout_id: Arc<Mutex<Option<Uuid>>>,
    events: mpsc::UnboundedSender<JobLeaderIdEvent>,
) {
    let mut current = *updates.borrow_and_update();
    loop {
        if current.is_none() {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(job_timeout) => {
                    let id = Uuid::new_v4();
                    *lock_timeout_id(&timeout_id) = Some(id);
                    debug!("job {job_id} has had no leader for {job_timeout:?}");
                    if events
                        .send(JobLeaderIdEvent::JobTimeout {
                            job_id: job_id.clone(),
                            timeout_id: id,
                        })
                        .is_err()
                    {
                        break;
                    }
                    if updates.changed().await.is_err() {
                        break;
                    }
                }
            }
        } else if updates.changed().await.is_err() {
            break;
        }
        let new = *updates.borrow_and_update();
        if let Some(old) = current {
            if new != Some(old)
                && events
                    .send(JobLeaderIdEvent::JobLeaderLostLeadership {
                        job_id: job_id.clone(),
                        old_job_master_id: old,
                    })
                    .is_err()
            {
                break;
            }
        }
        if new.is_some() {
            *lock_timeout_id(&timeout_id) = None;
        }
        current = new;
    }
}
