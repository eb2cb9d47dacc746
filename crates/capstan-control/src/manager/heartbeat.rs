use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use crate::id::ResourceId;

#[derive(Debug)]
struct HeartbeatState {
    heartbeat_at: Instant,
    heartbeat_at_ms: u64,
}

/// Liveness bookkeeping for one participant kind.
///
/// The tracker itself keeps no timers; the resource manager schedules a
/// delayed probe event whenever a target is monitored or a heartbeat is
/// recorded, and the probe compares its captured instant against the
/// latest one recorded here. A target whose latest heartbeat is not newer
/// than the probed instant has timed out.
#[derive(Debug)]
pub struct HeartbeatTracker {
    timeout: Duration,
    targets: HashMap<ResourceId, HeartbeatState>,
}

impl HeartbeatTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            targets: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start monitoring a target and return the instant to probe against.
    /// Re-monitoring an existing target resets its heartbeat.
    pub fn monitor(&mut self, resource_id: ResourceId) -> Instant {
        let now = Instant::now();
        self.targets.insert(
            resource_id,
            HeartbeatState {
                heartbeat_at: now,
                heartbeat_at_ms: now_ms(),
            },
        );
        now
    }

    pub fn unmonitor(&mut self, resource_id: &ResourceId) {
        self.targets.remove(resource_id);
    }

    /// Record a heartbeat and return the instant to probe against,
    /// or `None` if the target is not monitored.
    pub fn record(&mut self, resource_id: &ResourceId) -> Option<Instant> {
        let state = self.targets.get_mut(resource_id)?;
        let now = Instant::now();
        state.heartbeat_at = now;
        state.heartbeat_at_ms = now_ms();
        Some(now)
    }

    /// Whether the target has not sent a heartbeat since the probed instant.
    /// Unmonitored targets never time out.
    pub fn is_timed_out(&self, resource_id: &ResourceId, probed: Instant) -> bool {
        self.targets
            .get(resource_id)
            .is_some_and(|state| state.heartbeat_at <= probed)
    }

    pub fn last_heartbeat_ms(&self, resource_id: &ResourceId) -> Option<u64> {
        self.targets
            .get(resource_id)
            .map(|state| state.heartbeat_at_ms)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|x| x.as_millis() as u64)
        .unwrap_or(0)
}
