//! Leader election
//!
//! Exactly one replica runs the background loops. Each process generates a
//! random worker id and competes for the `background_task_leader` lock
//! (60 s TTL); the winner renews every 30 s and demotes itself the moment
//! a renewal fails. Followers keep trying so a dead leader is replaced
//! within one TTL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::coordination::Coordination;

pub const LEADER_RESOURCE: &str = "background_task_leader";
pub const LEADER_TTL: Duration = Duration::from_secs(60);
pub const RENEW_INTERVAL: Duration = Duration::from_secs(30);

pub struct LeaderElection {
    coordination: Arc<Coordination>,
    worker_id: String,
    is_leader: AtomicBool,
}

impl LeaderElection {
    pub fn new(coordination: Arc<Coordination>) -> Self {
        let worker_id: String = Uuid::new_v4().to_string().chars().take(8).collect();
        Self {
            coordination,
            worker_id,
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Compete for leadership. A second attempt after a short wait covers
    /// the case where a crashed leader's lock is about to expire.
    pub async fn try_acquire(&self) -> bool {
        let acquired = self
            .coordination
            .acquire_lock(LEADER_RESOURCE, &self.worker_id, LEADER_TTL)
            .await;
        if acquired {
            self.is_leader.store(true, Ordering::SeqCst);
            tracing::info!(worker = %self.worker_id, "this replica is the LEADER");
            return true;
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        let acquired = self
            .coordination
            .acquire_lock(LEADER_RESOURCE, &self.worker_id, LEADER_TTL)
            .await;
        self.is_leader.store(acquired, Ordering::SeqCst);
        if acquired {
            tracing::info!(worker = %self.worker_id, "this replica is the LEADER");
        } else {
            tracing::info!(worker = %self.worker_id, "this replica is a follower");
        }
        acquired
    }

    /// Renew the lease once. Returns false (and demotes) when the lock
    /// could not be re-acquired.
    pub async fn renew(&self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let renewed = self
            .coordination
            .acquire_lock(LEADER_RESOURCE, &self.worker_id, LEADER_TTL)
            .await;
        if !renewed {
            tracing::warn!(worker = %self.worker_id, "lost leadership, demoting");
            self.is_leader.store(false, Ordering::SeqCst);
        }
        renewed
    }

    /// Renewal loop for the elected leader; exits on demotion. Spawn it
    /// and abort the handle on shutdown.
    pub async fn run_renewal(self: Arc<Self>) {
        let mut interval = tokio::time::interval(RENEW_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // first tick resolves immediately
        loop {
            interval.tick().await;
            if !self.renew().await {
                break;
            }
        }
    }

    /// Follower loop: keep competing until elected.
    pub async fn run_campaign(self: Arc<Self>) {
        let mut interval = tokio::time::interval(RENEW_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.is_leader() || self.try_acquire().await {
                break;
            }
        }
    }

    /// Graceful shutdown: release the lock so a standby can take over
    /// immediately instead of waiting out the TTL.
    pub async fn resign(&self) {
        if self.is_leader.swap(false, Ordering::SeqCst) {
            self.coordination
                .release_lock(LEADER_RESOURCE, &self.worker_id)
                .await;
            tracing::info!(worker = %self.worker_id, "leadership released");
        }
    }
}
