//! Background task watchdog
//!
//! Supervises the leader's background loops: derives each task's health
//! from its heartbeat, and restarts critical tasks that stall or crash,
//! bounded by a restart budget inside a cooldown window.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::config::WatchdogConfig;
use crate::coordination::ServiceHealth;

/// Health classification of a monitored task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskHealth {
    Healthy,
    Degraded,
    Stalled,
    Crashed,
    Stopped,
    Unknown,
}

/// Spawns (or re-spawns) the task and returns its handle.
pub type StartFn = Arc<dyn Fn() -> JoinHandle<()> + Send + Sync>;
/// Fetches the task's latest heartbeat record.
pub type HealthFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Option<ServiceHealth>> + Send>> + Send + Sync>;

struct Registration {
    start: StartFn,
    health: Option<HealthFn>,
    critical: bool,
    handle: Option<JoinHandle<()>>,
}

/// Status snapshot for one task, exposed on the health surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub health: TaskHealth,
    pub heartbeat_age_secs: Option<i64>,
    pub error_count: u64,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

pub struct Watchdog {
    config: WatchdogConfig,
    tasks: Mutex<HashMap<String, Registration>>,
    status: Mutex<HashMap<String, TaskStatus>>,
    restarts: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            tasks: Mutex::new(HashMap::new()),
            status: Mutex::new(HashMap::new()),
            restarts: Mutex::new(HashMap::new()),
        }
    }

    /// Register a task. `critical` tasks are restarted on stall/crash.
    pub fn register_task(
        &self,
        name: &str,
        start: StartFn,
        health: Option<HealthFn>,
        critical: bool,
    ) {
        self.tasks.lock().unwrap().insert(
            name.to_string(),
            Registration {
                start,
                health,
                critical,
                handle: None,
            },
        );
        self.status.lock().unwrap().insert(
            name.to_string(),
            TaskStatus {
                name: name.to_string(),
                health: TaskHealth::Unknown,
                heartbeat_age_secs: None,
                error_count: 0,
                restart_count: 0,
                last_error: None,
            },
        );
        self.restarts
            .lock()
            .unwrap()
            .insert(name.to_string(), Vec::new());
        tracing::info!(task = name, critical, "watchdog task registered");
    }

    /// Launch every registered task.
    pub fn start_all(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (name, registration) in tasks.iter_mut() {
            if registration.handle.is_none() {
                registration.handle = Some((registration.start)());
                tracing::info!(task = name, "task started");
            }
        }
    }

    /// Abort every running task (leader demotion / shutdown).
    pub fn stop_all(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (name, registration) in tasks.iter_mut() {
            if let Some(handle) = registration.handle.take() {
                handle.abort();
                tracing::info!(task = name, "task stopped");
            }
        }
    }

    pub fn status_snapshot(&self) -> Vec<TaskStatus> {
        let status = self.status.lock().unwrap();
        let mut snapshot: Vec<TaskStatus> = status.values().cloned().collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }

    /// One supervision pass over every task. Separated from the loop so
    /// tests can drive it directly.
    pub async fn check_all(&self) {
        let names: Vec<String> = self.tasks.lock().unwrap().keys().cloned().collect();
        for name in names {
            self.check_task(&name).await;
        }
    }

    async fn check_task(&self, name: &str) {
        let (health_fn, finished, critical) = {
            let tasks = self.tasks.lock().unwrap();
            let Some(registration) = tasks.get(name) else {
                return;
            };
            (
                registration.health.clone(),
                registration
                    .handle
                    .as_ref()
                    .map(|h| h.is_finished())
                    .unwrap_or(false),
                registration.critical,
            )
        };

        let health_data = match &health_fn {
            Some(fetch) => fetch().await,
            None => None,
        };

        let health = self.classify(finished, health_data.as_ref());
        {
            let mut status = self.status.lock().unwrap();
            if let Some(entry) = status.get_mut(name) {
                entry.health = health;
                entry.heartbeat_age_secs = health_data.as_ref().map(|h| h.heartbeat_age_secs());
                if let Some(data) = &health_data {
                    entry.error_count = data.error_count;
                    entry.last_error = data.last_error.clone();
                }
            }
        }

        if critical && matches!(health, TaskHealth::Stalled | TaskHealth::Crashed) {
            self.maybe_restart(name, health).await;
        }
    }

    fn classify(&self, finished: bool, health: Option<&ServiceHealth>) -> TaskHealth {
        if finished {
            return TaskHealth::Crashed;
        }
        let Some(health) = health else {
            return TaskHealth::Unknown;
        };
        if health.status == "stopped" {
            return TaskHealth::Stopped;
        }
        if health.heartbeat_age_secs() > self.config.heartbeat_timeout_secs as i64 {
            return TaskHealth::Stalled;
        }
        if health.status == "error" || health.error_count > self.config.error_threshold {
            return TaskHealth::Degraded;
        }
        TaskHealth::Healthy
    }

    /// Restart budget: at most `max_restarts` inside a window of
    /// `restart_cooldown × max_restarts`, with `restart_cooldown` between
    /// consecutive attempts.
    fn restart_allowed(&self, name: &str) -> bool {
        let restarts = self.restarts.lock().unwrap();
        let Some(timestamps) = restarts.get(name) else {
            return false;
        };
        let cooldown = Duration::from_secs(self.config.restart_cooldown_secs);
        let window = cooldown * self.config.max_restarts;

        let recent = timestamps
            .iter()
            .filter(|at| at.elapsed() < window)
            .count();
        if recent >= self.config.max_restarts as usize {
            return false;
        }
        match timestamps.last() {
            Some(last) => last.elapsed() >= cooldown,
            None => true,
        }
    }

    async fn maybe_restart(&self, name: &str, health: TaskHealth) {
        if !self.restart_allowed(name) {
            tracing::warn!(task = name, ?health, "restart budget exhausted, leaving task down");
            return;
        }

        tracing::warn!(task = name, ?health, "restarting unhealthy task");

        // Stop best-effort, give the old task a moment to unwind.
        if let Some(handle) = self
            .tasks
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(|r| r.handle.take())
        {
            handle.abort();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let start = {
            let tasks = self.tasks.lock().unwrap();
            tasks.get(name).map(|r| r.start.clone())
        };
        if let Some(start) = start {
            let handle = start();
            if let Some(registration) = self.tasks.lock().unwrap().get_mut(name) {
                registration.handle = Some(handle);
            }
            self.restarts
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .push(Instant::now());
            if let Some(entry) = self.status.lock().unwrap().get_mut(name) {
                entry.restart_count += 1;
            }
        }
    }

    /// Supervision loop; spawn it and abort on shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.check_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.check_all().await;
        }
    }
}
