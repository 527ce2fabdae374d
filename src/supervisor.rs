//! Loop supervision
//!
//! Every long-running loop returns `Result<()>`. The supervisor runs each
//! one in its own task, logs how it ended, and restarts it according to
//! its [`RestartPolicy`] without touching the other loops.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};

/// When to restart a failed loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub restart: bool,
    /// Restarts allowed before giving up (0 = unlimited)
    pub max_restarts: u32,
    pub backoff: Duration,
}

impl RestartPolicy {
    /// Run once; a failure stops the loop
    pub fn never() -> Self {
        Self {
            restart: false,
            max_restarts: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            restart: config.restart,
            max_restarts: config.max_restarts,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    fn allows(&self, restarts_so_far: u32, error: &Error) -> bool {
        self.restart && !error.is_terminal() && (self.max_restarts == 0 || restarts_so_far < self.max_restarts)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Running,
    Restarting,
    /// Returned without error
    Finished,
    /// Failed and will not be restarted
    Failed,
}

/// Status of one supervised loop
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub name: String,
    pub state: LoopState,
    pub restarts: u32,
    pub last_error: Option<String>,
}

type StatusMap = Arc<RwLock<BTreeMap<String, LoopStatus>>>;

/// Read-only view of loop states, for the status API
#[derive(Clone)]
pub struct SupervisorHandle {
    statuses: StatusMap,
}

impl SupervisorHandle {
    pub fn statuses(&self) -> Vec<LoopStatus> {
        self.statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

/// Runs and restarts the process's loops
pub struct Supervisor {
    policy: RestartPolicy,
    statuses: StatusMap,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    aborts: Mutex<Vec<AbortHandle>>,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            statuses: Arc::new(RwLock::new(BTreeMap::new())),
            tasks: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            statuses: Arc::clone(&self.statuses),
        }
    }

    pub fn statuses(&self) -> Vec<LoopStatus> {
        self.handle().statuses()
    }

    /// Supervise a loop under the default policy. `make` builds a fresh
    /// future for every (re)start.
    pub fn spawn<F, Fut>(&self, name: &str, make: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_with_policy(name, self.policy, make)
    }

    /// Supervise a loop under its own policy
    pub fn spawn_with_policy<F, Fut>(&self, name: &str, policy: RestartPolicy, make: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.to_string();
        let statuses = Arc::clone(&self.statuses);
        update(&statuses, &name, LoopState::Running, 0, None);

        let task = tokio::spawn(async move {
            let mut restarts = 0u32;
            loop {
                let result = match AssertUnwindSafe(make()).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Internal(format!("{} panicked", name))),
                };

                let error = match result {
                    Ok(()) => {
                        tracing::info!("{} finished", name);
                        update(&statuses, &name, LoopState::Finished, restarts, None);
                        return;
                    }
                    Err(e) => e,
                };

                if !policy.allows(restarts, &error) {
                    tracing::error!("{} failed: {}", name, error);
                    update(&statuses, &name, LoopState::Failed, restarts, Some(error.to_string()));
                    return;
                }

                restarts += 1;
                tracing::warn!("{} failed: {}; restart {} in {:?}", name, error, restarts, policy.backoff);
                update(&statuses, &name, LoopState::Restarting, restarts, Some(error.to_string()));
                tokio::time::sleep(policy.backoff).await;
                update(&statuses, &name, LoopState::Running, restarts, Some(error.to_string()));
            }
        });

        self.aborts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task.abort_handle());
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(task);
    }

    /// Wait until every loop spawned so far has stopped for good
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        futures::future::join_all(tasks).await;
    }

    /// Abort every loop
    pub fn shutdown(&self) {
        for abort in self.aborts.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            abort.abort();
        }
    }
}

fn update(statuses: &StatusMap, name: &str, state: LoopState, restarts: u32, last_error: Option<String>) {
    let mut map = statuses.write().unwrap_or_else(|e| e.into_inner());
    let entry = map.entry(name.to_string()).or_insert_with(|| LoopStatus {
        name: name.to_string(),
        state,
        restarts,
        last_error: None,
    });
    entry.state = state;
    entry.restarts = restarts;
    if last_error.is_some() {
        entry.last_error = last_error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn status(supervisor: &Supervisor, name: &str) -> LoopStatus {
        supervisor
            .statuses()
            .into_iter()
            .find(|s| s.name == name)
            .unwrap()
    }

    fn policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            restart: true,
            max_restarts,
            backoff: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_until_success() {
        let supervisor = Supervisor::new(policy(5));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        supervisor.spawn("flaky", move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Tun("read failed".into()))
                } else {
                    Ok(())
                }
            }
        });

        supervisor.join().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let s = status(&supervisor, "flaky");
        assert_eq!(s.state, LoopState::Finished);
        assert_eq!(s.restarts, 2);
        assert_eq!(s.last_error.as_deref(), Some("TUN error: read failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_restarts() {
        let supervisor = Supervisor::new(policy(2));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        supervisor.spawn("broken", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::UndersizedPacket(3)) }
        });

        supervisor.join().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(status(&supervisor, "broken").state, LoopState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_restarted() {
        let supervisor = Supervisor::new(policy(0));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        supervisor.spawn("inbound", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::MeshClosed) }
        });

        supervisor.join().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(status(&supervisor, "inbound").state, LoopState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_counts_as_failure() {
        let supervisor = Supervisor::new(RestartPolicy::never());
        supervisor.spawn("panicky", || async {
            if true {
                panic!("boom");
            }
            Ok(())
        });

        supervisor.join().await;
        let s = status(&supervisor, "panicky");
        assert_eq!(s.state, LoopState::Failed);
        assert_eq!(s.last_error.as_deref(), Some("Internal error: panicky panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_touch_other_loops() {
        let supervisor = Supervisor::new(RestartPolicy::never());
        supervisor.spawn("steady", || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        supervisor.spawn("doomed", || async { Err(Error::Tun("gone".into())) });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(status(&supervisor, "steady").state, LoopState::Running);
        assert_eq!(status(&supervisor, "doomed").state, LoopState::Failed);

        supervisor.shutdown();
        supervisor.join().await;
    }
}
