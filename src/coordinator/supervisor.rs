//! Worker supervision
//!
//! Every worker runs as its own task under a supervisor task. A crash
//! (error return, unexpected exit or panic) is caught at the task boundary,
//! logged and followed by a restart after a backoff. Too many restarts
//! inside the window marks the component permanently unhealthy; the rest of
//! the pipeline keeps running.

use super::state::{PipelineCounters, PipelineState};
use crate::config::SupervisionConfig;
use crate::error::Result;
use crate::models::{ComponentHealth, Severity, SystemEvent};
use crate::store::PersistenceHandle;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Restart budget for one worker
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
    pub backoff: Duration,
}

impl From<&SupervisionConfig> for RestartPolicy {
    fn from(config: &SupervisionConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            window: config.restart_window,
            backoff: config.restart_backoff,
        }
    }
}

/// Handed to each worker run
#[derive(Clone)]
pub struct WorkerContext {
    pub shutdown: CancellationToken,
    ready: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl WorkerContext {
    pub fn new(shutdown: CancellationToken, ready: oneshot::Sender<()>) -> Self {
        Self {
            shutdown,
            ready: Arc::new(Mutex::new(Some(ready))),
        }
    }

    /// Signal readiness; only the first call across restarts has an effect
    pub fn ready(&self) {
        if let Ok(mut slot) = self.ready.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawns and restarts workers
pub struct Supervisor {
    policy: RestartPolicy,
    state: Arc<PipelineState>,
    persistence: PersistenceHandle,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy, state: Arc<PipelineState>, persistence: PersistenceHandle) -> Self {
        Self {
            policy,
            state,
            persistence,
        }
    }

    /// Spawn `make` under supervision; the returned handle ends when the
    /// worker stops for good
    ///
    /// Aborting the returned handle also aborts the running worker.
    pub fn spawn<F, Fut>(
        &self,
        name: &'static str,
        shutdown: CancellationToken,
        ready: oneshot::Sender<()>,
        make: F,
    ) -> JoinHandle<()>
    where
        F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let ctx = WorkerContext::new(shutdown, ready);
        let policy = self.policy.clone();
        let state = self.state.clone();
        let persistence = self.persistence.clone();

        tokio::spawn(supervise(name, policy, state, persistence, ctx, make))
    }
}

async fn supervise<F, Fut>(
    name: &'static str,
    policy: RestartPolicy,
    state: Arc<PipelineState>,
    persistence: PersistenceHandle,
    ctx: WorkerContext,
    make: F,
) where
    F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let span = tracing::info_span!("worker", component = name);
    let mut restarts: VecDeque<Instant> = VecDeque::new();

    loop {
        let mut worker = AbortOnDrop(tokio::spawn(make(ctx.clone()).instrument(span.clone())));
        let outcome = (&mut worker.0).await;

        if ctx.is_cancelled() {
            if let Ok(Err(e)) = &outcome {
                tracing::warn!(component = name, error = %e, "Worker failed while stopping");
            }
            tracing::debug!(component = name, "Worker stopped");
            break;
        }

        let reason = match outcome {
            Ok(Ok(())) => "exited unexpectedly".to_string(),
            Ok(Err(e)) => format!("failed: {}", e),
            Err(e) if e.is_panic() => "panicked".to_string(),
            Err(e) => format!("aborted: {}", e),
        };
        tracing::error!(component = name, reason = %reason, "Worker crashed");

        let now = Instant::now();
        while restarts
            .front()
            .map(|first| now.duration_since(*first) > policy.window)
            .unwrap_or(false)
        {
            restarts.pop_front();
        }

        if restarts.len() as u32 >= policy.max_restarts {
            let message = format!(
                "permanently failed after {} restarts within {:?}: {}",
                restarts.len(),
                policy.window,
                reason
            );
            tracing::error!(component = name, "Worker exceeded restart budget, giving up");
            state
                .report_health(ComponentHealth::unhealthy(name, message.clone()))
                .await;
            persistence.system_event(SystemEvent::new(
                "component_failed",
                format!("{}: {}", name, message),
                Severity::Critical,
            ));
            break;
        }

        restarts.push_back(now);
        PipelineCounters::incr(&state.counters.worker_restarts);
        state
            .report_health(ComponentHealth::unhealthy(
                name,
                format!("restarting after crash: {}", reason),
            ))
            .await;
        persistence.system_event(SystemEvent::new(
            "worker_restart",
            format!("{} {}", name, reason),
            Severity::Error,
        ));

        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            _ = tokio::time::sleep(policy.backoff) => {}
        }

        tracing::info!(component = name, attempt = restarts.len(), "Restarting worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_engine::AlertEngine;
    use crate::error::Error;
    use crate::store::persistence_channel;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn setup(max_restarts: u32) -> (Supervisor, Arc<PipelineState>) {
        let state = Arc::new(PipelineState::new(
            AlertEngine::new(3, Duration::from_secs(1)).snapshot(),
        ));
        let (handle, _queue) = persistence_channel(16, state.clone());
        let policy = RestartPolicy {
            max_restarts,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(10),
        };
        (Supervisor::new(policy, state.clone(), handle), state)
    }

    #[tokio::test]
    async fn test_ready_signal_fires_once() {
        let (tx, rx) = oneshot::channel();
        let ctx = WorkerContext::new(CancellationToken::new(), tx);
        ctx.ready();
        ctx.clone().ready();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_worker_is_restarted_then_given_up() {
        let (supervisor, state) = setup(2);
        let attempts = Arc::new(AtomicU32::new(0));
        let (ready_tx, _ready_rx) = oneshot::channel();

        let counter = attempts.clone();
        let handle = supervisor.spawn("flaky", CancellationToken::new(), ready_tx, move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if counter.load(Ordering::SeqCst) > 0 {
                    panic!("boom");
                }
                Ok::<(), Error>(())
            }
        });

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor should give up")
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(state.counters.snapshot().worker_restarts, 2);
        let health = state.component("flaky").await.unwrap();
        assert!(!health.healthy);
        assert!(health.message.contains("permanently failed"));
    }

    #[tokio::test]
    async fn test_recovering_worker_keeps_running() {
        let (supervisor, state) = setup(5);
        let attempts = Arc::new(AtomicU32::new(0));
        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let counter = attempts.clone();
        let handle = supervisor.spawn("recovering", shutdown.clone(), ready_tx, move |ctx| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(Error::Internal("first run fails".into()));
                }
                ctx.ready();
                ctx.shutdown.cancelled().await;
                Ok(())
            }
        });

        tokio::time::timeout(Duration::from_secs(5), ready_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(state.counters.snapshot().worker_restarts, 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_aborting_supervisor_aborts_worker() {
        let (supervisor, _state) = setup(5);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (dropped_tx, dropped_rx) = oneshot::channel::<()>();

        struct SignalOnDrop(Option<oneshot::Sender<()>>);
        impl Drop for SignalOnDrop {
            fn drop(&mut self) {
                if let Some(tx) = self.0.take() {
                    let _ = tx.send(());
                }
            }
        }

        let dropped_tx = Arc::new(Mutex::new(Some(dropped_tx)));
        let handle = supervisor.spawn("stuck", CancellationToken::new(), ready_tx, move |ctx| {
            let guard = SignalOnDrop(dropped_tx.lock().unwrap().take());
            async move {
                let _guard = guard;
                ctx.ready();
                std::future::pending::<()>().await;
                Ok::<(), Error>(())
            }
        });

        ready_rx.await.unwrap();
        handle.abort();
        tokio::time::timeout(Duration::from_secs(5), dropped_rx)
            .await
            .unwrap()
            .unwrap();
    }
}
