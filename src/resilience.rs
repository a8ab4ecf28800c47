//! Single reconnection loop per node.
//!
//! Pollers, the heartbeat and loaders never retry the database themselves after losing it.
//! They register here and stop; the coordinator probes the database with a linear backoff and,
//! once it answers, restarts, starts or completes everything that registered.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::engine::EngineShared;
use crate::scheduler::poller::QueuePoller;
use crate::worker::loader::{DeferredFinalization, DeferredStart};

#[derive(Debug, Default)]
struct Pending {
    heartbeat: bool,
    pollers: VecDeque<Arc<QueuePoller>>,
    loaders: VecDeque<DeferredFinalization>,
    starts: VecDeque<DeferredStart>,
    active: bool,
}

impl Pending {
    fn is_empty(&self) -> bool {
        !self.heartbeat
            && self.pollers.is_empty()
            && self.loaders.is_empty()
            && self.starts.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct ResilienceCoordinator {
    pending: Mutex<Pending>,
}

impl ResilienceCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while the reconnection loop runs.
    pub(crate) fn is_active(&self) -> bool {
        self.pending().active
    }

    /// Number of outcomes waiting to be stored.
    pub(crate) fn deferred_count(&self) -> usize {
        self.pending().loaders.len()
    }

    /// Number of claimed instances waiting to be started.
    pub(crate) fn deferred_start_count(&self) -> usize {
        self.pending().starts.len()
    }

    pub(crate) fn poller_restart_needed(
        &self,
        engine: &Arc<EngineShared>,
        poller: Arc<QueuePoller>,
    ) {
        self.submit(engine, |p| p.pollers.push_back(poller));
    }

    pub(crate) fn loader_start_needed(&self, engine: &Arc<EngineShared>, deferred: DeferredStart) {
        self.submit(engine, |p| p.starts.push_back(deferred));
    }

    pub(crate) fn loader_finalization_needed(
        &self,
        engine: &Arc<EngineShared>,
        deferred: DeferredFinalization,
    ) {
        self.submit(engine, |p| p.loaders.push_back(deferred));
    }

    pub(crate) fn heartbeat_restart_needed(&self, engine: &Arc<EngineShared>) {
        self.submit(engine, |p| p.heartbeat = true);
    }

    fn submit(&self, engine: &Arc<EngineShared>, register: impl FnOnce(&mut Pending)) {
        let spawn = {
            let mut pending = self.pending();
            register(&mut pending);
            !std::mem::replace(&mut pending.active, true)
        };
        if spawn {
            let engine = Arc::clone(engine);
            tokio::spawn(async move { engine.resilience.run(&engine).await });
        }
    }

    async fn run(&self, engine: &Arc<EngineShared>) {
        tracing::warn!(
            node = %engine.node_name,
            "Database connection lost, starting reconnection loop"
        );

        loop {
            Self::wait_for_database(engine).await;

            let (heartbeat, pollers, loaders, starts) = {
                let mut pending = self.pending();
                (
                    std::mem::take(&mut pending.heartbeat),
                    std::mem::take(&mut pending.pollers),
                    std::mem::take(&mut pending.loaders),
                    std::mem::take(&mut pending.starts),
                )
            };
            tracing::info!(
                node = %engine.node_name,
                pollers = pollers.len(),
                loaders = loaders.len(),
                starts = starts.len(),
                heartbeat,
                "Database is reachable again, restarting faulted components"
            );

            let mut still_deferred = VecDeque::new();
            for deferred in loaders {
                if !still_deferred.is_empty() {
                    still_deferred.push_back(deferred);
                    continue;
                }
                if let Err(deferred) = deferred.complete(engine).await {
                    tracing::debug!(
                        job_instance_id = deferred.job_instance_id(),
                        "Database lost again while storing a deferred result"
                    );
                    still_deferred.push_back(deferred);
                }
            }

            // The heartbeat timer cannot be trusted after a stall, restart it in all cases.
            engine.restart_heartbeat().await;

            // A start that loses the database again registers itself anew.
            for deferred in starts {
                deferred.resume(engine);
            }

            for poller in pollers {
                poller.reset();
                poller.start(Arc::clone(engine));
            }

            {
                let mut pending = self.pending();
                while let Some(deferred) = still_deferred.pop_back() {
                    pending.loaders.push_front(deferred);
                }
                if pending.is_empty() {
                    pending.active = false;
                    tracing::info!(node = %engine.node_name, "Reconnection complete");
                    break;
                }
            }
        }

        engine.check_engine_end().await;
    }

    async fn wait_for_database(engine: &EngineShared) {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let delay = engine.config.backoff_delay(attempt);
            tokio::time::sleep(delay).await;
            match engine.db.ping().await {
                Ok(()) => return,
                Err(e) => {
                    tracing::debug!(
                        node = %engine.node_name,
                        attempt,
                        next_delay_ms = engine.config.backoff_delay(attempt + 1).as_millis() as u64,
                        error = %e,
                        "Database still unreachable"
                    );
                }
            }
        }
    }
}
