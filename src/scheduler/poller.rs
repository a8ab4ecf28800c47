use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::engine::EngineShared;
use crate::model::{DeploymentParameter, Queue};
use crate::worker::loader::Loader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerStatus {
    Starting,
    Polling,
    Stopping,
    Stopped,
    /// Lost the database; waiting for the resilience coordinator to restart it.
    Faulted,
}

/// Running-instance counter shared between a poller and the loaders it spawned.
#[derive(Debug, Default)]
pub(crate) struct Slots {
    running: AtomicUsize,
    released: Notify,
}

impl Slots {
    pub(crate) fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn acquire(self: &Arc<Self>) -> SlotGuard {
        self.running.fetch_add(1, Ordering::SeqCst);
        SlotGuard {
            slots: Arc::clone(self),
        }
    }

    async fn wait_idle(&self) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.running() == 0 {
                return;
            }
            released.await;
        }
    }
}

/// One occupied concurrency slot. Released on drop, i.e. once the loader's outcome is stored.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    slots: Arc<Slots>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.running.fetch_sub(1, Ordering::SeqCst);
        self.slots.released.notify_waiters();
    }
}

/// Live view of one poller, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct PollerStats {
    pub deployment_id: i64,
    pub queue: String,
    pub status: PollerStatus,
    pub running: usize,
    pub max_concurrent_threads: usize,
    pub polling_interval_ms: u64,
    pub full: bool,
    pub actually_polling: bool,
    pub paused: bool,
}

/// Polls one queue for a node: claims eligible instances and hands each to a [`Loader`],
/// never exceeding `max_concurrent_threads` instances in flight.
///
/// Concurrency and interval are read on every iteration, so changing them takes effect
/// without a restart. A database error stops the loop and hands the poller to the
/// resilience coordinator, which restarts it once the database is back.
#[derive(Debug)]
pub struct QueuePoller {
    deployment_id: i64,
    queue: Queue,
    max_threads: AtomicUsize,
    polling_interval_ms: AtomicU64,
    slots: Arc<Slots>,
    status: Mutex<PollerStatus>,
    last_loop: Mutex<Option<Instant>>,
    stop_requested: AtomicBool,
    paused: AtomicBool,
    wake: Notify,
}

impl QueuePoller {
    pub(crate) fn new(deployment: &DeploymentParameter) -> Self {
        Self {
            deployment_id: deployment.id,
            queue: deployment.queue.clone(),
            max_threads: AtomicUsize::new(deployment.max_concurrent_threads),
            polling_interval_ms: AtomicU64::new(deployment.polling_interval_ms.max(1)),
            slots: Arc::new(Slots::default()),
            status: Mutex::new(PollerStatus::Starting),
            last_loop: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn deployment_id(&self) -> i64 {
        self.deployment_id
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn status(&self) -> PollerStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(PollerStatus::Faulted)
    }

    fn set_status(&self, status: PollerStatus) {
        if let Ok(mut s) = self.status.lock() {
            *s = status;
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads.load(Ordering::SeqCst)
    }

    pub fn set_max_threads(&self, max_threads: usize) {
        let previous = self.max_threads.swap(max_threads, Ordering::SeqCst);
        if previous != max_threads {
            tracing::info!(
                queue = %self.queue.name,
                previous,
                max_threads,
                "Poller concurrency changed"
            );
            self.wake.notify_one();
        }
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms.load(Ordering::SeqCst))
    }

    pub fn set_polling_interval(&self, interval_ms: u64) {
        let interval_ms = interval_ms.max(1);
        let previous = self.polling_interval_ms.swap(interval_ms, Ordering::SeqCst);
        if previous != interval_ms {
            tracing::info!(
                queue = %self.queue.name,
                previous,
                interval_ms,
                "Poller interval changed"
            );
            self.wake.notify_one();
        }
    }

    pub fn running_count(&self) -> usize {
        self.slots.running()
    }

    pub fn available_slots(&self) -> usize {
        self.max_threads().saturating_sub(self.running_count())
    }

    pub fn is_full(&self) -> bool {
        self.available_slots() == 0
    }

    /// False once the loop has fully terminated (drained and stopped).
    pub fn is_running(&self) -> bool {
        self.status() != PollerStatus::Stopped
    }

    /// True if the loop is polling and went through an iteration recently.
    pub fn is_actually_polling(&self) -> bool {
        if self.status() != PollerStatus::Polling {
            return false;
        }
        let recent = self.polling_interval() * 2 + Duration::from_millis(100);
        self.last_loop
            .lock()
            .ok()
            .and_then(|l| *l)
            .map(|at| at.elapsed() <= recent)
            .unwrap_or(false)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Stop claiming, drain in-flight loaders, then stop.
    pub(crate) fn stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            tracing::info!(queue = %self.queue.name, "Poller received a stop order");
        }
        self.wake.notify_one();
    }

    /// Prepares a faulted poller for a new loop. In-flight loaders and a pending stop order
    /// are kept.
    pub(crate) fn reset(&self) {
        self.set_status(PollerStatus::Starting);
        if let Ok(mut l) = self.last_loop.lock() {
            *l = None;
        }
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            deployment_id: self.deployment_id,
            queue: self.queue.name.clone(),
            status: self.status(),
            running: self.running_count(),
            max_concurrent_threads: self.max_threads(),
            polling_interval_ms: self.polling_interval_ms.load(Ordering::SeqCst),
            full: self.is_full(),
            actually_polling: self.is_actually_polling(),
            paused: self.is_paused(),
        }
    }

    pub(crate) fn start(self: &Arc<Self>, engine: Arc<EngineShared>) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move { poller.run(engine).await })
    }

    async fn run(self: Arc<Self>, engine: Arc<EngineShared>) {
        self.set_status(PollerStatus::Polling);
        tracing::info!(
            node = %engine.node_name,
            queue = %self.queue.name,
            max_threads = self.max_threads(),
            interval_ms = self.polling_interval().as_millis() as u64,
            "Poller started"
        );

        while !self.stop_requested.load(Ordering::SeqCst) {
            if let Ok(mut l) = self.last_loop.lock() {
                *l = Some(Instant::now());
            }

            if !self.is_paused() {
                if let Err(e) = self.poll_once(&engine).await {
                    tracing::error!(
                        queue = %self.queue.name,
                        error = %e,
                        "Poller lost the database, waiting for reconnection"
                    );
                    self.set_status(PollerStatus::Faulted);
                    engine.resilience.poller_restart_needed(&engine, Arc::clone(&self));
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.polling_interval()) => {}
                _ = self.wake.notified() => {}
            }
        }

        self.set_status(PollerStatus::Stopping);
        tracing::debug!(
            queue = %self.queue.name,
            running = self.running_count(),
            "Poller draining"
        );
        self.slots.wait_idle().await;
        self.set_status(PollerStatus::Stopped);
        tracing::info!(queue = %self.queue.name, "Poller stopped");

        engine.check_engine_end().await;
    }

    async fn poll_once(&self, engine: &Arc<EngineShared>) -> Result<(), crate::error::DbError> {
        let available = self.available_slots();
        if available == 0 {
            return Ok(());
        }

        let claimed = engine
            .db
            .claim_instances(self.queue.id, engine.node_id, available, Utc::now())
            .await?;

        for instance in claimed {
            tracing::debug!(
                queue = %self.queue.name,
                job_instance_id = instance.id,
                "Job instance claimed"
            );
            let slot = self.slots.acquire();
            Loader::spawn(Arc::clone(engine), instance, slot);
        }
        Ok(())
    }
}
