//! The per-node engine.
//!
//! An [`Engine`] owns one [`QueuePoller`] per deployment of its node, the heartbeat poller and
//! the resilience coordinator. Nodes never talk to each other: everything they share goes
//! through the [`Database`].
//!
//! # Lifecycle
//!
//! 1. [`EngineBuilder::start`] refuses to start if another process stamped the node heartbeat
//!    recently, then claims the name by stamping it itself.
//! 2. Instances left bound to the node by a previous run are written off as `CRASHED`.
//! 3. Pollers start, then the heartbeat.
//! 4. [`Engine::stop`] stops claims, waits for every in-flight loader to store its result,
//!    stops the heartbeat last, then releases the node row.

pub mod handler;
pub mod stats;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, HEARTBEAT_PARAMETER};
use crate::db::Database;
use crate::error::{DbError, EngineError, Result};
use crate::logging::LogLevelHandle;
use crate::model::{DeploymentParameter, Node, Outcome, State};
use crate::resilience::ResilienceCoordinator;
use crate::scheduler::poller::QueuePoller;
use crate::worker::executor::ProcessExecutor;
use crate::worker::heartbeat::HeartbeatPoller;
use crate::worker::payload::{Payload, PayloadRegistry};

pub use handler::{EngineHandler, NoopHandler};
pub use stats::EngineStats;

/// Message attached to instances found bound to the node when it starts.
pub const ORPHAN_MESSAGE: &str =
    "Job instance was still bound to this node at startup: killed by node restart or crash";

#[derive(Debug, Default)]
struct PollerSet {
    active: HashMap<i64, Arc<QueuePoller>>,
    /// Pollers whose deployment disappeared, kept until they have drained.
    retired: Vec<Arc<QueuePoller>>,
}

impl PollerSet {
    fn all(&self) -> impl Iterator<Item = &Arc<QueuePoller>> {
        self.active.values().chain(self.retired.iter())
    }

    fn retire(&mut self, deployment_id: i64) {
        if let Some(poller) = self.active.remove(&deployment_id) {
            poller.stop();
            self.retired.push(poller);
        }
    }
}

/// State shared by every task of one engine.
pub(crate) struct EngineShared {
    pub(crate) db: Arc<dyn Database>,
    pub(crate) config: EngineConfig,
    pub(crate) node_id: i64,
    pub(crate) node_name: String,
    pub(crate) payloads: PayloadRegistry,
    pub(crate) executor: ProcessExecutor,
    pub(crate) handler: Arc<dyn EngineHandler>,
    pub(crate) resilience: ResilienceCoordinator,
    node: RwLock<Node>,
    heartbeat_interval: Duration,
    log_level: Option<LogLevelHandle>,
    pollers: Mutex<PollerSet>,
    heartbeat: Mutex<Option<Arc<HeartbeatPoller>>>,
    paused: AtomicBool,
    stopping: AtomicBool,
    ended: AtomicBool,
    ended_tx: watch::Sender<bool>,
    started_at: Instant,
}

impl EngineShared {
    pub(crate) fn node(&self) -> Node {
        self.node
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn delivery_repo(&self) -> PathBuf {
        self.node
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .delivery_repo
            .clone()
    }

    pub(crate) fn work_dir_root(&self) -> PathBuf {
        self.config
            .work_dir_root
            .clone()
            .unwrap_or_else(|| self.delivery_repo())
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn has_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    fn apply_log_level(&self, level: &str) {
        if let Some(handle) = &self.log_level {
            match handle.set_level(level) {
                Ok(()) => tracing::info!(node = %self.node_name, level, "Log level applied"),
                Err(e) => tracing::warn!(
                    node = %self.node_name,
                    level,
                    error = %e,
                    "Log level not applied"
                ),
            }
        }
    }

    /// Reconciles running pollers with the deployments currently stored for this node.
    pub(crate) async fn sync_pollers(self: &Arc<Self>) -> std::result::Result<(), DbError> {
        let deployments = self.db.deployments_for_node(self.node_id).await?;
        self.apply_deployments(deployments).await;
        Ok(())
    }

    pub(crate) async fn apply_deployments(self: &Arc<Self>, deployments: Vec<DeploymentParameter>) {
        if self.is_stopping() {
            return;
        }
        let mut set = self.pollers.lock().await;

        let wanted: HashSet<i64> = deployments.iter().map(|d| d.id).collect();
        let removed: Vec<i64> = set
            .active
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        for deployment_id in removed {
            tracing::info!(
                node = %self.node_name,
                deployment_id,
                "Deployment removed, stopping its poller"
            );
            set.retire(deployment_id);
        }
        set.retired.retain(|p| p.is_running());

        for deployment in deployments {
            if let Some(poller) = set.active.get(&deployment.id) {
                if poller.queue().id == deployment.queue.id {
                    poller.set_max_threads(deployment.max_concurrent_threads);
                    poller.set_polling_interval(deployment.polling_interval_ms);
                    continue;
                }
                tracing::info!(
                    node = %self.node_name,
                    deployment_id = deployment.id,
                    "Deployment moved to another queue, replacing its poller"
                );
                set.retire(deployment.id);
            }

            let poller = Arc::new(QueuePoller::new(&deployment));
            if self.paused.load(Ordering::SeqCst) {
                poller.pause();
            }
            poller.start(Arc::clone(self));
            set.active.insert(deployment.id, poller);
        }
    }

    /// Called by the heartbeat with a freshly read node row.
    pub(crate) async fn refresh_configuration(
        self: &Arc<Self>,
        node: Node,
    ) -> std::result::Result<(), DbError> {
        let changed = {
            let mut current = self.node.write().unwrap_or_else(PoisonError::into_inner);
            let changed = current.config_fingerprint() != node.config_fingerprint();
            *current = node.clone();
            changed
        };
        if changed {
            tracing::info!(node = %self.node_name, "Node configuration changed");
            self.apply_log_level(&node.root_log_level);
            self.handler.on_configuration_changed(&node);
        }
        self.sync_pollers().await
    }

    fn start_heartbeat(self: &Arc<Self>) -> Arc<HeartbeatPoller> {
        let heartbeat = Arc::new(HeartbeatPoller::new());
        heartbeat.start(Arc::clone(self));
        heartbeat
    }

    /// Replaces the heartbeat poller with a fresh one.
    pub(crate) async fn restart_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock().await;
        // The end is decided under this lock, an ended engine keeps its heartbeat stopped.
        if self.has_ended() {
            return;
        }
        if let Some(previous) = slot.take() {
            previous.stop();
        }
        *slot = Some(self.start_heartbeat());
        tracing::debug!(node = %self.node_name, "Heartbeat restarted");
    }

    /// Stops claiming everywhere. Returns immediately; the end is signalled by
    /// [`check_engine_end`](Self::check_engine_end).
    pub(crate) async fn begin_stop(self: &Arc<Self>) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            node = %self.node_name,
            "Engine stopping, waiting for running job instances"
        );
        {
            let set = self.pollers.lock().await;
            for poller in set.all() {
                poller.stop();
            }
        }
        self.check_engine_end().await;
    }

    /// Tears the engine down once every poller and then the heartbeat have stopped.
    /// Called by each of them on exit; only the first caller to see everything stopped does
    /// the teardown.
    pub(crate) async fn check_engine_end(self: &Arc<Self>) {
        if !self.is_stopping() || self.has_ended() {
            return;
        }
        {
            let set = self.pollers.lock().await;
            if set.all().any(|p| p.is_running()) {
                return;
            }
        }
        {
            let heartbeat = self.heartbeat.lock().await;
            if let Some(heartbeat) = heartbeat.as_ref() {
                if heartbeat.is_running() {
                    // Exits and calls back here.
                    heartbeat.stop();
                    return;
                }
            }
            if self.ended.swap(true, Ordering::SeqCst) {
                return;
            }
        }

        if let Err(e) = self.db.release_node(self.node_id).await {
            tracing::warn!(node = %self.node_name, error = %e, "Node row could not be released");
        }
        {
            let mut set = self.pollers.lock().await;
            set.active.clear();
            set.retired.clear();
        }
        self.handler.on_node_stopped();
        self.ended_tx.send_replace(true);
        tracing::info!(node = %self.node_name, "Engine has stopped");
    }
}

/// Configures and starts an [`Engine`].
pub struct EngineBuilder {
    db: Arc<dyn Database>,
    config: EngineConfig,
    payloads: PayloadRegistry,
    handler: Arc<dyn EngineHandler>,
    log_level: Option<LogLevelHandle>,
}

impl EngineBuilder {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            config: EngineConfig::default(),
            payloads: PayloadRegistry::new(),
            handler: Arc::new(NoopHandler),
            log_level: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn payload(self, name: impl Into<String>, payload: Arc<dyn Payload>) -> Self {
        self.payloads.register(name, payload);
        self
    }

    pub fn payloads(mut self, payloads: PayloadRegistry) -> Self {
        self.payloads = payloads;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn EngineHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn log_level_handle(mut self, handle: LogLevelHandle) -> Self {
        self.log_level = Some(handle);
        self
    }

    /// Brings the node online. Fails without side effects if the node is unknown or already
    /// running elsewhere.
    pub async fn start(self, node_name: &str) -> Result<Engine> {
        if node_name.trim().is_empty() {
            return Err(EngineError::Initialization(
                "engine name cannot be empty".to_string(),
            ));
        }
        self.handler.on_node_starting(node_name);
        tracing::info!(node = %node_name, version = env!("CARGO_PKG_VERSION"), "Engine starting");

        let node = self.db.node_by_name(node_name).await?.ok_or_else(|| {
            EngineError::Initialization(format!("no node named '{node_name}' in the database"))
        })?;

        let heartbeat_interval = self.resolve_heartbeat_interval().await?;
        let window = heartbeat_interval * 2;
        let now = Utc::now();
        if node.is_alive_at(now, window) {
            return Err(EngineError::Initialization(format!(
                "another engine named '{node_name}' was running no less than {} seconds ago",
                window.as_secs()
            )));
        }
        if !self
            .db
            .claim_node_identity(node.id, node.last_seen_alive, now)
            .await?
        {
            return Err(EngineError::Initialization(format!(
                "another engine claimed the name '{node_name}' concurrently"
            )));
        }

        let node_id = node.id;
        let db = Arc::clone(&self.db);
        match self.bring_online(node, heartbeat_interval).await {
            Ok(engine) => Ok(engine),
            Err(e) => {
                if let Err(release) = db.release_node(node_id).await {
                    tracing::warn!(
                        node = %node_name,
                        error = %release,
                        "Node row could not be released"
                    );
                }
                Err(e)
            }
        }
    }

    async fn resolve_heartbeat_interval(&self) -> Result<Duration> {
        match self.db.global_parameter(HEARTBEAT_PARAMETER).await? {
            Some(raw) => {
                let ms: u64 = raw.trim().parse().map_err(|_| {
                    EngineError::Configuration(format!(
                        "global parameter {HEARTBEAT_PARAMETER} is not a number: '{raw}'"
                    ))
                })?;
                Ok(Duration::from_millis(ms.max(1)))
            }
            None => Ok(self.config.heartbeat_interval),
        }
    }

    async fn bring_online(self, node: Node, heartbeat_interval: Duration) -> Result<Engine> {
        if let Some(handle) = &self.log_level {
            if let Err(e) = handle.set_level(&node.root_log_level) {
                tracing::warn!(node = %node.name, error = %e, "Log level not applied");
            }
        }
        self.handler.on_node_configuration_read(&node);

        purge_orphans(self.db.as_ref(), node.id).await?;

        let (ended_tx, _) = watch::channel(false);
        let shared = Arc::new(EngineShared {
            db: self.db,
            config: self.config,
            node_id: node.id,
            node_name: node.name.clone(),
            payloads: self.payloads,
            executor: ProcessExecutor::new(),
            handler: self.handler,
            resilience: ResilienceCoordinator::new(),
            node: RwLock::new(node),
            heartbeat_interval,
            log_level: self.log_level,
            pollers: Mutex::new(PollerSet::default()),
            heartbeat: Mutex::new(None),
            paused: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            ended_tx,
            started_at: Instant::now(),
        });

        // Fails before any poller is created.
        shared.sync_pollers().await?;
        *shared.heartbeat.lock().await = Some(shared.start_heartbeat());

        shared.handler.on_node_started();
        tracing::info!(
            node = %shared.node_name,
            pollers = shared.pollers.lock().await.active.len(),
            "Engine started"
        );
        Ok(Engine { shared })
    }
}

/// Writes off every live instance still bound to the node.
async fn purge_orphans(db: &dyn Database, node_id: i64) -> Result<()> {
    for instance in db.instances_owned_by(node_id).await? {
        tracing::warn!(
            job_instance_id = instance.id,
            state = %instance.state,
            "Job instance was left by a previous run of this node, marking it crashed"
        );
        let outcome = Outcome::new(instance, State::Crashed).with_message(ORPHAN_MESSAGE);
        db.finalize(&outcome).await?;
    }
    Ok(())
}

/// Handle to a running node engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn builder(db: Arc<dyn Database>) -> EngineBuilder {
        EngineBuilder::new(db)
    }

    /// Starts `node_name` with the given configuration and no in-process payloads.
    pub async fn start(
        db: Arc<dyn Database>,
        node_name: &str,
        config: EngineConfig,
    ) -> Result<Engine> {
        EngineBuilder::new(db).config(config).start(node_name).await
    }

    pub fn node_name(&self) -> &str {
        &self.shared.node_name
    }

    pub fn node_id(&self) -> i64 {
        self.shared.node_id
    }

    /// Last node row read from the database.
    pub fn node(&self) -> Node {
        self.shared.node()
    }

    pub fn payloads(&self) -> &PayloadRegistry {
        &self.shared.payloads
    }

    /// Graceful stop: waits until every dispatched job instance has stored its result.
    /// Idempotent; concurrent callers all return once the engine has ended.
    pub async fn stop(&self) {
        let mut ended = self.shared.ended_tx.subscribe();
        self.shared.begin_stop().await;
        // The sender lives as long as `shared`, so this only fails if it is dropped.
        let _ = ended.wait_for(|ended| *ended).await;
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }

    pub fn has_ended(&self) -> bool {
        self.shared.has_ended()
    }

    /// Stops the engine when `token` is cancelled, e.g. by
    /// [`install_shutdown_handler`](crate::shutdown::install_shutdown_handler).
    pub fn stop_on_signal(&self, token: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(node = %engine.node_name(), "Shutdown signal received");
                    engine.stop().await;
                }
                _ = engine.wait_ended() => {}
            }
        })
    }

    async fn wait_ended(&self) {
        let mut ended = self.shared.ended_tx.subscribe();
        let _ = ended.wait_for(|ended| *ended).await;
    }

    /// Re-reads this node's deployments and reconciles the pollers.
    pub async fn sync_pollers(&self) -> Result<()> {
        self.shared.sync_pollers().await?;
        Ok(())
    }

    /// Reconciles the pollers with an explicit deployment list.
    pub async fn sync_pollers_with(&self, deployments: Vec<DeploymentParameter>) {
        self.shared.apply_deployments(deployments).await;
    }

    pub async fn poller(&self, deployment_id: i64) -> Option<Arc<QueuePoller>> {
        self.shared
            .pollers
            .lock()
            .await
            .active
            .get(&deployment_id)
            .cloned()
    }

    pub async fn pollers(&self) -> Vec<Arc<QueuePoller>> {
        let mut pollers: Vec<_> = self
            .shared
            .pollers
            .lock()
            .await
            .active
            .values()
            .cloned()
            .collect();
        pollers.sort_by_key(|p| p.deployment_id());
        pollers
    }

    /// Pollers keep running and draining but stop claiming new instances.
    pub async fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        for poller in self.shared.pollers.lock().await.all() {
            poller.pause();
        }
        tracing::info!(node = %self.node_name(), "Engine paused");
    }

    pub async fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        for poller in self.shared.pollers.lock().await.all() {
            poller.resume();
        }
        tracing::info!(node = %self.node_name(), "Engine resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Not stopping, heartbeat alive, every poller looping recently.
    pub async fn is_up_and_running(&self) -> bool {
        if self.is_stopping() || self.has_ended() {
            return false;
        }
        let heartbeat_alive = self
            .shared
            .heartbeat
            .lock()
            .await
            .as_ref()
            .is_some_and(|hb| hb.is_running());
        heartbeat_alive && self.is_all_pollers_polling().await
    }

    pub async fn is_all_pollers_polling(&self) -> bool {
        self.shared
            .pollers
            .lock()
            .await
            .active
            .values()
            .all(|p| p.is_actually_polling())
    }

    pub async fn is_full(&self) -> bool {
        self.shared
            .pollers
            .lock()
            .await
            .active
            .values()
            .any(|p| p.is_full())
    }

    pub fn uptime(&self) -> Duration {
        self.shared.started_at.elapsed()
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Outcomes waiting for the database to come back.
    pub fn deferred_finalizations(&self) -> usize {
        self.shared.resilience.deferred_count()
    }

    /// Claimed instances whose start waits for the database to come back.
    pub fn deferred_starts(&self) -> usize {
        self.shared.resilience.deferred_start_count()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared.resilience.is_active()
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let db = &self.shared.db;
        let node_id = self.shared.node_id;
        let cumulative = db.count_history(node_id, None).await?;
        let since = Utc::now() - chrono::Duration::seconds(60);
        let last_minute = db.count_history(node_id, Some(since)).await?;
        let running = db.count_owned(node_id).await?;

        let pollers: Vec<_> = self.pollers().await.iter().map(|p| p.stats()).collect();
        Ok(EngineStats {
            node_name: self.shared.node_name.clone(),
            version: self.version(),
            uptime_secs: self.uptime().as_secs(),
            cumulative_job_instances: cumulative,
            job_instances_per_second: last_minute as f64 / 60.0,
            running_job_instances: running,
            all_pollers_polling: pollers.iter().all(|p| p.actually_polling),
            any_poller_full: pollers.iter().any(|p| p.full),
            paused: self.is_paused(),
            pollers,
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("node_name", &self.shared.node_name)
            .field("node_id", &self.shared.node_id)
            .field("stopping", &self.is_stopping())
            .field("ended", &self.has_ended())
            .finish()
    }
}
