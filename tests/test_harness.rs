//! Test harness for engine integration tests.
//!
//! Provides a seeded in-memory database, a set of test payloads and helpers to start engines
//! and wait on job instance outcomes.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobmesh::config::EngineConfig;
use jobmesh::db::{Database, DbResult, MemoryDatabase};
use jobmesh::engine::{Engine, EngineHandler};
use jobmesh::error::{DbError, PayloadError};
use jobmesh::model::{
    DeploymentParameter, History, JobDefinition, JobInstance, JobRequest, Node, Outcome,
    PayloadKind, Queue, State,
};
use jobmesh::worker::{payload_fn, JobContext, PayloadRegistry};
use tempfile::TempDir;

pub const DEFAULT_QUEUE: i64 = 1;

/// Engine configuration with short intervals for fast tests
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_config_sync_interval(Duration::from_millis(50))
        .with_kill_check_interval(Duration::from_millis(20))
        .with_kill_grace_period(Duration::from_millis(500))
        .with_child_wait_interval(Duration::from_millis(20))
        .with_resilience_backoff(Duration::from_millis(20), Duration::from_millis(100))
}

/// Records lifecycle hook calls.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub config_changes: AtomicUsize,
    pub preparing: AtomicUsize,
    pub done: Mutex<Vec<(i64, State)>>,
}

impl EngineHandler for RecordingHandler {
    fn on_node_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_node_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn on_configuration_changed(&self, _node: &Node) {
        self.config_changes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_job_instance_preparing(&self, _instance: &jobmesh::model::JobInstance) {
        self.preparing.fetch_add(1, Ordering::SeqCst);
    }

    fn on_job_instance_done(&self, history: &History) {
        self.done.lock().unwrap().push((history.id, history.state));
    }
}

/// A shared database with one queue, a delivery repository and the test payloads.
///
/// Registered in-process payloads:
/// - `ok`: sends the message "done"
/// - `fail`: fails with "boom"
/// - `panic`: panics
/// - `slow`: sleeps for the `ms` parameter (default 100)
/// - `record`: appends its instance id to [`TestCluster::started`]
/// - `sleep`: loops until killed, checking for kill requests
/// - `stubborn`: sleeps 30s and never checks for kill requests
pub struct TestCluster {
    pub db: Arc<MemoryDatabase>,
    pub repo: TempDir,
    pub payloads: PayloadRegistry,
    pub started: Arc<Mutex<Vec<i64>>>,
}

impl TestCluster {
    pub fn new() -> Self {
        let db = Arc::new(MemoryDatabase::new());
        db.add_queue(Queue::new(DEFAULT_QUEUE, "default")).unwrap();
        let started = Arc::new(Mutex::new(Vec::new()));
        let payloads = test_payloads(Arc::clone(&started));
        Self {
            db,
            repo: TempDir::new().unwrap(),
            payloads,
            started,
        }
    }

    pub fn gateway(&self) -> Arc<dyn Database> {
        self.db.clone()
    }

    pub fn add_node(&self, id: i64, name: &str) {
        self.db
            .add_node(Node::new(id, name, self.repo.path()))
            .unwrap();
    }

    pub fn add_queue(&self, id: i64, name: &str) {
        self.db.add_queue(Queue::new(id, name)).unwrap();
    }

    pub fn deploy(
        &self,
        id: i64,
        node_id: i64,
        queue_id: i64,
        max_threads: usize,
        polling_ms: u64,
    ) {
        self.db
            .add_deployment(id, node_id, queue_id, max_threads, polling_ms)
            .unwrap();
    }

    /// Defines an in-process job on the default queue.
    pub fn define(&self, id: i64, application_name: &str, payload: &str) -> JobDefinition {
        let definition = JobDefinition::new(
            id,
            application_name,
            PayloadKind::InProcess {
                name: payload.to_string(),
            },
            DEFAULT_QUEUE,
        );
        self.db.add_job_definition(definition.clone()).unwrap();
        definition
    }

    /// Defines a job running `sh -c <script>` on the default queue.
    pub fn define_shell(&self, id: i64, application_name: &str, script: &str) -> JobDefinition {
        let definition = JobDefinition::new(
            id,
            application_name,
            PayloadKind::External {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
            },
            DEFAULT_QUEUE,
        );
        self.db.add_job_definition(definition.clone()).unwrap();
        definition
    }

    pub async fn enqueue(&self, application_name: &str) -> i64 {
        self.db.enqueue(JobRequest::new(application_name)).await.unwrap()
    }

    pub async fn start_engine(&self, name: &str) -> Engine {
        self.start_engine_with(name, test_config()).await
    }

    pub async fn start_engine_with(&self, name: &str, config: EngineConfig) -> Engine {
        self.start_engine_on(name, self.gateway(), config).await
    }

    pub async fn start_engine_on(
        &self,
        name: &str,
        gateway: Arc<dyn Database>,
        config: EngineConfig,
    ) -> Engine {
        Engine::builder(gateway)
            .config(config)
            .payloads(self.payloads.clone())
            .start(name)
            .await
            .expect("engine should start")
    }

    pub fn live_state(&self, id: i64) -> Option<State> {
        self.db
            .live_instances()
            .unwrap()
            .into_iter()
            .find(|ji| ji.id == id)
            .map(|ji| ji.state)
    }

    pub fn history(&self, id: i64) -> Option<History> {
        self.db
            .history_rows()
            .unwrap()
            .into_iter()
            .find(|h| h.id == id)
    }

    pub fn history_count(&self, id: i64) -> usize {
        self.db
            .history_rows()
            .unwrap()
            .iter()
            .filter(|h| h.id == id)
            .count()
    }

    /// Instances attributed to or running on `node_id`.
    pub fn active_on(&self, node_id: i64) -> usize {
        self.db
            .live_instances()
            .unwrap()
            .iter()
            .filter(|ji| ji.node_id == Some(node_id) && ji.state.is_active())
            .count()
    }

    pub async fn wait_for_history(&self, id: i64, timeout: Duration) -> Option<History> {
        let found = wait_for(
            || async { self.history(id).is_some() },
            timeout,
            Duration::from_millis(10),
        )
        .await;
        if found {
            self.history(id)
        } else {
            None
        }
    }

    pub async fn wait_for_state(&self, id: i64, state: State, timeout: Duration) -> bool {
        wait_for(
            || async { self.live_state(id) == Some(state) },
            timeout,
            Duration::from_millis(5),
        )
        .await
    }
}

fn test_payloads(started: Arc<Mutex<Vec<i64>>>) -> PayloadRegistry {
    let payloads = PayloadRegistry::new();

    payloads.register(
        "ok",
        payload_fn(|ctx: JobContext| async move { ctx.send_msg("done").await }),
    );
    payloads.register(
        "fail",
        payload_fn(|_ctx: JobContext| async move { Err(PayloadError::Failed("boom".into())) }),
    );
    payloads.register("panic", payload_fn(explode));
    payloads.register(
        "slow",
        payload_fn(|ctx: JobContext| async move {
            let ms = ctx
                .parameter("ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(())
        }),
    );
    payloads.register(
        "record",
        payload_fn(move |ctx: JobContext| {
            let started = Arc::clone(&started);
            async move {
                started.lock().unwrap().push(ctx.job_instance_id());
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            }
        }),
    );
    payloads.register("sleep", payload_fn(sleep_until_killed));
    payloads.register(
        "stubborn",
        payload_fn(|_ctx: JobContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }),
    );

    payloads
}

async fn explode(_ctx: JobContext) -> Result<(), PayloadError> {
    panic!("payload exploded")
}

async fn sleep_until_killed(ctx: JobContext) -> Result<(), PayloadError> {
    loop {
        ctx.should_kill().await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Gateway over the cluster database that fails a chosen number of upcoming calls of one
/// kind, leaving every other call untouched.
pub struct FlakyGateway {
    inner: Arc<MemoryDatabase>,
    instance_reads: AtomicUsize,
    finalizations: AtomicUsize,
    finalize_error: Mutex<DbError>,
}

impl FlakyGateway {
    pub fn new(inner: Arc<MemoryDatabase>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            instance_reads: AtomicUsize::new(0),
            finalizations: AtomicUsize::new(0),
            finalize_error: Mutex::new(DbError::Unreachable("flaky".into())),
        })
    }

    /// The next `count` calls to `job_instance` fail as unreachable.
    pub fn fail_instance_reads(&self, count: usize) {
        self.instance_reads.store(count, Ordering::SeqCst);
    }

    /// The next `count` calls to `finalize` fail with `error`.
    pub fn fail_finalizations(&self, count: usize, error: DbError) {
        *self.finalize_error.lock().unwrap() = error;
        self.finalizations.store(count, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Database for FlakyGateway {
    async fn ping(&self) -> DbResult<()> {
        self.inner.ping().await
    }

    async fn global_parameter(&self, key: &str) -> DbResult<Option<String>> {
        self.inner.global_parameter(key).await
    }

    async fn node_by_name(&self, name: &str) -> DbResult<Option<Node>> {
        self.inner.node_by_name(name).await
    }

    async fn node(&self, node_id: i64) -> DbResult<Node> {
        self.inner.node(node_id).await
    }

    async fn claim_node_identity(
        &self,
        node_id: i64,
        expected: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        self.inner.claim_node_identity(node_id, expected, now).await
    }

    async fn touch_node(&self, node_id: i64, now: DateTime<Utc>) -> DbResult<()> {
        self.inner.touch_node(node_id, now).await
    }

    async fn release_node(&self, node_id: i64) -> DbResult<()> {
        self.inner.release_node(node_id).await
    }

    async fn request_node_stop(&self, node_id: i64) -> DbResult<()> {
        self.inner.request_node_stop(node_id).await
    }

    async fn deployments_for_node(&self, node_id: i64) -> DbResult<Vec<DeploymentParameter>> {
        self.inner.deployments_for_node(node_id).await
    }

    async fn job_definition(&self, job_def_id: i64) -> DbResult<JobDefinition> {
        self.inner.job_definition(job_def_id).await
    }

    async fn enqueue(&self, request: JobRequest) -> DbResult<i64> {
        self.inner.enqueue(request).await
    }

    async fn claim_instances(
        &self,
        queue_id: i64,
        node_id: i64,
        limit: usize,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<JobInstance>> {
        self.inner.claim_instances(queue_id, node_id, limit, now).await
    }

    async fn job_instance(&self, id: i64) -> DbResult<Option<JobInstance>> {
        if Self::take(&self.instance_reads) {
            return Err(DbError::Unreachable("flaky".into()));
        }
        self.inner.job_instance(id).await
    }

    async fn instances_owned_by(&self, node_id: i64) -> DbResult<Vec<JobInstance>> {
        self.inner.instances_owned_by(node_id).await
    }

    async fn mark_running(&self, id: i64, node_id: i64, now: DateTime<Utc>) -> DbResult<bool> {
        self.inner.mark_running(id, node_id, now).await
    }

    async fn finalize(&self, outcome: &Outcome) -> DbResult<()> {
        if Self::take(&self.finalizations) {
            return Err(self.finalize_error.lock().unwrap().clone());
        }
        self.inner.finalize(outcome).await
    }

    async fn add_message(&self, id: i64, text: &str) -> DbResult<()> {
        self.inner.add_message(id, text).await
    }

    async fn set_progress(&self, id: i64, progress: i32) -> DbResult<()> {
        self.inner.set_progress(id, progress).await
    }

    async fn add_deliverable(
        &self,
        id: i64,
        path: &Path,
        original_name: &str,
        label: &str,
    ) -> DbResult<i64> {
        self.inner.add_deliverable(id, path, original_name, label).await
    }

    async fn request_kill(&self, id: i64) -> DbResult<()> {
        self.inner.request_kill(id).await
    }

    async fn hold(&self, id: i64) -> DbResult<bool> {
        self.inner.hold(id).await
    }

    async fn resume(&self, id: i64) -> DbResult<bool> {
        self.inner.resume(id).await
    }

    async fn cancel(&self, id: i64) -> DbResult<bool> {
        self.inner.cancel(id).await
    }

    async fn count_live_children(&self, parent_id: i64) -> DbResult<usize> {
        self.inner.count_live_children(parent_id).await
    }

    async fn history(&self, id: i64) -> DbResult<Option<History>> {
        self.inner.history(id).await
    }

    async fn count_history(&self, node_id: i64, since: Option<DateTime<Utc>>) -> DbResult<u64> {
        self.inner.count_history(node_id, since).await
    }

    async fn count_owned(&self, node_id: i64) -> DbResult<u64> {
        self.inner.count_owned(node_id).await
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    condition().await
}
