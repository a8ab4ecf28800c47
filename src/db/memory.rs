//! In-memory gateway for tests and local runs.
//!
//! One mutex guards all tables, which makes every trait method a serializable transaction.
//! [`MemoryDatabase::set_reachable`] simulates an outage: while unreachable every call fails
//! with [`DbError::Unreachable`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Database, DbResult};
use crate::error::DbError;
use crate::model::{
    Deliverable, DeploymentParameter, History, JobDefinition, JobInstance, JobRequest, Message,
    Node, Outcome, Queue, State,
};

#[derive(Debug, Default)]
struct Tables {
    global_parameters: HashMap<String, String>,
    nodes: BTreeMap<i64, Node>,
    queues: BTreeMap<i64, Queue>,
    deployments: BTreeMap<i64, DeploymentParameter>,
    job_definitions: BTreeMap<i64, JobDefinition>,
    instances: BTreeMap<i64, JobInstance>,
    history: BTreeMap<i64, History>,
    messages: Vec<Message>,
    deliverables: Vec<Deliverable>,
    next_instance_id: i64,
    next_position: i64,
    next_deliverable_id: i64,
}

#[derive(Debug)]
pub struct MemoryDatabase {
    tables: Mutex<Tables>,
    reachable: AtomicBool,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                next_instance_id: 1,
                next_position: 1,
                next_deliverable_id: 1,
                ..Default::default()
            }),
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulates losing (`false`) or regaining (`true`) the database.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn tables(&self) -> DbResult<MutexGuard<'_, Tables>> {
        if !self.is_reachable() {
            return Err(DbError::Unreachable("connection refused".to_string()));
        }
        self.seed()
    }

    /// Table access that ignores the outage switch, used for provisioning and inspection.
    fn seed(&self) -> DbResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| DbError::Query("memory database lock poisoned".to_string()))
    }

    // Provisioning and inspection helpers. These bypass the outage switch.

    pub fn set_global_parameter(&self, key: &str, value: &str) -> DbResult<()> {
        self.seed()?
            .global_parameters
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn add_node(&self, node: Node) -> DbResult<()> {
        self.seed()?.nodes.insert(node.id, node);
        Ok(())
    }

    pub fn update_node<F: FnOnce(&mut Node)>(&self, node_id: i64, update: F) -> DbResult<()> {
        let mut t = self.seed()?;
        let node = t
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| DbError::NotFound(format!("node {node_id}")))?;
        update(node);
        Ok(())
    }

    pub fn add_queue(&self, queue: Queue) -> DbResult<()> {
        self.seed()?.queues.insert(queue.id, queue);
        Ok(())
    }

    pub fn add_deployment(
        &self,
        id: i64,
        node_id: i64,
        queue_id: i64,
        max_concurrent_threads: usize,
        polling_interval_ms: u64,
    ) -> DbResult<()> {
        let mut t = self.seed()?;
        let queue = t
            .queues
            .get(&queue_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("queue {queue_id}")))?;
        t.deployments.insert(
            id,
            DeploymentParameter {
                id,
                node_id,
                queue,
                max_concurrent_threads,
                polling_interval_ms,
            },
        );
        Ok(())
    }

    pub fn remove_deployment(&self, id: i64) -> DbResult<()> {
        self.seed()?.deployments.remove(&id);
        Ok(())
    }

    pub fn add_job_definition(&self, definition: JobDefinition) -> DbResult<()> {
        self.seed()?
            .job_definitions
            .insert(definition.id, definition);
        Ok(())
    }

    /// Inserts a raw live row, e.g. to simulate what a crashed node left behind.
    pub fn insert_instance(&self, instance: JobInstance) -> DbResult<()> {
        let mut t = self.seed()?;
        t.next_instance_id = t.next_instance_id.max(instance.id + 1);
        t.next_position = t.next_position.max(instance.position + 1);
        t.instances.insert(instance.id, instance);
        Ok(())
    }

    pub fn live_instances(&self) -> DbResult<Vec<JobInstance>> {
        Ok(self.seed()?.instances.values().cloned().collect())
    }

    pub fn history_rows(&self) -> DbResult<Vec<History>> {
        Ok(self.seed()?.history.values().cloned().collect())
    }

    pub fn messages_for(&self, id: i64) -> DbResult<Vec<String>> {
        Ok(self
            .seed()?
            .messages
            .iter()
            .filter(|m| m.job_instance_id == id)
            .map(|m| m.text.clone())
            .collect())
    }

    pub fn deliverables_for(&self, id: i64) -> DbResult<Vec<Deliverable>> {
        Ok(self
            .seed()?
            .deliverables
            .iter()
            .filter(|d| d.job_instance_id == id)
            .cloned()
            .collect())
    }

    pub fn node_snapshot(&self, node_id: i64) -> DbResult<Node> {
        self.seed()?
            .nodes
            .get(&node_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("node {node_id}")))
    }
}

impl Tables {
    fn live_mut(&mut self, id: i64) -> DbResult<&mut JobInstance> {
        self.instances
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job instance {id}")))
    }

    fn is_highlander(&self, job_def_id: i64) -> bool {
        self.job_definitions
            .get(&job_def_id)
            .map(|d| d.highlander)
            .unwrap_or(false)
    }

    fn write_history(&mut self, history: History, messages: &[String]) {
        if self.history.contains_key(&history.id) {
            return;
        }
        for text in messages {
            self.messages.push(Message {
                job_instance_id: history.id,
                text: text.clone(),
            });
        }
        self.history.insert(history.id, history);
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn ping(&self) -> DbResult<()> {
        self.tables().map(|_| ())
    }

    async fn global_parameter(&self, key: &str) -> DbResult<Option<String>> {
        Ok(self.tables()?.global_parameters.get(key).cloned())
    }

    async fn node_by_name(&self, name: &str) -> DbResult<Option<Node>> {
        Ok(self
            .tables()?
            .nodes
            .values()
            .find(|n| n.name == name)
            .cloned())
    }

    async fn node(&self, node_id: i64) -> DbResult<Node> {
        self.tables()?
            .nodes
            .get(&node_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("node {node_id}")))
    }

    async fn claim_node_identity(
        &self,
        node_id: i64,
        expected: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut t = self.tables()?;
        let node = t
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| DbError::NotFound(format!("node {node_id}")))?;
        if node.last_seen_alive != expected {
            return Ok(false);
        }
        node.last_seen_alive = Some(now);
        Ok(true)
    }

    async fn touch_node(&self, node_id: i64, now: DateTime<Utc>) -> DbResult<()> {
        let mut t = self.tables()?;
        let node = t
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| DbError::NotFound(format!("node {node_id}")))?;
        node.last_seen_alive = Some(now);
        Ok(())
    }

    async fn release_node(&self, node_id: i64) -> DbResult<()> {
        let mut t = self.tables()?;
        let node = t
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| DbError::NotFound(format!("node {node_id}")))?;
        node.stop_requested = false;
        node.last_seen_alive = None;
        Ok(())
    }

    async fn request_node_stop(&self, node_id: i64) -> DbResult<()> {
        let mut t = self.tables()?;
        let node = t
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| DbError::NotFound(format!("node {node_id}")))?;
        node.stop_requested = true;
        Ok(())
    }

    async fn deployments_for_node(&self, node_id: i64) -> DbResult<Vec<DeploymentParameter>> {
        Ok(self
            .tables()?
            .deployments
            .values()
            .filter(|d| d.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn job_definition(&self, job_def_id: i64) -> DbResult<JobDefinition> {
        self.tables()?
            .job_definitions
            .get(&job_def_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job definition {job_def_id}")))
    }

    async fn enqueue(&self, request: JobRequest) -> DbResult<i64> {
        let mut t = self.tables()?;
        let definition = t
            .job_definitions
            .values()
            .find(|d| d.application_name == request.application_name)
            .cloned()
            .ok_or_else(|| {
                DbError::NotFound(format!("job definition {}", request.application_name))
            })?;

        let mut parameters = definition.parameters.clone();
        parameters.extend(request.parameters);

        let id = t.next_instance_id;
        t.next_instance_id += 1;
        let position = t.next_position;
        t.next_position += 1;

        let mut instance = JobInstance::new(id, &definition);
        instance.position = position;
        if let Some(queue_id) = request.queue_id {
            instance.queue_id = queue_id;
        }
        if let Some(priority) = request.priority {
            instance.priority = priority;
        }
        if request.start_held {
            instance.state = State::Holded;
        }
        instance.run_after = request.run_after;
        instance.parameters = parameters;
        instance.session_id = request.session_id;
        instance.user_name = request.user_name;
        instance.application = request.application.or(definition.application);
        instance.module = request.module.or(definition.module);
        instance.parent_id = request.parent_id;
        t.instances.insert(id, instance);
        Ok(id)
    }

    async fn claim_instances(
        &self,
        queue_id: i64,
        node_id: i64,
        limit: usize,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<JobInstance>> {
        let mut t = self.tables()?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut blocked: HashSet<i64> = t
            .instances
            .values()
            .filter(|ji| ji.state.is_active() && t.is_highlander(ji.job_def_id))
            .map(|ji| ji.job_def_id)
            .collect();

        let mut candidates: Vec<(i32, i64, DateTime<Utc>, i64, i64)> = t
            .instances
            .values()
            .filter(|ji| {
                ji.state == State::Submitted
                    && ji.queue_id == queue_id
                    && ji.run_after.map_or(true, |at| at <= now)
            })
            .map(|ji| (ji.priority, ji.position, ji.enqueued_at, ji.id, ji.job_def_id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut claimed = Vec::new();
        for (_, _, _, id, job_def_id) in candidates {
            if claimed.len() >= limit {
                break;
            }
            if t.is_highlander(job_def_id) && !blocked.insert(job_def_id) {
                continue;
            }
            let ji = t.live_mut(id)?;
            ji.state = State::Attributed;
            ji.node_id = Some(node_id);
            ji.attributed_at = Some(now);
            claimed.push(ji.clone());
        }
        Ok(claimed)
    }

    async fn job_instance(&self, id: i64) -> DbResult<Option<JobInstance>> {
        Ok(self.tables()?.instances.get(&id).cloned())
    }

    async fn instances_owned_by(&self, node_id: i64) -> DbResult<Vec<JobInstance>> {
        Ok(self
            .tables()?
            .instances
            .values()
            .filter(|ji| ji.node_id == Some(node_id))
            .cloned()
            .collect())
    }

    async fn mark_running(&self, id: i64, node_id: i64, now: DateTime<Utc>) -> DbResult<bool> {
        let mut t = self.tables()?;
        match t.instances.get_mut(&id) {
            Some(ji) if ji.state == State::Attributed && ji.node_id == Some(node_id) => {
                ji.state = State::Running;
                ji.begun_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize(&self, outcome: &Outcome) -> DbResult<()> {
        let mut t = self.tables()?;
        let id = outcome.instance.id;
        let live = t.instances.remove(&id);
        let source = live.as_ref().unwrap_or(&outcome.instance);
        let history = History::from_instance(source, outcome.state, outcome.ended_at);
        t.write_history(history, &outcome.messages);
        Ok(())
    }

    async fn add_message(&self, id: i64, text: &str) -> DbResult<()> {
        self.tables()?.messages.push(Message {
            job_instance_id: id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn set_progress(&self, id: i64, progress: i32) -> DbResult<()> {
        self.tables()?.live_mut(id)?.progress = Some(progress);
        Ok(())
    }

    async fn add_deliverable(
        &self,
        id: i64,
        path: &Path,
        original_name: &str,
        label: &str,
    ) -> DbResult<i64> {
        let mut t = self.tables()?;
        let deliverable_id = t.next_deliverable_id;
        t.next_deliverable_id += 1;
        t.deliverables.push(Deliverable {
            id: deliverable_id,
            job_instance_id: id,
            path: path.to_path_buf(),
            original_name: original_name.to_string(),
            label: label.to_string(),
        });
        Ok(deliverable_id)
    }

    async fn request_kill(&self, id: i64) -> DbResult<()> {
        self.tables()?.live_mut(id)?.kill_requested = true;
        Ok(())
    }

    async fn hold(&self, id: i64) -> DbResult<bool> {
        let mut t = self.tables()?;
        let ji = t.live_mut(id)?;
        if ji.state != State::Submitted {
            return Ok(false);
        }
        ji.state = State::Holded;
        Ok(true)
    }

    async fn resume(&self, id: i64) -> DbResult<bool> {
        let mut t = self.tables()?;
        let ji = t.live_mut(id)?;
        if ji.state != State::Holded {
            return Ok(false);
        }
        ji.state = State::Submitted;
        Ok(true)
    }

    async fn cancel(&self, id: i64) -> DbResult<bool> {
        let mut t = self.tables()?;
        let cancellable = matches!(
            t.instances.get(&id).map(|ji| ji.state),
            Some(State::Submitted | State::Attributed | State::Holded)
        );
        if !cancellable {
            return Ok(false);
        }
        if let Some(ji) = t.instances.remove(&id) {
            let history = History::from_instance(&ji, State::Cancelled, Utc::now());
            t.write_history(history, &[]);
        }
        Ok(true)
    }

    async fn count_live_children(&self, parent_id: i64) -> DbResult<usize> {
        Ok(self
            .tables()?
            .instances
            .values()
            .filter(|ji| ji.parent_id == Some(parent_id))
            .count())
    }

    async fn history(&self, id: i64) -> DbResult<Option<History>> {
        Ok(self.tables()?.history.get(&id).cloned())
    }

    async fn count_history(&self, node_id: i64, since: Option<DateTime<Utc>>) -> DbResult<u64> {
        Ok(self
            .tables()?
            .history
            .values()
            .filter(|h| h.node_id == Some(node_id))
            .filter(|h| since.map_or(true, |s| h.ended_at >= s))
            .count() as u64)
    }

    async fn count_owned(&self, node_id: i64) -> DbResult<u64> {
        Ok(self
            .tables()?
            .instances
            .values()
            .filter(|ji| ji.node_id == Some(node_id))
            .count() as u64)
    }
}
