//! Database gateway consumed by the engine.
//!
//! The shared database is the only coordination channel between nodes. Every method is one
//! transaction; the engine never holds an in-process lock across nodes. In particular
//! [`Database::claim_instances`] must be a single conditional update so that two pollers
//! racing for the same row can never both win it.

pub mod memory;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DbError;
use crate::model::{
    DeploymentParameter, History, JobDefinition, JobInstance, JobRequest, Node, Outcome,
};

pub use memory::MemoryDatabase;

pub type DbResult<T> = std::result::Result<T, DbError>;

#[async_trait]
pub trait Database: Send + Sync {
    /// Trivial read, used to probe liveness after an outage.
    async fn ping(&self) -> DbResult<()>;

    async fn global_parameter(&self, key: &str) -> DbResult<Option<String>>;

    async fn node_by_name(&self, name: &str) -> DbResult<Option<Node>>;

    async fn node(&self, node_id: i64) -> DbResult<Node>;

    /// Stamps `last_seen_alive = now` only if it still equals `expected`.
    /// Returns false when another process stamped it in between.
    async fn claim_node_identity(
        &self,
        node_id: i64,
        expected: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DbResult<bool>;

    /// Heartbeat.
    async fn touch_node(&self, node_id: i64, now: DateTime<Utc>) -> DbResult<()>;

    /// Clears the stop flag and the heartbeat so the name can be reused.
    async fn release_node(&self, node_id: i64) -> DbResult<()>;

    async fn request_node_stop(&self, node_id: i64) -> DbResult<()>;

    async fn deployments_for_node(&self, node_id: i64) -> DbResult<Vec<DeploymentParameter>>;

    async fn job_definition(&self, job_def_id: i64) -> DbResult<JobDefinition>;

    /// Creates a `Submitted` (or `Holded`) instance and returns its id.
    async fn enqueue(&self, request: JobRequest) -> DbResult<i64>;

    /// Atomically moves up to `limit` eligible instances of `queue_id` from `Submitted` to
    /// `Attributed`, owned by `node_id`.
    ///
    /// Eligible: `Submitted`, on this queue, `run_after` passed, and no other instance of the
    /// same highlander definition `Attributed` or `Running`. Ordered by priority desc, then
    /// position asc, then enqueue time asc.
    async fn claim_instances(
        &self,
        queue_id: i64,
        node_id: i64,
        limit: usize,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<JobInstance>>;

    /// Live instance, or `None` once it has been finalized.
    async fn job_instance(&self, id: i64) -> DbResult<Option<JobInstance>>;

    async fn instances_owned_by(&self, node_id: i64) -> DbResult<Vec<JobInstance>>;

    /// `Attributed -> Running` for the owning node. False if the row moved on.
    async fn mark_running(&self, id: i64, node_id: i64, now: DateTime<Utc>) -> DbResult<bool>;

    /// Writes the History row (unless it already exists) and its messages, and deletes the
    /// live row. Idempotent.
    async fn finalize(&self, outcome: &Outcome) -> DbResult<()>;

    async fn add_message(&self, id: i64, text: &str) -> DbResult<()>;

    async fn set_progress(&self, id: i64, progress: i32) -> DbResult<()>;

    async fn add_deliverable(
        &self,
        id: i64,
        path: &Path,
        original_name: &str,
        label: &str,
    ) -> DbResult<i64>;

    async fn request_kill(&self, id: i64) -> DbResult<()>;

    /// `Submitted -> Holded`. False if the instance was not `Submitted`.
    async fn hold(&self, id: i64) -> DbResult<bool>;

    /// `Holded -> Submitted`. False if the instance was not `Holded`.
    async fn resume(&self, id: i64) -> DbResult<bool>;

    /// Removes a `Submitted`/`Attributed`/`Holded` instance into a `Cancelled` History row.
    async fn cancel(&self, id: i64) -> DbResult<bool>;

    async fn count_live_children(&self, parent_id: i64) -> DbResult<usize>;

    async fn history(&self, id: i64) -> DbResult<Option<History>>;

    /// Finished instances run by a node, optionally only those ended since `since`.
    async fn count_history(&self, node_id: i64, since: Option<DateTime<Utc>>) -> DbResult<u64>;

    async fn count_owned(&self, node_id: i64) -> DbResult<u64>;
}
