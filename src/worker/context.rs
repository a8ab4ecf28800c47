//! The API a running payload uses to talk back to the engine.
//!
//! Every side-channel call first checks whether the instance was flagged for kill, so a
//! payload that keeps reporting progress is interruptible even if it never checks explicitly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::Database;
use crate::error::PayloadError;
use crate::model::{JobDefinition, JobInstance, JobRequest};

#[derive(Clone)]
pub struct JobContext {
    db: Arc<dyn Database>,
    instance: JobInstance,
    definition: JobDefinition,
    delivery_repo: PathBuf,
    work_dir_root: PathBuf,
    child_wait_interval: Duration,
    kill: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        db: Arc<dyn Database>,
        instance: JobInstance,
        definition: JobDefinition,
        delivery_repo: PathBuf,
        work_dir_root: PathBuf,
        child_wait_interval: Duration,
    ) -> Self {
        Self {
            db,
            instance,
            definition,
            delivery_repo,
            work_dir_root,
            child_wait_interval,
            kill: CancellationToken::new(),
        }
    }

    pub fn job_instance_id(&self) -> i64 {
        self.instance.id
    }

    pub fn parent_id(&self) -> Option<i64> {
        self.instance.parent_id
    }

    pub fn application_name(&self) -> &str {
        &self.definition.application_name
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    pub fn session_id(&self) -> Option<&str> {
        self.instance.session_id.as_deref()
    }

    pub fn user_name(&self) -> Option<&str> {
        self.instance.user_name.as_deref()
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.instance.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.instance.parameters.get(key).map(String::as_str)
    }

    /// True once a kill was requested. Does not touch the database.
    pub fn is_killed(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Token cancelled when the instance is killed, for use in `tokio::select!`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Re-reads the instance and fails with [`PayloadError::Killed`] if a kill was requested.
    pub async fn should_kill(&self) -> Result<(), PayloadError> {
        if self.kill.is_cancelled() {
            return Err(PayloadError::Killed(self.instance.id));
        }
        match self.db.job_instance(self.instance.id).await {
            Ok(Some(ji)) if ji.kill_requested => {
                tracing::info!(
                    job_instance_id = ji.id,
                    "Job will be killed at the request of a user"
                );
                self.kill.cancel();
                Err(PayloadError::Killed(ji.id))
            }
            Ok(_) => Ok(()),
            Err(e) if e.is_unreachable() => {
                tracing::warn!(
                    job_instance_id = self.instance.id,
                    error = %e,
                    "Kill check skipped, database unreachable"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn send_msg(&self, text: &str) -> Result<(), PayloadError> {
        self.should_kill().await?;
        self.db.add_message(self.instance.id, text).await?;
        Ok(())
    }

    pub async fn send_progress(&self, progress: i32) -> Result<(), PayloadError> {
        self.should_kill().await?;
        self.db.set_progress(self.instance.id, progress).await?;
        Ok(())
    }

    /// Enqueues a child of this instance. Unset session, user, application and module are
    /// inherited from the parent.
    pub async fn enqueue(&self, mut request: JobRequest) -> Result<i64, PayloadError> {
        self.should_kill().await?;
        request.parent_id = Some(self.instance.id);
        if request.session_id.is_none() {
            request.session_id = self.instance.session_id.clone();
        }
        if request.user_name.is_none() {
            request.user_name = self.instance.user_name.clone();
        }
        if request.application.is_none() {
            request.application = self.definition.application.clone();
        }
        if request.module.is_none() {
            request.module = self.definition.module.clone();
        }
        let id = self.db.enqueue(request).await?;
        tracing::debug!(job_instance_id = self.instance.id, child_id = id, "Child job enqueued");
        Ok(id)
    }

    /// Enqueues a child and waits until it reaches a terminal state.
    pub async fn enqueue_sync(&self, request: JobRequest) -> Result<i64, PayloadError> {
        let id = self.enqueue(request).await?;
        self.wait_child(id).await?;
        Ok(id)
    }

    /// Waits until instance `id` has left the live table.
    pub async fn wait_child(&self, id: i64) -> Result<(), PayloadError> {
        while self.db.job_instance(id).await?.is_some() {
            self.pause_between_checks().await?;
        }
        Ok(())
    }

    /// Waits until every child of this instance has left the live table.
    pub async fn wait_children(&self) -> Result<(), PayloadError> {
        while self.db.count_live_children(self.instance.id).await? > 0 {
            self.pause_between_checks().await?;
        }
        Ok(())
    }

    async fn pause_between_checks(&self) -> Result<(), PayloadError> {
        tokio::select! {
            _ = tokio::time::sleep(self.child_wait_interval) => {}
            _ = self.kill.cancelled() => {}
        }
        self.should_kill().await
    }

    /// Moves `path` into the node's delivery repository and records it as a deliverable.
    pub async fn add_deliverable(&self, path: &Path, label: &str) -> Result<i64, PayloadError> {
        self.should_kill().await?;

        let original_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = match path.extension() {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext.to_string_lossy()),
            None => Uuid::new_v4().to_string(),
        };
        let dest_dir = self
            .delivery_repo
            .join(&self.definition.application_name)
            .join(self.instance.id.to_string());
        let dest = dest_dir.join(file_name);

        tokio::fs::create_dir_all(&dest_dir).await?;
        if tokio::fs::rename(path, &dest).await.is_err() {
            // Cross-device move.
            tokio::fs::copy(path, &dest).await?;
            tokio::fs::remove_file(path).await?;
        }
        tracing::debug!(
            job_instance_id = self.instance.id,
            stored_as = %dest.display(),
            original_name = %original_name,
            "Deliverable added"
        );

        let id = self
            .db
            .add_deliverable(self.instance.id, &dest, &original_name, label)
            .await?;
        Ok(id)
    }

    /// Scratch directory dedicated to this instance, created on first call.
    pub async fn work_dir(&self) -> Result<PathBuf, PayloadError> {
        let dir = self.work_dir_root.join(self.instance.id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub(crate) fn kill_token(&self) -> &CancellationToken {
        &self.kill
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_instance_id", &self.instance.id)
            .field("application_name", &self.definition.application_name)
            .field("killed", &self.kill.is_cancelled())
            .finish()
    }
}
