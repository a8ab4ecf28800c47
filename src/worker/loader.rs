//! Runs one claimed job instance from preparation to its History row.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;

use crate::engine::EngineShared;
use crate::error::{DbError, PayloadError};
use crate::model::{JobDefinition, JobInstance, Outcome, PayloadKind, State};
use crate::scheduler::poller::SlotGuard;
use crate::worker::context::JobContext;

pub(crate) const KILLED_MESSAGE: &str = "Job was killed at the request of a user";

/// Recorded when a start interrupted by an outage finds the instance already running.
pub(crate) const UNCONFIRMED_START_MESSAGE: &str =
    "Job instance start could not be confirmed before the database was lost";

/// An outcome computed while the database was down. Holds the poller slot until it is stored.
#[derive(Debug)]
pub(crate) struct DeferredFinalization {
    pub(crate) outcome: Outcome,
    slot: SlotGuard,
}

impl DeferredFinalization {
    pub(crate) fn job_instance_id(&self) -> i64 {
        self.outcome.instance.id
    }

    /// Stores the outcome. Gives itself back if the database is still unreachable.
    pub(crate) async fn complete(self, engine: &EngineShared) -> Result<(), DeferredFinalization> {
        match Loader::store(engine, &self.outcome).await {
            Ok(()) => {
                tracing::info!(
                    job_instance_id = self.job_instance_id(),
                    state = %self.outcome.state,
                    "Deferred job instance result stored"
                );
                Ok(())
            }
            Err(e) if e.is_unreachable() => Err(self),
            Err(e) => match Loader::store_fallback(engine, &self.outcome, &e).await {
                Err(e) if e.is_unreachable() => Err(self),
                _ => Ok(()),
            },
        }
    }
}

/// A claimed instance whose preparation lost the database before the payload started.
/// Holds the poller slot until it is started again.
#[derive(Debug)]
pub(crate) struct DeferredStart {
    claimed: JobInstance,
    slot: SlotGuard,
}

impl DeferredStart {
    pub(crate) fn job_instance_id(&self) -> i64 {
        self.claimed.id
    }

    pub(crate) fn resume(self, engine: &Arc<EngineShared>) {
        tracing::info!(job_instance_id = self.job_instance_id(), "Starting deferred job instance");
        let engine = Arc::clone(engine);
        tokio::spawn(async move { Loader::run(engine, self.claimed, self.slot, true).await });
    }
}

pub(crate) struct Loader;

impl Loader {
    pub(crate) fn spawn(engine: Arc<EngineShared>, claimed: JobInstance, slot: SlotGuard) {
        tokio::spawn(async move { Self::run(engine, claimed, slot, false).await });
    }

    async fn run(engine: Arc<EngineShared>, claimed: JobInstance, slot: SlotGuard, resumed: bool) {
        let job_instance_id = claimed.id;
        let outcome = match Self::prepare_and_run(&engine, claimed.clone(), resumed).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return,
            Err(e) if e.is_unreachable() => {
                tracing::warn!(
                    job_instance_id,
                    error = %e,
                    "Database unreachable before start, the job instance will start once it is back"
                );
                engine
                    .resilience
                    .loader_start_needed(&engine, DeferredStart { claimed, slot });
                return;
            }
            Err(e) => {
                tracing::error!(job_instance_id, error = %e, "Job instance could not be prepared");
                Outcome::new(claimed, State::Crashed)
                    .with_message(format!("Job instance could not be prepared: {e}"))
            }
        };
        Self::finalize(&engine, outcome, slot).await;
    }

    /// `None` when the instance is no longer ours to run.
    async fn prepare_and_run(
        engine: &Arc<EngineShared>,
        claimed: JobInstance,
        resumed: bool,
    ) -> Result<Option<Outcome>, DbError> {
        let db = &engine.db;
        let mut instance = match db.job_instance(claimed.id).await? {
            Some(ji) if ji.state == State::Attributed && ji.node_id == Some(engine.node_id) => ji,
            // The start went through but its answer was lost: the payload may or may not have
            // begun, so it is not run a second time.
            Some(ji)
                if resumed && ji.state == State::Running && ji.node_id == Some(engine.node_id) =>
            {
                tracing::warn!(
                    job_instance_id = ji.id,
                    "Deferred job instance was already marked running"
                );
                return Ok(Some(
                    Outcome::new(ji, State::Crashed).with_message(UNCONFIRMED_START_MESSAGE),
                ));
            }
            other => {
                tracing::debug!(
                    job_instance_id = claimed.id,
                    state = ?other.map(|ji| ji.state),
                    "Job instance is no longer attributed to this node, skipping"
                );
                return Ok(None);
            }
        };

        let definition = db.job_definition(instance.job_def_id).await?;
        engine.handler.on_job_instance_preparing(&instance);

        let now = Utc::now();
        if !db.mark_running(instance.id, engine.node_id, now).await? {
            tracing::debug!(
                job_instance_id = instance.id,
                "Job instance changed before start, skipping"
            );
            return Ok(None);
        }
        instance.state = State::Running;
        instance.begun_at = Some(now);

        let mut parameters = definition.parameters.clone();
        parameters.extend(instance.parameters.drain());
        instance.parameters = parameters;

        tracing::info!(
            job_instance_id = instance.id,
            application = %definition.application_name,
            "Job instance starting"
        );

        let ctx = JobContext::new(
            Arc::clone(db),
            instance.clone(),
            definition.clone(),
            engine.delivery_repo(),
            engine.work_dir_root(),
            engine.config.child_wait_interval,
        );
        let started = Instant::now();
        let result = Self::supervise(engine, &ctx, &definition).await;

        let outcome = match result {
            Ok(()) => Outcome::new(instance, State::Ended),
            Err(PayloadError::Killed(_)) => {
                Outcome::new(instance, State::Killed).with_message(KILLED_MESSAGE)
            }
            Err(_) if ctx.is_killed() => {
                Outcome::new(instance, State::Killed).with_message(KILLED_MESSAGE)
            }
            Err(e) => {
                tracing::warn!(
                    job_instance_id = ctx.job_instance_id(),
                    error = %e,
                    "Job instance failed"
                );
                Outcome::new(instance, State::Crashed).with_message(e.to_string())
            }
        };
        tracing::info!(
            job_instance_id = ctx.job_instance_id(),
            state = %outcome.state,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job instance finished"
        );
        Ok(Some(outcome))
    }

    /// Runs the payload while watching for kill requests and the max-runtime alert.
    async fn supervise(
        engine: &Arc<EngineShared>,
        ctx: &JobContext,
        definition: &JobDefinition,
    ) -> Result<(), PayloadError> {
        let job_instance_id = ctx.job_instance_id();
        let mut run = Self::launch(engine, ctx.clone(), definition);

        let mut ticker = tokio::time::interval(engine.config.kill_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let max_runtime = definition
            .max_time_running_min
            .map(|min| Duration::from_secs(u64::from(min) * 60));
        let started = Instant::now();
        let mut alerted = false;

        loop {
            tokio::select! {
                joined = &mut run => return joined_result(joined),
                _ = ctx.kill_token().cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(max) = max_runtime {
                        if !alerted && started.elapsed() >= max {
                            alerted = true;
                            Self::raise_runtime_alert(engine, job_instance_id, max).await;
                        }
                    }
                    match engine.db.job_instance(job_instance_id).await {
                        Ok(Some(ji)) if ji.kill_requested => {
                            tracing::info!(job_instance_id, "Kill requested, interrupting payload");
                            ctx.kill_token().cancel();
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(job_instance_id, error = %e, "Kill check failed");
                        }
                    }
                }
            }
        }

        match tokio::time::timeout(engine.config.kill_grace_period, &mut run).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(
                    job_instance_id,
                    grace_ms = engine.config.kill_grace_period.as_millis() as u64,
                    "Payload ignored the kill request, aborting it"
                );
                run.abort();
            }
        }
        Err(PayloadError::Killed(job_instance_id))
    }

    fn launch(
        engine: &Arc<EngineShared>,
        ctx: JobContext,
        definition: &JobDefinition,
    ) -> JoinHandle<Result<(), PayloadError>> {
        match &definition.payload {
            PayloadKind::InProcess { name } => match engine.payloads.get(name) {
                Some(payload) => tokio::spawn(async move { payload.run(ctx).await }),
                None => {
                    let err = PayloadError::Launch(format!("no payload registered as '{name}'"));
                    tokio::spawn(async move { Err(err) })
                }
            },
            PayloadKind::External { program, args } => {
                let executor = engine.executor.clone();
                let program = program.clone();
                let args = args.clone();
                tokio::spawn(async move {
                    executor.execute(&ctx, &program, &args).await?.into_result()
                })
            }
        }
    }

    async fn raise_runtime_alert(engine: &EngineShared, job_instance_id: i64, max: Duration) {
        let minutes = max.as_secs() / 60;
        tracing::warn!(
            job_instance_id,
            max_minutes = minutes,
            "Job instance exceeded its maximum run time"
        );
        let text = format!("Job has been running for more than {minutes} minutes");
        if let Err(e) = engine.db.add_message(job_instance_id, &text).await {
            tracing::warn!(job_instance_id, error = %e, "Run time alert could not be recorded");
        }
    }

    /// Writes the outcome and notifies the handler.
    async fn store(engine: &EngineShared, outcome: &Outcome) -> Result<(), DbError> {
        engine.db.finalize(outcome).await?;
        engine.handler.on_job_instance_done(&outcome.history());
        Ok(())
    }

    /// Last resort when an outcome is refused: a bare `CRASHED` record without its messages.
    /// If even that fails the live row stays until the next startup purge of this node.
    async fn store_fallback(
        engine: &EngineShared,
        outcome: &Outcome,
        cause: &DbError,
    ) -> Result<(), DbError> {
        let job_instance_id = outcome.instance.id;
        let fallback = Outcome::new(outcome.instance.clone(), State::Crashed)
            .with_message(format!("Job instance result could not be stored: {cause}"));
        let result = Self::store(engine, &fallback).await;
        match &result {
            Ok(()) => tracing::warn!(
                job_instance_id,
                error = %cause,
                "Job instance result refused, recorded as crashed"
            ),
            Err(e) => tracing::error!(
                job_instance_id,
                error = %e,
                "Job instance could not be finalized, it stays live until the node restarts"
            ),
        }
        result
    }

    async fn finalize(engine: &Arc<EngineShared>, outcome: Outcome, slot: SlotGuard) {
        let job_instance_id = outcome.instance.id;
        let mut result = Self::store(engine, &outcome).await;
        if let Err(e) = &result {
            if !e.is_unreachable() {
                tracing::warn!(
                    job_instance_id,
                    error = %e,
                    "Job instance result not stored, retrying"
                );
                tokio::time::sleep(engine.config.kill_check_interval).await;
                result = Self::store(engine, &outcome).await;
            }
        }

        let deferred = match result {
            Ok(()) => return,
            Err(e) if e.is_unreachable() => outcome,
            Err(e) => match Self::store_fallback(engine, &outcome, &e).await {
                Err(e) if e.is_unreachable() => outcome,
                _ => return,
            },
        };
        tracing::warn!(
            job_instance_id,
            state = %deferred.state,
            "Database unreachable, job instance result will be stored once it is back"
        );
        engine.resilience.loader_finalization_needed(
            engine,
            DeferredFinalization {
                outcome: deferred,
                slot,
            },
        );
    }
}

fn joined_result(joined: Result<Result<(), PayloadError>, JoinError>) -> Result<(), PayloadError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(PayloadError::Failed(format!("payload panicked: {e}"))),
        Err(e) => Err(PayloadError::Failed(e.to_string())),
    }
}
