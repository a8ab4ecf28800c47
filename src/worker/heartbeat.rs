use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::EngineShared;
use crate::error::DbError;

/// Node-internal poller: stamps the node liveness timestamp, watches the stop flag set in
/// the database, and periodically re-reads node and deployment configuration.
#[derive(Debug, Default)]
pub struct HeartbeatPoller {
    stop: CancellationToken,
    stopped: AtomicBool,
}

impl HeartbeatPoller {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn start(self: &Arc<Self>, engine: Arc<EngineShared>) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move { poller.run(engine).await })
    }

    async fn run(self: Arc<Self>, engine: Arc<EngineShared>) {
        let period = engine.heartbeat_interval();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_sync = Instant::now();
        tracing::debug!(
            node = %engine.node_name,
            period_ms = period.as_millis() as u64,
            "Heartbeat started"
        );

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.beat(&engine, &mut last_sync).await {
                Ok(()) => {}
                Err(e) if e.is_unreachable() && !self.stop.is_cancelled() => {
                    tracing::error!(
                        node = %engine.node_name,
                        error = %e,
                        "Heartbeat lost the database"
                    );
                    self.stopped.store(true, Ordering::SeqCst);
                    engine.resilience.heartbeat_restart_needed(&engine);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        node = %engine.node_name,
                        error = %e,
                        "Heartbeat iteration failed"
                    );
                }
            }
        }

        self.stopped.store(true, Ordering::SeqCst);
        tracing::debug!(node = %engine.node_name, "Heartbeat stopped");
        engine.check_engine_end().await;
    }

    async fn beat(
        &self,
        engine: &Arc<EngineShared>,
        last_sync: &mut Instant,
    ) -> Result<(), DbError> {
        engine.db.touch_node(engine.node_id, Utc::now()).await?;

        let node = engine.db.node(engine.node_id).await?;
        if node.stop_requested {
            if !engine.is_stopping() {
                tracing::info!(
                    node = %engine.node_name,
                    "Node received a stop order from the database"
                );
                engine.begin_stop().await;
            }
            return Ok(());
        }

        if last_sync.elapsed() >= engine.config.config_sync_interval {
            *last_sync = Instant::now();
            engine.refresh_configuration(node).await?;
        }
        Ok(())
    }
}
