use std::path::PathBuf;
use std::time::Duration;

/// Global parameter that overrides [`EngineConfig::heartbeat_interval`] cluster-wide.
pub const HEARTBEAT_PARAMETER: &str = "heartbeat_interval_ms";

/// Tunables of a node engine.
///
/// Queue-level settings (concurrency, polling interval) live in the database as deployment
/// parameters; everything here is process-local.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the node stamps its liveness timestamp. A node whose stamp is younger than
    /// twice this value is considered alive.
    pub heartbeat_interval: Duration,
    /// How often node and deployment configuration is re-read from the database.
    pub config_sync_interval: Duration,
    /// How often a running job instance is checked for a kill request.
    pub kill_check_interval: Duration,
    /// How long a killed in-process payload may take to return before it is dropped.
    pub kill_grace_period: Duration,
    /// Polling interval used by payloads waiting for child job instances.
    pub child_wait_interval: Duration,
    /// Increment of the database reconnection backoff (1x, 2x, 3x, ...).
    pub resilience_backoff_step: Duration,
    /// Ceiling of the database reconnection backoff.
    pub resilience_backoff_max: Duration,
    /// Root of per-instance work directories. Defaults to the node's delivery repository.
    pub work_dir_root: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            config_sync_interval: Duration::from_secs(60),
            kill_check_interval: Duration::from_secs(1),
            kill_grace_period: Duration::from_secs(10),
            child_wait_interval: Duration::from_secs(1),
            resilience_backoff_step: Duration::from_secs(1),
            resilience_backoff_max: Duration::from_secs(120),
            work_dir_root: None,
        }
    }
}

impl EngineConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_config_sync_interval(mut self, interval: Duration) -> Self {
        self.config_sync_interval = interval;
        self
    }

    pub fn with_kill_check_interval(mut self, interval: Duration) -> Self {
        self.kill_check_interval = interval;
        self
    }

    pub fn with_kill_grace_period(mut self, grace: Duration) -> Self {
        self.kill_grace_period = grace;
        self
    }

    pub fn with_child_wait_interval(mut self, interval: Duration) -> Self {
        self.child_wait_interval = interval;
        self
    }

    pub fn with_resilience_backoff(mut self, step: Duration, max: Duration) -> Self {
        self.resilience_backoff_step = step;
        self.resilience_backoff_max = max;
        self
    }

    pub fn with_work_dir_root(mut self, root: PathBuf) -> Self {
        self.work_dir_root = Some(root);
        self
    }

    /// Age under which a node heartbeat means another engine is still alive.
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    /// Delay before the `attempt`-th (1-based) reconnection probe: linear growth, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.resilience_backoff_step
            .saturating_mul(attempt.max(1))
            .min(self.resilience_backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_default() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(cfg.kill_check_interval, Duration::from_secs(1));
        assert_eq!(cfg.resilience_backoff_step, Duration::from_secs(1));
        assert_eq!(cfg.resilience_backoff_max, Duration::from_secs(120));
        assert!(cfg.work_dir_root.is_none());
    }

    #[test]
    fn liveness_window_is_twice_heartbeat() {
        let cfg = EngineConfig::default().with_heartbeat_interval(Duration::from_millis(250));
        assert_eq!(cfg.liveness_window(), Duration::from_millis(500));
    }

    #[test]
    fn backoff_grows_linearly_then_caps() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(cfg.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(cfg.backoff_delay(3), Duration::from_secs(3));
        assert_eq!(cfg.backoff_delay(119), Duration::from_secs(119));
        assert_eq!(cfg.backoff_delay(500), Duration::from_secs(120));
    }

    #[test]
    fn backoff_attempt_zero_is_treated_as_first() {
        let cfg = EngineConfig::default()
            .with_resilience_backoff(Duration::from_millis(10), Duration::from_millis(35));
        assert_eq!(cfg.backoff_delay(0), Duration::from_millis(10));
        assert_eq!(cfg.backoff_delay(3), Duration::from_millis(30));
        assert_eq!(cfg.backoff_delay(4), Duration::from_millis(35));
    }

    #[test]
    fn builder_methods_override_fields() {
        let cfg = EngineConfig::default()
            .with_config_sync_interval(Duration::from_millis(5))
            .with_kill_grace_period(Duration::from_millis(6))
            .with_child_wait_interval(Duration::from_millis(7))
            .with_work_dir_root(PathBuf::from("/tmp/work"));
        assert_eq!(cfg.config_sync_interval, Duration::from_millis(5));
        assert_eq!(cfg.kill_grace_period, Duration::from_millis(6));
        assert_eq!(cfg.child_wait_interval, Duration::from_millis(7));
        assert_eq!(cfg.work_dir_root, Some(PathBuf::from("/tmp/work")));
    }
}
