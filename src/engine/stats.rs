use serde::Serialize;

use crate::scheduler::poller::PollerStats;

/// Monitoring snapshot of one engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub node_name: String,
    pub version: &'static str,
    pub uptime_secs: u64,
    /// Job instances this node has finished, all time.
    pub cumulative_job_instances: u64,
    /// Finished over the last minute, divided by 60.
    pub job_instances_per_second: f64,
    /// Live instances attributed to or running on this node.
    pub running_job_instances: u64,
    pub all_pollers_polling: bool,
    pub any_poller_full: bool,
    pub paused: bool,
    pub pollers: Vec<PollerStats>,
}
