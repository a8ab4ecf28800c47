use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cluster member, provisioned out-of-band. The engine only stamps its heartbeat and stop flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub dns: String,
    pub port: u16,
    /// Where deliverables and work directories are stored.
    pub delivery_repo: PathBuf,
    pub root_log_level: String,
    pub last_seen_alive: Option<DateTime<Utc>>,
    pub stop_requested: bool,
}

impl Node {
    pub fn new(id: i64, name: impl Into<String>, delivery_repo: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            dns: "localhost".to_string(),
            port: 0,
            delivery_repo: delivery_repo.into(),
            root_log_level: "info".to_string(),
            last_seen_alive: None,
            stop_requested: false,
        }
    }

    /// True when the heartbeat is younger than `window`.
    pub fn is_alive_at(&self, now: DateTime<Utc>, window: std::time::Duration) -> bool {
        match self.last_seen_alive {
            Some(seen) => (now - seen)
                .to_std()
                .map(|age| age <= window)
                // Heartbeat in the future: clock skew, still alive.
                .unwrap_or(true),
            None => false,
        }
    }

    /// Attributes whose change means the node configuration changed.
    pub(crate) fn config_fingerprint(&self) -> (String, String, u16, PathBuf) {
        (
            self.root_log_level.clone(),
            self.dns.clone(),
            self.port,
            self.delivery_repo.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}

impl Queue {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
        }
    }
}

/// Binds a queue to a node with its polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentParameter {
    pub id: i64,
    pub node_id: i64,
    pub queue: Queue,
    pub max_concurrent_threads: usize,
    pub polling_interval_ms: u64,
}
