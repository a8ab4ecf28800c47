use crate::model::{History, JobInstance, Node};

/// Hooks called by the engine at lifecycle points. All methods default to no-ops.
///
/// Hooks run on engine tasks and must not block.
pub trait EngineHandler: Send + Sync {
    fn on_node_starting(&self, _node_name: &str) {}

    fn on_node_configuration_read(&self, _node: &Node) {}

    /// The node row changed (log level, address, delivery repository).
    fn on_configuration_changed(&self, _node: &Node) {}

    fn on_node_started(&self) {}

    fn on_node_stopped(&self) {}

    fn on_job_instance_preparing(&self, _instance: &JobInstance) {}

    fn on_job_instance_done(&self, _history: &History) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EngineHandler for NoopHandler {}
