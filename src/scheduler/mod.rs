//! Queue polling.
//!
//! One [`QueuePoller`] runs per deployment of the node. Claims go through
//! [`Database::claim_instances`](crate::db::Database::claim_instances), which is the only
//! thing preventing two nodes from running the same instance.

pub mod poller;

pub use poller::{PollerStats, PollerStatus, QueuePoller};
