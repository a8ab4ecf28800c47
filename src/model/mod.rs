//! Rows shared through the database: nodes, queues, deployments, job definitions,
//! live job instances and their terminal history.

pub mod job;
pub mod node;

pub use job::{
    Deliverable, History, JobDefinition, JobInstance, JobRequest, Message, Outcome, PayloadKind,
    State,
};
pub use node::{DeploymentParameter, Node, Queue};
