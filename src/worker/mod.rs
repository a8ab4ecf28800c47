//! Job instance execution on a node.
//!
//! - [`loader`]: runs one claimed instance from `ATTRIBUTED` to its History row
//! - [`context`]: the [`JobContext`] API handed to running payloads
//! - [`payload`]: the [`Payload`] trait and the [`PayloadRegistry`] of in-process payloads
//! - [`executor`]: [`ProcessExecutor`] for definitions that launch an external program
//! - [`heartbeat`]: the node heartbeat and configuration refresh
//!
//! # Execution Flow
//!
//! 1. A queue poller claims an instance and spawns a loader holding one concurrency slot
//! 2. The loader re-reads the row, marks it `RUNNING` and launches the payload
//! 3. Every kill-check tick the row is re-read; a kill request cancels the payload token
//! 4. The outcome is stored; if the database is down it is deferred to the resilience loop
//! 5. The slot is released only once the outcome is stored

pub mod context;
pub mod executor;
pub mod heartbeat;
pub(crate) mod loader;
pub mod payload;

pub use context::JobContext;
pub use executor::{ExecutionResult, ProcessExecutor};
pub use heartbeat::HeartbeatPoller;
pub use payload::{payload_fn, FnPayload, Payload, PayloadRegistry};
