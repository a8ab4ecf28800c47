pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub(crate) mod resilience;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use config::EngineConfig;
pub use db::{Database, MemoryDatabase};
pub use engine::{Engine, EngineBuilder, EngineHandler, EngineStats};
pub use error::{DbError, EngineError, PayloadError, Result};
pub use worker::{payload_fn, JobContext, Payload, PayloadRegistry};
