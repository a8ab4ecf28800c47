use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::error::EngineError;

/// Changes the process log filter at runtime. The engine applies the node's
/// `root_log_level` through it at start and when the node row changes.
#[derive(Clone, Debug)]
pub struct LogLevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelHandle {
    pub fn set_level(&self, level: &str) -> Result<(), EngineError> {
        let filter = parse_filter(level)?;
        self.handle
            .reload(filter)
            .map_err(|e| EngineError::Configuration(format!("log level not applied: {e}")))
    }

    /// Current filter directives, if the subscriber is still alive.
    pub fn current(&self) -> Option<String> {
        self.handle.with_current(|f| f.to_string()).ok()
    }
}

fn parse_filter(level: &str) -> Result<EnvFilter, EngineError> {
    EnvFilter::try_new(level.trim().to_lowercase())
        .map_err(|e| EngineError::Configuration(format!("invalid log level '{level}': {e}")))
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_level` at startup.
pub fn init_logging(default_level: &str) -> Result<LogLevelHandle, EngineError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(default_level)?,
    };
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| EngineError::Initialization(format!("logging already initialized: {e}")))?;

    Ok(LogLevelHandle { handle })
}
