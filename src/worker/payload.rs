use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::PayloadError;
use crate::worker::context::JobContext;

/// Code run by an in-process job definition.
///
/// Long-running payloads should poll [`JobContext::is_killed`] or call
/// [`JobContext::should_kill`] so that kill requests can interrupt them cooperatively.
#[async_trait]
pub trait Payload: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<(), PayloadError>;
}

/// Adapts an async closure into a [`Payload`].
pub struct FnPayload<F>(F);

#[async_trait]
impl<F, Fut> Payload for FnPayload<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), PayloadError>> + Send,
{
    async fn run(&self, ctx: JobContext) -> Result<(), PayloadError> {
        (self.0)(ctx).await
    }
}

pub fn payload_fn<F, Fut>(f: F) -> Arc<dyn Payload>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PayloadError>> + Send + 'static,
{
    Arc::new(FnPayload(f))
}

/// In-process payloads, by the name used in [`PayloadKind::InProcess`](crate::model::PayloadKind).
#[derive(Default, Clone)]
pub struct PayloadRegistry {
    payloads: Arc<RwLock<HashMap<String, Arc<dyn Payload>>>>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, payload: Arc<dyn Payload>) {
        let name = name.into();
        match self.payloads.write() {
            Ok(mut payloads) => {
                tracing::debug!(payload = %name, "Payload registered");
                payloads.insert(name, payload);
            }
            Err(_) => tracing::error!(payload = %name, "Payload registry lock poisoned"),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Payload>> {
        self.payloads.read().ok()?.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.payloads.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .payloads
            .read()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("PayloadRegistry")
            .field("payloads", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        let registry = PayloadRegistry::new();
        assert!(registry.is_empty());
        registry.register("noop", payload_fn(|_ctx| async { Ok(()) }));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn registry_clones_share_entries() {
        let registry = PayloadRegistry::new();
        let clone = registry.clone();
        clone.register("late", payload_fn(|_ctx| async { Ok(()) }));
        assert!(registry.get("late").is_some());
    }
}
