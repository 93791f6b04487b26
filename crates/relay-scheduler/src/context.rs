use std::sync::Arc;

use tokio::sync::broadcast;

use relay_core::config::Config;
use relay_core::event::{LifecycleEvent, LifecycleSender};
use relay_core::llm::LlmClient;
use relay_core::tools::ToolExecutor;
use resilience::{BreakerRegistry, RateLimiterRegistry};
use session_store::SessionStore;

const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

/// Owned registries and collaborators for one gateway instance. Tests
/// instantiate their own context; nothing in the core is module-global.
pub struct CoreContext {
    pub config: Config,
    pub store: Arc<SessionStore>,
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<dyn ToolExecutor>,
    pub breakers: BreakerRegistry,
    pub rate_limiters: RateLimiterRegistry,
    lifecycle: LifecycleSender,
}

impl CoreContext {
    pub fn new(
        config: Config,
        store: Arc<SessionStore>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Self {
        let breakers = BreakerRegistry::new(config.breaker.clone());
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self {
            config,
            store,
            llm,
            tools,
            breakers,
            rate_limiters: RateLimiterRegistry::new(),
            lifecycle,
        }
    }

    /// Best-effort emission; the core never depends on delivery.
    pub fn emit(&self, event: LifecycleEvent) {
        let _ = self.lifecycle.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }
}
