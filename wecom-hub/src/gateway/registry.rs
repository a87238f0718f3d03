use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use tracing::{error, info};

use crate::error::{HubError, HubResult};
use crate::wecom::{OutboundSender, ReceiveMessage};

/// Detached handler work. `Ok(Some(text))` is pushed back to the sender.
pub type BackgroundWork = BoxFuture<'static, HubResult<Option<String>>>;

pub enum HandlerOutcome {
    /// Text sealed into the synchronous HTTP reply
    Reply(String),
    /// Work queued on the worker pool; the HTTP reply is empty
    Background(BackgroundWork),
    NoReply,
}

impl std::fmt::Debug for HandlerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerOutcome::Reply(text) => f.debug_tuple("Reply").field(text).finish(),
            HandlerOutcome::Background(_) => f.write_str("Background(..)"),
            HandlerOutcome::NoReply => f.write_str("NoReply"),
        }
    }
}

/// Command handler bound to one application.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        message: &ReceiveMessage,
        outbound: Arc<dyn OutboundSender>,
    ) -> HubResult<HandlerOutcome>;
}

pub type HandlerFactory = Box<dyn Fn() -> HubResult<Arc<dyn MessageHandler>> + Send + Sync>;

/// Agent id to handler table. Factories are registered at startup; the
/// handlers themselves are built exactly once, on first lookup.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: Vec<(u64, HandlerFactory)>,
    table: OnceCell<HashMap<u64, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, agent_id: u64, factory: F) -> HubResult<()>
    where
        F: Fn() -> HubResult<Arc<dyn MessageHandler>> + Send + Sync + 'static,
    {
        if self.table.get().is_some() {
            return Err(HubError::Config(format!(
                "handler for agent {} registered after the registry was built",
                agent_id
            )));
        }
        if self.factories.iter().any(|(id, _)| *id == agent_id) {
            return Err(HubError::Config(format!(
                "duplicate handler registration for agent {}",
                agent_id
            )));
        }
        self.factories.push((agent_id, Box::new(factory)));
        Ok(())
    }

    pub fn resolve(&self, agent_id: u64) -> HubResult<Option<Arc<dyn MessageHandler>>> {
        let table = self.table.get_or_try_init(|| self.build())?;
        Ok(table.get(&agent_id).cloned())
    }

    pub fn agent_ids(&self) -> Vec<u64> {
        self.factories.iter().map(|(id, _)| *id).collect()
    }

    fn build(&self) -> HubResult<HashMap<u64, Arc<dyn MessageHandler>>> {
        let mut table = HashMap::with_capacity(self.factories.len());
        for (agent_id, factory) in &self.factories {
            let handler = factory().map_err(|e| {
                error!("[Registry] Handler factory for agent {} failed: {}", agent_id, e);
                match e {
                    HubError::Config(msg) => HubError::Config(msg),
                    other => HubError::Config(other.to_string()),
                }
            })?;
            info!(
                "[Registry] Agent {} -> handler '{}'",
                agent_id,
                handler.name()
            );
            table.insert(*agent_id, handler);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        fn name(&self) -> &str {
            "echo"
        }

        async fn handle(
            &self,
            message: &ReceiveMessage,
            _outbound: Arc<dyn OutboundSender>,
        ) -> HubResult<HandlerOutcome> {
            Ok(HandlerOutcome::Reply(message.content.clone()))
        }
    }

    #[test]
    fn unknown_agent_resolves_to_none() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(1, || Ok(Arc::new(EchoHandler) as Arc<dyn MessageHandler>))
            .unwrap();
        assert!(registry.resolve(1).unwrap().is_some());
        assert!(registry.resolve(2).unwrap().is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(1, || Ok(Arc::new(EchoHandler) as Arc<dyn MessageHandler>))
            .unwrap();
        let err = registry
            .register(1, || Ok(Arc::new(EchoHandler) as Arc<dyn MessageHandler>))
            .unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }

    #[test]
    fn late_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.resolve(1).unwrap();
        assert!(registry
            .register(1, || Ok(Arc::new(EchoHandler) as Arc<dyn MessageHandler>))
            .is_err());
    }

    #[test]
    fn factory_failure_surfaces_as_config_error() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(1, || Err(HubError::Upstream("market offline".to_string())))
            .unwrap();
        let err = registry.resolve(1).err().expect("factory error");
        assert!(matches!(err, HubError::Config(msg) if msg.contains("market offline")));
    }

    #[test]
    fn concurrent_first_resolves_build_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = builds.clone();
        registry
            .register(7, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(EchoHandler) as Arc<dyn MessageHandler>)
            })
            .unwrap();
        let registry = Arc::new(registry);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.resolve(7).unwrap().is_some())
            })
            .collect();
        for t in threads {
            assert!(t.join().unwrap());
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }
}
