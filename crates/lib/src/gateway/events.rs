//! Event dispatcher: routes unsolicited event frames to registered handlers.

use crate::gateway::protocol::WsEvent;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Handlers registered under this name receive every event, after the named handlers.
pub const WILDCARD: &str = "*";

/// Receives events from the gateway. Errors are logged by the dispatcher, never propagated.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &WsEvent) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(WsEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &WsEvent) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as an event handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(WsEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Token returned by [`EventDispatcher::on`], used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Registry = HashMap<String, Vec<(HandlerId, Arc<dyn EventHandler>)>>;

/// Event name -> ordered handlers. Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    handlers: Arc<RwLock<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `event` (or [`WILDCARD`]). Handlers run in registration order.
    pub fn on(&self, event: impl Into<String>, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.into())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(h, _)| *h != id);
            removed |= list.len() != before;
        }
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Invoke every handler for the event. Returns how many handlers ran.
    pub async fn dispatch(&self, event: &WsEvent) -> usize {
        let targets: Vec<Arc<dyn EventHandler>> = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            let named = handlers.get(&event.event).into_iter().flatten();
            let wildcard = handlers.get(WILDCARD).into_iter().flatten();
            named.chain(wildcard).map(|(_, h)| Arc::clone(h)).collect()
        };
        if targets.is_empty() {
            log::debug!("gateway: no handler for event {}", event.event);
            return 0;
        }
        for handler in &targets {
            match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("gateway: event handler for {} failed: {:#}", event.event, e),
                Err(_) => log::error!("gateway: event handler for {} panicked", event.event),
            }
        }
        targets.len()
    }
}
