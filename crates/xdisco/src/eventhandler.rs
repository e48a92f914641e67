//! The four-callback vtable a `Broker` drives as it discovers, updates,
//! and loses servers (`eventhandler/handler.go`).

use std::future::Future;
use std::pin::Pin;

use crate::server::Server;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

type OnInit = Box<dyn Fn(Vec<Server>) -> BoxFuture + Send + Sync>;
type OnAdd = Box<dyn Fn(&str, Server) -> BoxFuture + Send + Sync>;
type OnUpdate = Box<dyn Fn(&str, Server) -> BoxFuture + Send + Sync>;
type OnDelete = Box<dyn Fn(&str) -> BoxFuture + Send + Sync>;

/// Event sink a `Broker` drives while watching one `kind`. Every dispatch
/// method returns a future the broker's watch loop awaits in-line, so
/// same-key events stay strictly ordered (spec §5) — a `Broker` must never
/// fire two callbacks for the same key concurrently. All four callbacks
/// are required; `EventHandler::is_valid` enforces that the same way
/// `Handler.IsValid` does in the original.
pub struct EventHandler {
    pub on_init: Option<OnInit>,
    pub on_add: Option<OnAdd>,
    pub on_update: Option<OnUpdate>,
    pub on_delete: Option<OnDelete>,
}

impl EventHandler {
    pub fn new() -> Self {
        Self {
            on_init: None,
            on_add: None,
            on_update: None,
            on_delete: None,
        }
    }

    pub fn on_init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<Server>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_init = Some(Box::new(move |servers| Box::pin(f(servers))));
        self
    }

    pub fn on_add<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&str, Server) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_add = Some(Box::new(move |key, s| Box::pin(f(key, s))));
        self
    }

    pub fn on_update<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&str, Server) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_update = Some(Box::new(move |key, s| Box::pin(f(key, s))));
        self
    }

    pub fn on_delete<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_delete = Some(Box::new(move |key| Box::pin(f(key))));
        self
    }

    pub fn is_valid(&self) -> bool {
        self.on_init.is_some()
            && self.on_add.is_some()
            && self.on_update.is_some()
            && self.on_delete.is_some()
    }

    pub async fn init(&self, servers: Vec<Server>) {
        if let Some(f) = &self.on_init {
            f(servers).await;
        }
    }

    pub async fn add(&self, key: &str, s: Server) {
        if let Some(f) = &self.on_add {
            f(key, s).await;
        }
    }

    pub async fn update(&self, key: &str, s: Server) {
        if let Some(f) = &self.on_update {
            f(key, s).await;
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Some(f) = &self.on_delete {
            f(key).await;
        }
    }
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn incomplete_handler_is_invalid() {
        let h = EventHandler::new().on_add(|_, _| async {});
        assert!(!h.is_valid());
    }

    #[tokio::test]
    async fn complete_handler_is_valid_and_dispatches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let c2 = calls.clone();
        let c3 = calls.clone();
        let c4 = calls.clone();
        let h = EventHandler::new()
            .on_init(move |_| {
                let c1 = c1.clone();
                async move {
                    c1.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_add(move |_, _| {
                let c2 = c2.clone();
                async move {
                    c2.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_update(move |_, _| {
                let c3 = c3.clone();
                async move {
                    c3.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_delete(move |_| {
                let c4 = c4.clone();
                async move {
                    c4.fetch_add(1, Ordering::SeqCst);
                }
            });
        assert!(h.is_valid());
        h.init(vec![]).await;
        h.add("k", Server::new("1", "kind", "h")).await;
        h.update("k", Server::new("1", "kind", "h")).await;
        h.delete("k").await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
