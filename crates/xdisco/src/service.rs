//! `Service`: the health-gated facade over one `Broker` watch (`service.go`).
//!
//! Membership lives in a `DashMap` keyed by backend key (mirroring the
//! original's `sync.Map`); every delta rebuilds an immutable `ServerList`
//! snapshot and swaps it into an `ArcSwap` so readers never observe a
//! partially-built list (spec §5's atomic-publish invariant).

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::broker::{Broker, Shutdown};
use crate::eventhandler::EventHandler;
use crate::health::{self, Checker};
use crate::server::{Server, ServerList};

type OnChanged = Box<dyn Fn(&Arc<ServerList>) + Send + Sync>;

pub struct Service {
    kind: String,
    registry: DashMap<String, Server>,
    snapshot: ArcSwap<ServerList>,
    broker: Arc<dyn Broker>,
    checker: Arc<dyn Checker>,
    on_changed: std::sync::Mutex<Option<OnChanged>>,
}

impl Service {
    pub fn new(kind: impl Into<String>, broker: Arc<dyn Broker>, checker: Arc<dyn Checker>) -> Arc<Self> {
        Arc::new(Self {
            kind: kind.into(),
            registry: DashMap::new(),
            snapshot: ArcSwap::from_pointee(ServerList::new(vec![])),
            broker,
            checker,
            on_changed: std::sync::Mutex::new(None),
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn checker(&self) -> Arc<dyn Checker> {
        self.checker.clone()
    }

    /// Registers a callback invoked with the fresh snapshot every time
    /// membership changes (`Service.OnChanged`).
    pub fn on_changed(&self, callback: impl Fn(&Arc<ServerList>) + Send + Sync + 'static) {
        *self.on_changed.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn server_list(&self) -> Arc<ServerList> {
        self.snapshot.load_full()
    }

    /// Consistent-hash lookup against the current snapshot
    /// (`Service.ChooseServer`).
    pub fn choose_server(&self, id: &str) -> Option<Server> {
        self.server_list().lookup(id).cloned()
    }

    fn renew_snapshot(&self) {
        let list = ServerList::from_concurrent_map(&self.registry);
        self.snapshot.store(Arc::new(list));
        if let Some(cb) = self.on_changed.lock().unwrap().as_ref() {
            cb(&self.snapshot.load_full());
        }
    }

    fn on_server_unhealthy(&self, key: &str) {
        warn!(kind = %self.kind, key, "server unhealthy");
    }

    /// Builds the `EventHandler` this service drives its `Broker`'s watch
    /// with. Every callback returns its processing future directly (no
    /// `tokio::spawn`) so the broker's watch loop awaits it in-line before
    /// moving to the next event — same-key events must stay strictly
    /// ordered (spec §5), which an unjoined spawn would not guarantee.
    pub fn handler(self: &Arc<Self>) -> EventHandler {
        let init_self = self.clone();
        let add_self = self.clone();
        let update_self = self.clone();
        let delete_self = self.clone();

        EventHandler::new()
            .on_init(move |servers| {
                let this = init_self.clone();
                async move { this.handle_init(servers).await }
            })
            .on_add(move |key, s| {
                let this = add_self.clone();
                let key = key.to_string();
                async move { this.handle_add(&key, s).await }
            })
            .on_update(move |key, s| {
                let this = update_self.clone();
                let key = key.to_string();
                async move { this.handle_update(&key, s).await }
            })
            .on_delete(move |key| {
                let this = delete_self.clone();
                let key = key.to_string();
                async move { this.handle_delete(&key).await }
            })
    }

    async fn handle_init(self: Arc<Self>, servers: Vec<Server>) {
        let (alive, dead) = health::filter(&servers, self.checker.clone()).await;
        for s in &alive {
            self.registry.insert(s.key().to_string(), s.clone());
            info!(kind = %self.kind, key = s.key(), "server initialized");
        }
        self.renew_snapshot();
        for s in &dead {
            self.on_server_unhealthy(s.key());
        }
    }

    async fn handle_add(self: Arc<Self>, key: &str, s: Server) {
        if let Err(e) = self.checker.ping(&s).await {
            warn!(kind = %self.kind, key, error = %e, "server unhealthy, dropping add");
            self.on_server_unhealthy(key);
            return;
        }
        self.registry.insert(key.to_string(), s);
        self.renew_snapshot();
        info!(kind = %self.kind, key, "server found");
    }

    async fn handle_update(self: Arc<Self>, key: &str, s: Server) {
        if let Err(e) = self.checker.ping(&s).await {
            warn!(kind = %self.kind, key, error = %e, "server unhealthy, keeping prior state");
            self.on_server_unhealthy(key);
            return;
        }
        self.registry.insert(key.to_string(), s);
        self.renew_snapshot();
    }

    async fn handle_delete(self: Arc<Self>, key: &str) {
        self.registry.remove(key);
        self.renew_snapshot();
        info!(kind = %self.kind, key, "server deleted");
    }

    /// Drives the broker's watch loop for this service's `kind` until
    /// `shutdown` fires (`Service.Start`).
    pub async fn start(self: &Arc<Self>, shutdown: Shutdown) -> crate::error::Result<()> {
        let handler = self.handler();
        self.broker
            .watch(&self.kind, handler, self.checker.clone(), shutdown)
            .await
    }

    /// Re-probes every currently-registered server and evicts the ones
    /// that fail, returning how many were dropped and whether the
    /// snapshot changed (`Service.CleanUnhealthServer`).
    pub async fn clean_unhealthy_servers(&self) -> (usize, bool) {
        let servers = self.server_list().get_all().to_vec();
        if servers.is_empty() {
            return (0, false);
        }
        let (alive, dead) = health::filter(&servers, self.checker.clone()).await;
        if alive.len() == servers.len() {
            return (0, false);
        }
        for s in &dead {
            self.registry.remove(s.key());
        }
        self.renew_snapshot();
        warn!(
            kind = %self.kind,
            before = servers.len(),
            after = alive.len(),
            "serverlist cleaned"
        );
        (dead.len(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Hook;
    use crate::server::State;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    struct AlwaysOk;
    #[async_trait]
    impl Checker for AlwaysOk {
        async fn ping(&self, _s: &Server) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct NoopBroker;
    #[async_trait]
    impl Broker for NoopBroker {
        async fn watch(
            &self,
            _kind: &str,
            handler: EventHandler,
            _checker: Arc<dyn Checker>,
            _shutdown: Shutdown,
        ) -> crate::error::Result<()> {
            handler.init(vec![Server::new("1", "web", "10.0.0.1")]).await;
            Ok(())
        }
        async fn start(&self, _s: Server, _hooks: Vec<Hook>, _shutdown: Shutdown) -> crate::error::Result<()> {
            Ok(())
        }
        async fn set_state(&self, _state: State) {}
    }

    #[tokio::test]
    async fn watch_init_populates_snapshot() {
        let service = Service::new("web", Arc::new(NoopBroker), Arc::new(AlwaysOk));
        let (_tx, rx) = watch::channel(false);
        service.start(rx).await.unwrap();
        assert_eq!(service.server_list().size(), 1);
        assert!(service.choose_server("anything").is_some());
    }

    #[tokio::test]
    async fn on_changed_fires_on_mutation() {
        let service = Service::new("web", Arc::new(NoopBroker), Arc::new(AlwaysOk));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        service.on_changed(move |_list| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        service.handle_add("k", Server::new("1", "web", "10.0.0.1")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
