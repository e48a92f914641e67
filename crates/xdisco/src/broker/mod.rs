//! The `Broker` abstraction: a pluggable backend that watches a `kind`
//! for membership changes and registers this process as a server of
//! that kind (`broker/broker.go`).

#[cfg(feature = "etcd")]
pub mod etcd;
#[cfg(feature = "k8s")]
pub mod k8s;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::eventhandler::EventHandler;
use crate::health::Checker;
use crate::server::{Server, State};

/// Called after every successful registration heartbeat, mirroring the
/// original's `Hook func(*server.Server)`.
pub type Hook = Arc<dyn Fn(&Server) + Send + Sync>;

/// A shutdown signal shared between a `Broker`'s background loops and
/// whoever owns its lifetime, the same `watch::Receiver<bool>` pattern
/// `AgentDiscovery` uses for its `tokio::select!` loop.
pub type Shutdown = watch::Receiver<bool>;

/// Unifies watching a kind for membership changes and registering this
/// process as one of its servers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Watch `kind`, driving `handler` for every discovered delta after
    /// filtering through `checker`. Runs until `shutdown` fires or the
    /// backend reports a fatal error.
    async fn watch(
        &self,
        kind: &str,
        handler: EventHandler,
        checker: Arc<dyn Checker>,
        shutdown: Shutdown,
    ) -> Result<()>;

    /// Register `server` and keep it alive until `shutdown` fires,
    /// invoking every `hook` after each successful heartbeat.
    async fn start(&self, server: Server, hooks: Vec<Hook>, shutdown: Shutdown) -> Result<()>;

    /// Advertise a new lifecycle state for the registration opened by
    /// the most recent `start` call (best-effort; see backend docs).
    async fn set_state(&self, state: State);
}
