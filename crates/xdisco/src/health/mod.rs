//! Liveness checking: the `Checker` trait, a closure adapter, and the
//! parallel alive/dead partition used by `Service` (spec §5).

pub mod http_head;

pub use http_head::HttpHead;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::server::Server;

/// Pluggable liveness probe for a single `Server`.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn ping(&self, server: &Server) -> Result<()>;
}

/// Wraps a closure as a `Checker`, mirroring `health/custom.go`'s
/// `Custom(func(*server.Server) error)`.
pub struct Custom<F> {
    pinger: F,
}

impl<F> Custom<F> {
    pub fn new(pinger: F) -> Self {
        Self { pinger }
    }
}

#[async_trait]
impl<F> Checker for Custom<F>
where
    F: Fn(&Server) -> Result<()> + Send + Sync,
{
    async fn ping(&self, server: &Server) -> Result<()> {
        (self.pinger)(server)
    }
}

/// Partition `servers` into `(alive, dead)` by probing every entry
/// concurrently and waiting for all probes to finish (`server.Filter` /
/// `pool.rs`'s `health_check_all` fan-out-then-join pattern).
pub async fn filter(servers: &[Server], checker: Arc<dyn Checker>) -> (Vec<Server>, Vec<Server>) {
    let mut tasks = Vec::with_capacity(servers.len());
    for s in servers {
        let s = s.clone();
        let checker = checker.clone();
        tasks.push(tokio::spawn(async move {
            let ok = checker.ping(&s).await.is_ok();
            (s, ok)
        }));
    }

    let mut alive = Vec::new();
    let mut dead = Vec::new();
    for task in tasks {
        match task.await {
            Ok((s, true)) => alive.push(s),
            Ok((s, false)) => {
                warn!(key = %s.key(), "health check failed");
                dead.push(s);
            }
            Err(e) => warn!(error = %e, "health check task panicked"),
        }
    }
    (alive, dead)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct AlwaysOk;
    #[async_trait]
    impl Checker for AlwaysOk {
        async fn ping(&self, _server: &Server) -> Result<()> {
            Ok(())
        }
    }

    struct AlwaysFail;
    #[async_trait]
    impl Checker for AlwaysFail {
        async fn ping(&self, _server: &Server) -> Result<()> {
            Err(crate::error::XdiscoError::HealthCheck("nope".into()))
        }
    }

    #[tokio::test]
    async fn filter_partitions_by_outcome() {
        let servers = vec![
            Server::new("1", "k", "h1"),
            Server::new("2", "k", "h2"),
            Server::new("3", "k", "h3"),
        ];
        let (alive, dead) = filter(&servers, Arc::new(AlwaysOk)).await;
        assert_eq!(alive.len(), 3);
        assert!(dead.is_empty());

        let (alive, dead) = filter(&servers, Arc::new(AlwaysFail)).await;
        assert!(alive.is_empty());
        assert_eq!(dead.len(), 3);
    }

    #[tokio::test]
    async fn custom_closure_checker_runs() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let checker = Custom::new(move |_s: &Server| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        let server = Server::new("1", "k", "h1");
        checker.ping(&server).await.unwrap();
        assert!(called.load(Ordering::SeqCst));
    }
}
