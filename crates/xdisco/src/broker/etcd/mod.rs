//! The etcd v3 `Broker`: lease-based registration and prefix watch
//! (`broker/etcd/etcd.go`).

pub mod config;

pub use config::Options;

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use governor::{Quota, RateLimiter};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::broker::{Broker, Hook, Shutdown};
use crate::error::{Result, XdiscoError};
use crate::eventhandler::EventHandler;
use crate::health::Checker;
use crate::server::{Server, State};

/// A lease shorter than this is silently floored, matching the original's
/// `if ttl < 30*time.Second { ttl = 30 * time.Second }`.
const MIN_LEASE_TTL: Duration = Duration::from_secs(30);
const WATCH_EVENTS_PER_SEC: u32 = 100;
/// Deadline for registration/update RPCs (spec §5).
const RPC_TIMEOUT: Duration = Duration::from_secs(6);
const PING_TIMEOUT: Duration = Duration::from_secs(3);

async fn with_rpc_timeout<F, T>(fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, etcd_client::Error>>,
{
    match tokio::time::timeout(RPC_TIMEOUT, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(XdiscoError::HealthCheck("etcd RPC timed out".into())),
    }
}

pub struct EtcdBroker {
    base_key: String,
    client: Client,
    ttl: Duration,
    state_tx: Mutex<Option<mpsc::UnboundedSender<State>>>,
}

impl EtcdBroker {
    pub async fn new(base_key: impl Into<String>, ttl: Duration) -> Result<Self> {
        let opts = Options {
            base_key: base_key.into(),
            ttl,
            ..Options::default()
        };
        Self::with_options(opts).await
    }

    pub async fn with_options(opts: Options) -> Result<Self> {
        opts.check_basic()?;
        let opts = opts.with_defaults();
        opts.check()?;
        if opts.ttl <= Duration::from_secs(1) {
            return Err(XdiscoError::InvalidTtl(opts.ttl));
        }

        let client = Client::connect(
            opts.endpoints.clone(),
            Some(ConnectOptions::new().with_connect_timeout(opts.dial_timeout)),
        )
        .await?;

        Ok(Self {
            base_key: opts.base_key,
            client,
            ttl: opts.ttl,
            state_tx: Mutex::new(None),
        })
    }

    fn build_key(&self, kind: &str, id: &str) -> String {
        format!("{}/{kind}/{id}", self.base_key)
    }

    fn build_key_of_list(&self, kind: &str) -> String {
        format!("{}/{kind}/", self.base_key)
    }

    /// Round-trip self-test: write then read back a well-known key
    /// (`Etcd.Ping`).
    pub async fn ping(&self) -> Result<()> {
        const PING_KEY: &str = "_ping_";
        const PING_VALUE: &str = "_pong_";
        let mut client = self.client.clone();
        tokio::time::timeout(PING_TIMEOUT, client.put(PING_KEY, PING_VALUE, None))
            .await
            .map_err(|_| XdiscoError::HealthCheck("ping timed out".into()))??;
        let resp = tokio::time::timeout(PING_TIMEOUT, client.get(PING_KEY, None))
            .await
            .map_err(|_| XdiscoError::HealthCheck("ping timed out".into()))??;
        let kv = resp
            .kvs()
            .first()
            .ok_or_else(|| XdiscoError::HealthCheck("ping failed: no value".into()))?;
        if kv.value() != PING_VALUE.as_bytes() {
            return Err(XdiscoError::HealthCheck(
                "ping failed: invalid pong value".into(),
            ));
        }
        Ok(())
    }

    async fn fetch_servers(&self, full_key: &str) -> Result<Vec<Server>> {
        let mut client = self.client.clone();
        let resp = with_rpc_timeout(client.get(full_key, Some(GetOptions::new().with_prefix()))).await?;

        let mut list = Vec::new();
        for kv in resp.kvs() {
            let key = String::from_utf8_lossy(kv.key()).to_string();
            match Server::from_backend_bytes(key.clone(), kv.value()) {
                Ok(s) if s.is_valid() => list.push(s),
                Ok(_) => warn!(key, "fetch servers: invalid server payload"),
                Err(e) => warn!(key, error = %e, "fetch servers: parse failed"),
            }
        }
        Ok(list)
    }

    async fn new_lease_id(&self, ttl: Duration) -> Result<i64> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl.as_secs() as i64, None).await?;
        Ok(resp.id())
    }

    /// Dispatches one watch event, keeping same-key events strictly
    /// ordered by awaiting the handler in-line before returning (spec §5).
    async fn handle_watch_event(
        handler: &EventHandler,
        seen: &mut HashSet<String>,
        event_type: EventType,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        match event_type {
            EventType::Put => {
                let s = Server::from_backend_bytes(key.to_string(), value)?;
                if seen.insert(key.to_string()) {
                    handler.add(key, s).await;
                } else {
                    handler.update(key, s).await;
                }
            }
            EventType::Delete => {
                seen.remove(key);
                handler.delete(key).await;
            }
        }
        Ok(())
    }

    /// Writes the current value of `server` under its lease, granting a
    /// fresh lease and retrying once if the put fails (the original's
    /// `update` recovering from an expired lease).
    async fn put_keepalive(&self, server: &Server, lease_id: &mut i64) -> Result<()> {
        let key = self.build_key(&server.kind, &server.id);
        let data = serde_json::to_vec(server).map_err(|e| XdiscoError::MalformedRecord(e.to_string()))?;
        let mut client = self.client.clone();

        let put = with_rpc_timeout(
            client.put(key.clone(), data.clone(), Some(PutOptions::new().with_lease(*lease_id))),
        )
        .await;
        if put.is_ok() {
            return Ok(());
        }
        warn!(key, "keepalive put failed, regranting lease");

        let fresh_lease = self.new_lease_id(MIN_LEASE_TTL).await?;
        *lease_id = fresh_lease;
        with_rpc_timeout(client.put(key, data, Some(PutOptions::new().with_lease(fresh_lease)))).await?;
        Ok(())
    }

    async fn delete_registration(&self, server: &Server) -> Result<()> {
        let key = self.build_key(&server.kind, &server.id);
        let mut client = self.client.clone();
        with_rpc_timeout(client.delete(key, None)).await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for EtcdBroker {
    async fn watch(
        &self,
        kind: &str,
        handler: EventHandler,
        _checker: Arc<dyn Checker>,
        mut shutdown: Shutdown,
    ) -> Result<()> {
        if !handler.is_valid() {
            return Err(XdiscoError::InvalidHandler);
        }

        let full_key = self.build_key_of_list(kind);
        info!(kind, full_key = %full_key, "watch starting");

        let servers = self.fetch_servers(&full_key).await?;
        info!(kind, count = servers.len(), "servers found");
        let mut seen: HashSet<String> = servers.iter().map(|s| s.key().to_string()).collect();
        handler.init(servers).await;

        let mut client = self.client.clone();
        let (_watcher, mut stream) = client
            .watch(full_key.clone(), Some(WatchOptions::new().with_prefix()))
            .await?;

        let quota = Quota::per_second(NonZeroU32::new(WATCH_EVENTS_PER_SEC).unwrap());
        let limiter = RateLimiter::direct(quota);

        info!(kind, full_key = %full_key, "watch started");
        loop {
            tokio::select! {
                msg = stream.message() => {
                    match msg {
                        Ok(Some(resp)) => {
                            if resp.events().is_empty() {
                                continue;
                            }
                            for event in resp.events() {
                                let Some(kv) = event.kv() else { continue };
                                let key = String::from_utf8_lossy(kv.key()).to_string();
                                if let Err(e) = Self::handle_watch_event(
                                    &handler,
                                    &mut seen,
                                    event.event_type(),
                                    &key,
                                    kv.value(),
                                )
                                .await
                                {
                                    warn!(key, error = %e, "invalid watch event");
                                    limiter.until_ready().await;
                                }
                            }
                        }
                        Ok(None) => {
                            warn!(kind, "watch stream closed by server");
                            break;
                        }
                        Err(e) => {
                            warn!(kind, error = %e, "watch stream error");
                            limiter.until_ready().await;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(kind, "watch stopping on shutdown");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn start(&self, mut server: Server, hooks: Vec<Hook>, mut shutdown: Shutdown) -> Result<()> {
        if !server.is_valid() {
            return Err(XdiscoError::InvalidServer(server.key().to_string()));
        }

        let key = self.build_key(&server.kind, &server.id);
        server.set_status(State::Running);

        let ttl = self.ttl.max(MIN_LEASE_TTL);
        let mut lease_id = self.new_lease_id(ttl).await?;
        let data = serde_json::to_vec(&server).map_err(|e| XdiscoError::MalformedRecord(e.to_string()))?;

        let mut client = self.client.clone();
        with_rpc_timeout(client.put(key.clone(), data, Some(PutOptions::new().with_lease(lease_id))))
            .await
            .map_err(|e| {
                warn!(key, error = %e, "server start failed");
                e
            })?;

        let (mut keepalive_client, mut keepalive_stream) = client.keep_alive(lease_id).await?;

        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        *self.state_tx.lock().await = Some(state_tx);

        info!(key, "server started");
        loop {
            tokio::select! {
                tick = keepalive_stream.message() => {
                    match tick {
                        Ok(Some(_)) => {
                            if let Some(hook) = hooks.first() {
                                hook(&server);
                            }
                            server.touch();
                            if let Err(e) = self.put_keepalive(&server, &mut lease_id).await {
                                warn!(key, error = %e, "server keepalive update failed");
                            }
                            let _ = keepalive_client.keep_alive().await;
                        }
                        Ok(None) => {
                            warn!(key, "keepalive stream closed");
                            break;
                        }
                        Err(e) => {
                            warn!(key, error = %e, "keepalive stream error");
                        }
                    }
                }
                Some(state) = state_rx.recv() => {
                    server.set_status(state);
                    server.touch();
                    if let Err(e) = self.put_keepalive(&server, &mut lease_id).await {
                        warn!(key, error = %e, "server state update failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        match self.delete_registration(&server).await {
                            Ok(()) => info!(key, "server stopped"),
                            Err(e) => info!(key, error = %e, "server stop encountered an error"),
                        }
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn set_state(&self, state: State) {
        if let Some(tx) = self.state_tx.lock().await.as_ref() {
            let _ = tx.send(state);
        }
    }
}
