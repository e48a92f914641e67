//! The Kubernetes `Broker`: pods-as-servers via label selection and
//! annotation-carried metadata (`broker/k8s/controller.go`,
//! `broker/k8s/init.go`).

pub mod meta;
pub mod pod;

pub use meta::MyPodMeta;

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use governor::{Quota, RateLimiter};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams, WatchEvent, WatchParams};
use kube::Client;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::broker::{Broker, Hook, Shutdown};
use crate::error::{Result, XdiscoError};
use crate::eventhandler::EventHandler;
use crate::health::Checker;
use crate::server::{Server, State};

const WATCH_EVENTS_PER_SEC: u32 = 10;
const RETRY_ATTEMPTS: u32 = 5;

/// Watches pods of a given `kind` and registers this process as one,
/// stamping its identity into its own pod's annotations.
pub struct K8sBroker {
    client: Client,
    namespace: String,
    pod_meta: MyPodMeta,
    base_selector: HashMap<String, String>,
    state_tx: Mutex<Option<mpsc::UnboundedSender<State>>>,
}

impl K8sBroker {
    /// Connects using the in-cluster config (or `KUBECONFIG` outside a
    /// cluster, via `kube`'s usual config inference) and reads this pod's
    /// own identity from the Downward API.
    pub async fn new(base_selector: HashMap<String, String>) -> Result<Self> {
        let client = Client::try_default().await?;
        let pod_meta = MyPodMeta::from_env()?;
        let namespace = pod_meta.namespace.clone();
        Ok(Self {
            client,
            namespace,
            pod_meta,
            base_selector,
            state_tx: Mutex::new(None),
        })
    }

    fn label_selector(&self, kind: &str) -> String {
        let mut exprs: Vec<String> = self
            .base_selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        exprs.push(format!("kind={kind}"));
        exprs.join(",")
    }

    fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn self_pod_container_port(pod: &Pod) -> Result<i32> {
        pod.spec
            .as_ref()
            .and_then(|spec| spec.containers.first())
            .and_then(|c| c.ports.as_ref())
            .and_then(|ports| ports.first())
            .map(|p| p.container_port)
            .filter(|p| *p > 0)
            .ok_or_else(|| {
                XdiscoError::InvalidServer(format!(
                    "invalid port of container in pod {}",
                    pod.metadata.name.clone().unwrap_or_default()
                ))
            })
    }

    async fn get_self_pod(&self) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.pod_meta.namespace);
        let pod = api.get(&self.pod_meta.name).await?;
        Ok(pod)
    }

    /// Builds this process's own `Server` from its pod spec: id is the
    /// pod name, host is the pod IP, ports mirror every named container
    /// port (`Controller.newServer`).
    async fn build_self_server(&self, kind: &str) -> Result<Server> {
        let pod = self.get_self_pod().await?;
        Self::self_pod_container_port(&pod)?;

        let mut s = Server::new(self.pod_meta.name.clone(), kind, self.pod_meta.ip.clone());
        s.labels = pod.metadata.labels.clone().unwrap_or_default();
        if let Some(spec) = &pod.spec {
            if let Some(container) = spec.containers.first() {
                if let Some(ports) = &container.ports {
                    for p in ports {
                        if let Some(name) = &p.name {
                            s.ports.insert(name.clone(), p.container_port as u16);
                        }
                    }
                }
            }
        }
        Ok(s)
    }

    /// Retries the pod get-modify-update sequence on a 409 Conflict, the
    /// optimistic-concurrency pattern `Controller.updateSelfPod` implements
    /// via `retry.RetryOnConflict`.
    async fn update_self_pod(&self, server: &Server) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.pod_meta.namespace);
        let mut attempt = 0;
        loop {
            let mut current = api.get(&self.pod_meta.name).await?;
            pod::update_pod(&mut current, server)?;
            let patch = Patch::Merge(&current);
            match api
                .patch(&self.pod_meta.name, &PatchParams::default(), &patch)
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(e)) if e.code == 409 && attempt < RETRY_ATTEMPTS => {
                    attempt += 1;
                    warn!(attempt, "self pod update conflicted, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl Broker for K8sBroker {
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

        let selector = self.label_selector(kind);
        let api = self.pods_api();
        let lp = ListParams::default().labels(&selector);

        let pods = api.list(&lp).await?;
        let servers: Vec<Server> = pods
            .items
            .iter()
            .filter(|p| {
                p.status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .map(|phase| phase == "Running")
                    .unwrap_or(false)
            })
            .filter_map(pod::pod_as_server)
            .collect();
        info!(kind, pods = pods.items.len(), servers = servers.len(), "pods found");
        handler.init(servers).await;

        let resource_version = pods
            .metadata
            .resource_version
            .clone()
            .unwrap_or_default();
        let wp = WatchParams::default().labels(&selector);
        let mut stream = api.watch(&wp, &resource_version).await?.boxed();

        let quota = Quota::per_second(NonZeroU32::new(WATCH_EVENTS_PER_SEC).unwrap());
        let limiter = RateLimiter::direct(quota);

        info!(kind, selector = %selector, "watch started");
        loop {
            tokio::select! {
                ev = stream.next() => {
                    match ev {
                        Some(Ok(event)) => {
                            Self::handle_event(&handler, event).await;
                            limiter.until_ready().await;
                        }
                        Some(Err(e)) => {
                            warn!(kind, error = %e, "watch stream error");
                            limiter.until_ready().await;
                        }
                        None => {
                            info!(kind, "watch stream ended");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(kind, "watch stopped");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn start(&self, server: Server, hooks: Vec<Hook>, mut shutdown: Shutdown) -> Result<()> {
        let mut self_server = self.build_self_server(&server.kind).await?;
        self_server.weight = server.weight;
        self.update_self_pod(&self_server).await?;

        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        *self.state_tx.lock().await = Some(state_tx);

        info!(key = self_server.key(), "server started");
        loop {
            tokio::select! {
                Some(state) = state_rx.recv() => {
                    self_server.set_status(state);
                    if let Err(e) = self.update_self_pod(&self_server).await {
                        warn!(error = %e, "server state update failed");
                    }
                    if let Some(hook) = hooks.first() {
                        hook(&self_server);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self_server.set_status(State::Stopping);
                        if let Err(e) = self.update_self_pod(&self_server).await {
                            warn!(error = %e, "server stopping update failed");
                        }
                        info!(key = self_server.key(), "server stopping");
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

impl K8sBroker {
    /// Maps one `WatchEvent` to a single handler dispatch, awaited in-line
    /// so same-key events from the stream stay strictly ordered (spec §5).
    async fn handle_event(handler: &EventHandler, event: WatchEvent<Pod>) {
        match event {
            WatchEvent::Added(pod) => {
                if !Self::is_running(&pod) {
                    return;
                }
                if let Some(s) = pod::pod_as_server(&pod) {
                    handler.add(s.key().to_string().as_str(), s).await;
                }
            }
            WatchEvent::Modified(pod) => {
                if !Self::is_running(&pod) {
                    return;
                }
                if let Some(s) = pod::pod_as_server(&pod) {
                    handler.update(s.key().to_string().as_str(), s).await;
                }
            }
            WatchEvent::Deleted(pod) => {
                if let Some(s) = pod::pod_as_server(&pod) {
                    handler.delete(s.key()).await;
                }
            }
            WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(e) => {
                warn!(error = %e, "k8s watch reported an error event");
            }
        }
    }

    fn is_running(pod: &Pod) -> bool {
        matches!(
            pod.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Running")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::api::core::v1::PodStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn running_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(
                    [
                        ("xdisco/v1/kind".to_string(), "web".to_string()),
                        ("xdisco/v1/addr".to_string(), "10.0.0.1:8080".to_string()),
                        ("xdisco/v1/status".to_string(), "running".to_string()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pending_pod(name: &str) -> Pod {
        let mut pod = running_pod(name);
        pod.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        pod
    }

    fn counting_handler(
        adds: Arc<AtomicUsize>,
        updates: Arc<AtomicUsize>,
        deletes: Arc<AtomicUsize>,
    ) -> EventHandler {
        EventHandler::new()
            .on_init(|_| async {})
            .on_add(move |_, _| {
                let adds = adds.clone();
                async move {
                    adds.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_update(move |_, _| {
                let updates = updates.clone();
                async move {
                    updates.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_delete(move |_| {
                let deletes = deletes.clone();
                async move {
                    deletes.fetch_add(1, Ordering::SeqCst);
                }
            })
    }

    #[test]
    fn is_running_checks_pod_phase() {
        assert!(K8sBroker::is_running(&running_pod("a")));
        assert!(!K8sBroker::is_running(&pending_pod("a")));
    }

    #[tokio::test]
    async fn added_running_pod_dispatches_add() {
        let (adds, updates, deletes) = (
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        let handler = counting_handler(adds.clone(), updates.clone(), deletes.clone());
        K8sBroker::handle_event(&handler, WatchEvent::Added(running_pod("a"))).await;
        assert_eq!(adds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn added_non_running_pod_is_ignored() {
        let (adds, updates, deletes) = (
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        let handler = counting_handler(adds.clone(), updates.clone(), deletes.clone());
        K8sBroker::handle_event(&handler, WatchEvent::Added(pending_pod("a"))).await;
        assert_eq!(adds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn modified_running_pod_dispatches_update() {
        let (adds, updates, deletes) = (
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        let handler = counting_handler(adds.clone(), updates.clone(), deletes.clone());
        K8sBroker::handle_event(&handler, WatchEvent::Modified(running_pod("a"))).await;
        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deleted_pod_dispatches_delete_regardless_of_phase() {
        let (adds, updates, deletes) = (
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        let handler = counting_handler(adds.clone(), updates.clone(), deletes.clone());
        K8sBroker::handle_event(&handler, WatchEvent::Deleted(pending_pod("a"))).await;
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }
}
