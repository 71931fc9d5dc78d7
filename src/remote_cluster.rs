use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};
use kube_runtime::watcher::{Config, Event, watcher};
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::event::{ClusterEvent, Watched, object_id};

/// How long the sync waiter gives the caches before logging a warning. The
/// waiter keeps waiting afterwards; readiness simply stays false.
const SYNC_WARNING_AFTER: Duration = Duration::from_secs(60);

/* ============================= REMOTE CLUSTER ============================= */

/// One discovered cluster: two cache-backed watchers (Pods, NetworkPolicies)
/// feeding normalized events into the shared channel, plus the distribute
/// and delete API for NetworkPolicies in that cluster.
pub struct RemoteCluster {
    pub cluster_id: String,
    client: Client,

    /// Outbound event channel. Events are dropped until it is installed; the
    /// mutex is the barrier between `set_event_channel` and the watch tasks.
    event_tx: Mutex<Option<mpsc::Sender<ClusterEvent>>>,

    stop_tx: watch::Sender<bool>,
    pod_synced_tx: watch::Sender<bool>,
    np_synced_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl fmt::Debug for RemoteCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCluster")
            .field("cluster_id", &self.cluster_id)
            .finish_non_exhaustive()
    }
}

impl RemoteCluster {
    pub fn new(cluster_id: &str, client: Client) -> Arc<Self> {
        Arc::new(Self {
            cluster_id: cluster_id.to_string(),
            client,
            event_tx: Mutex::new(None),
            stop_tx: watch::channel(false).0,
            pod_synced_tx: watch::channel(false).0,
            np_synced_tx: watch::channel(false).0,
            started: AtomicBool::new(false),
        })
    }

    /// Install the outbound event channel. Until this is called the watch
    /// tasks drop their events, which allows a sync-only startup phase.
    pub async fn set_event_channel(&self, tx: mpsc::Sender<ClusterEvent>) {
        *self.event_tx.lock().await = Some(tx);
    }

    /// Start both watchers plus the sync waiter. `on_synced` completes exactly
    /// once, after both caches have finished their initial list. Calling `run`
    /// a second time logs a warning and does nothing.
    pub fn run(self: Arc<Self>, on_synced: Option<BoxFuture<'static, ()>>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(cluster = %self.cluster_id, "run called twice on a cluster watcher, ignoring");
            return;
        }

        let pods: Api<Pod> = Api::all(self.client.clone());
        let policies: Api<NetworkPolicy> = Api::all(self.client.clone());

        tokio::spawn(watch_resource(
            Arc::clone(&self),
            pods,
            self.pod_synced_tx.clone(),
        ));
        tokio::spawn(watch_resource(
            Arc::clone(&self),
            policies,
            self.np_synced_tx.clone(),
        ));
        tokio::spawn(wait_for_sync(self, on_synced));
    }

    /// True once both caches have completed their initial list.
    pub fn has_synced(&self) -> bool {
        *self.pod_synced_tx.borrow() && *self.np_synced_tx.borrow()
    }

    /// Signal termination to every task owned by this watcher. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /* ------------------------- event construction ------------------------- */

    pub fn new_add_event<T: Watched>(&self, obj: T) -> ClusterEvent {
        ClusterEvent::added(&self.cluster_id, obj)
    }

    pub fn new_update_event<T: Watched>(&self, old: T, new: T) -> ClusterEvent {
        ClusterEvent::updated(&self.cluster_id, old, new)
    }

    pub fn new_delete_event<T: Watched>(&self, obj: T) -> ClusterEvent {
        ClusterEvent::deleted(&self.cluster_id, obj)
    }

    async fn enqueue_event(&self, event: ClusterEvent) {
        let guard = self.event_tx.lock().await;
        if let Some(tx) = guard.as_ref()
            && tx.send(event).await.is_err()
        {
            warn!(cluster = %self.cluster_id, "event channel closed, dropping event");
        }
    }

    /* ------------------------- distribute / delete ------------------------- */

    /// Upsert a NetworkPolicy into this cluster: replace, and when the object
    /// does not exist yet, create it.
    pub async fn distribute(&self, np: &NetworkPolicy) -> Result<()> {
        let namespace = np.metadata.namespace.as_deref().unwrap_or_default();
        let name = np.metadata.name.as_deref().unwrap_or_default();
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);

        info!(cluster = %self.cluster_id, policy = %name, "distributing NetworkPolicy");

        match api.replace(name, &PostParams::default(), np).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => api
                .create(&PostParams::default(), np)
                .await
                .map(|_| ())
                .with_context(|| {
                    format!(
                        "creating NetworkPolicy {namespace}/{name} in cluster {}",
                        self.cluster_id
                    )
                }),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "updating NetworkPolicy {namespace}/{name} in cluster {}",
                    self.cluster_id
                )
            }),
        }
    }

    /// Best-effort delete of a NetworkPolicy by name.
    pub async fn delete(&self, np: &NetworkPolicy) -> Result<()> {
        let namespace = np.metadata.namespace.as_deref().unwrap_or_default();
        let name = np.metadata.name.as_deref().unwrap_or_default();
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);

        info!(cluster = %self.cluster_id, policy = %name, "deleting NetworkPolicy");

        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .with_context(|| {
                format!(
                    "deleting NetworkPolicy {namespace}/{name} from cluster {}",
                    self.cluster_id
                )
            })
    }
}

/* ============================= WATCH TASKS ============================= */

/// Run one watch stream, keeping a local store of last-seen objects so kube
/// `Applied` events can be split into Add and Update (with the previous
/// object attached) and re-lists can synthesize Deletes for vanished objects.
/// The store stands in for the informer tombstone: a delete observed only
/// through a re-list still carries the object's last known state.
async fn watch_resource<T>(rc: Arc<RemoteCluster>, api: Api<T>, synced_tx: watch::Sender<bool>)
where
    T: Watched + kube::Resource + Clone + DeserializeOwned + fmt::Debug + Send + 'static,
{
    let mut store: HashMap<String, T> = HashMap::new();
    let mut stream = watcher(api, Config::default()).boxed();
    let mut stop_rx = rc.stop_tx.subscribe();

    // Termination may have been signaled before this task subscribed.
    if *stop_rx.borrow() {
        return;
    }

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    debug!(cluster = %rc.cluster_id, kind = %T::KIND, "watch task stopped");
                    return;
                }
            }

            item = stream.next() => match item {
                Some(Ok(Event::Applied(obj))) => {
                    apply(&rc, &mut store, obj).await;
                }

                Some(Ok(Event::Deleted(obj))) => {
                    let id = object_id(&rc.cluster_id, obj.object_meta());
                    store.remove(&id);
                    rc.enqueue_event(ClusterEvent::deleted(&rc.cluster_id, obj)).await;
                }

                Some(Ok(Event::Restarted(objs))) => {
                    resync(&rc, &mut store, objs).await;
                    let _ = synced_tx.send(true);
                }

                Some(Err(e)) => {
                    warn!(cluster = %rc.cluster_id, kind = %T::KIND, error = %e, "watch stream error, retrying");
                }

                None => {
                    warn!(cluster = %rc.cluster_id, kind = %T::KIND, "watch stream ended");
                    return;
                }
            }
        }
    }
}

async fn apply<T: Watched>(rc: &RemoteCluster, store: &mut HashMap<String, T>, obj: T) {
    let id = object_id(&rc.cluster_id, obj.object_meta());
    debug!(cluster = %rc.cluster_id, kind = %T::KIND, obj_id = %id, "object applied");

    match store.insert(id, obj.clone()) {
        Some(old) => {
            rc.enqueue_event(ClusterEvent::updated(&rc.cluster_id, old, obj))
                .await;
        }
        None => {
            rc.enqueue_event(ClusterEvent::added(&rc.cluster_id, obj))
                .await;
        }
    }
}

/// Diff a full re-list against the local store: unknown objects become Adds,
/// known ones Updates, and vanished ones Deletes.
async fn resync<T: Watched>(rc: &RemoteCluster, store: &mut HashMap<String, T>, objs: Vec<T>) {
    let mut seen = HashSet::new();

    for obj in objs {
        seen.insert(object_id(&rc.cluster_id, obj.object_meta()));
        apply(rc, store, obj).await;
    }

    let gone: Vec<String> = store
        .keys()
        .filter(|id| !seen.contains(*id))
        .cloned()
        .collect();

    for id in gone {
        if let Some(old) = store.remove(&id) {
            rc.enqueue_event(ClusterEvent::deleted(&rc.cluster_id, old))
                .await;
        }
    }
}

/* ============================= SYNC WAITER ============================= */

async fn wait_for_sync(rc: Arc<RemoteCluster>, on_synced: Option<BoxFuture<'static, ()>>) {
    let mut pod_rx = rc.pod_synced_tx.subscribe();
    let mut np_rx = rc.np_synced_tx.subscribe();
    let mut stop_rx = rc.stop_tx.subscribe();

    let warning = tokio::time::sleep(SYNC_WARNING_AFTER);
    tokio::pin!(warning);
    let mut warned = false;

    if *stop_rx.borrow() {
        return;
    }

    while !(*pod_rx.borrow() && *np_rx.borrow()) {
        tokio::select! {
            _ = pod_rx.changed() => {}
            _ = np_rx.changed() => {}
            _ = &mut warning, if !warned => {
                warned = true;
                warn!(cluster = %rc.cluster_id, "timed out waiting for caches to sync, still waiting");
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
        }
    }

    info!(cluster = %rc.cluster_id, "cluster finished syncing");

    if let Some(on_synced) = on_synced {
        on_synced.await;
    }
}
