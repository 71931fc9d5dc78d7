use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::Client;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::event::{ClusterEvent, EventType, ObjectKind};
use crate::healthz::HealthzServer;
use crate::metrics;
use crate::network_policy::{
    RemoteNetworkPolicy, RemotePod, is_generated, originating_obj_id, policy_rules_differ,
};
use crate::remote_cluster::RemoteCluster;

/// Bound on the shared event channel. Producers block under backpressure;
/// dropping events would silently break policy correctness.
pub const EVENT_CHANNEL_SIZE: usize = 1000;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Per-call bound on distribute/delete, kept under the reconcile interval so
/// one hung cluster cannot starve the tick.
const API_CALL_TIMEOUT: Duration = Duration::from_secs(4);

const HEALTH_ADDR: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
    8080,
);

/* ============================= LEDGER ============================= */

/// A generated policy as observed in the wild, keyed in the ledger by the
/// object ID of the original policy it derives from. The cluster's own cache
/// is the source of truth; entries leave the ledger only through observed
/// Delete events.
#[derive(Debug, Clone)]
pub struct GeneratedPolicyEntry {
    pub cluster_id: String,
    pub np: NetworkPolicy,
}

/* ============================= STATE ============================= */

/// The tightly coupled object graph: cluster set, pod index, original-policy
/// index and generated-policy ledger. All mutation happens on the controller
/// thread under one coarse lock; every method here is synchronous.
#[derive(Default)]
pub struct ControllerState {
    remote_clusters: HashMap<String, Arc<RemoteCluster>>,
    synced_clusters: HashSet<String>,

    remote_pods: BTreeMap<String, RemotePod>,
    remote_policies: BTreeMap<String, RemoteNetworkPolicy>,
    generated_ledger: BTreeMap<String, GeneratedPolicyEntry>,
}

/// Distribute/delete work computed by one reconcile pass, each entry paired
/// with the cluster that owns the policy.
#[derive(Debug, Default)]
pub struct ReconcileActions {
    pub distribute: Vec<(String, NetworkPolicy)>,
    pub delete: Vec<(String, NetworkPolicy)>,
}

impl ControllerState {
    pub fn register_cluster(&mut self, cluster: Arc<RemoteCluster>) {
        self.remote_clusters
            .insert(cluster.cluster_id.clone(), cluster);
    }

    pub fn mark_cluster_synced(&mut self, cluster_id: &str) {
        self.synced_clusters.insert(cluster_id.to_string());
        metrics::CLUSTERS_SYNCED.set(self.synced_clusters.len() as i64);
    }

    pub fn is_cluster_synced(&self, cluster_id: &str) -> bool {
        self.synced_clusters.contains(cluster_id)
    }

    pub fn cluster(&self, cluster_id: &str) -> Option<Arc<RemoteCluster>> {
        self.remote_clusters.get(cluster_id).cloned()
    }

    pub fn all_clusters_synced(&self) -> bool {
        self.remote_clusters
            .keys()
            .all(|id| self.synced_clusters.contains(id))
    }

    pub fn remote_pods(&self) -> &BTreeMap<String, RemotePod> {
        &self.remote_pods
    }

    pub fn remote_policies(&self) -> &BTreeMap<String, RemoteNetworkPolicy> {
        &self.remote_policies
    }

    pub fn generated_ledger(&self) -> &BTreeMap<String, GeneratedPolicyEntry> {
        &self.generated_ledger
    }

    fn stop_all_clusters(&self) {
        for cluster in self.remote_clusters.values() {
            cluster.stop();
        }
    }

    /* ------------------------- event routing ------------------------- */

    pub fn process_event(&mut self, event: &ClusterEvent) {
        debug!(
            event_type = %event.event_type,
            obj_type = %event.payload.kind(),
            obj_id = %event.obj_id,
            "processing event"
        );

        match event.payload.kind() {
            ObjectKind::NetworkPolicy => {
                let Some(np) = event.new_policy() else { return };
                if is_generated(np) {
                    self.process_generated_policy_event(event);
                } else {
                    self.process_original_policy_event(event);
                }
            }
            ObjectKind::Pod => self.process_pod_event(event),
        }
    }

    fn process_original_policy_event(&mut self, event: &ClusterEvent) {
        match event.event_type {
            EventType::Added => self.added_original_policy(event),
            EventType::Updated => self.updated_original_policy(event),
            EventType::Deleted => self.deleted_original_policy(event),
        }
    }

    fn process_pod_event(&mut self, event: &ClusterEvent) {
        match event.event_type {
            EventType::Added => self.added_pod(event),
            EventType::Updated => self.updated_pod(event),
            EventType::Deleted => self.deleted_pod(event),
        }
    }

    fn process_generated_policy_event(&mut self, event: &ClusterEvent) {
        match event.event_type {
            EventType::Added => self.added_generated_policy(event),
            EventType::Updated => self.updated_generated_policy(event),
            EventType::Deleted => self.deleted_generated_policy(event),
        }
    }

    /* ------------------------- original policies ------------------------- */

    fn added_original_policy(&mut self, event: &ClusterEvent) {
        let Some(np) = event.new_policy() else { return };

        if let Some(existing) = self.remote_policies.get(&event.obj_id) {
            warn!(
                obj_id = %event.obj_id,
                "add event for a NetworkPolicy already in the index, treating as update"
            );
            let update = ClusterEvent::updated(&event.cluster_id, existing.np.clone(), np.clone());
            self.updated_original_policy(&update);
        } else {
            let rnp = RemoteNetworkPolicy::new(
                np.clone(),
                &event.cluster_id,
                event.obj_id.clone(),
                &self.remote_pods,
            );
            self.remote_policies.insert(event.obj_id.clone(), rnp);
        }
    }

    fn updated_original_policy(&mut self, event: &ClusterEvent) {
        let Some(np) = event.new_policy() else { return };

        if self.remote_policies.contains_key(&event.obj_id) {
            // Pod-selector diffs are not worth the complexity; rebuilding from
            // the pod index is O(pods) and the index is in memory.
            let rnp = RemoteNetworkPolicy::new(
                np.clone(),
                &event.cluster_id,
                event.obj_id.clone(),
                &self.remote_pods,
            );
            self.remote_policies.insert(event.obj_id.clone(), rnp);
        } else {
            warn!(
                obj_id = %event.obj_id,
                "update event for a NetworkPolicy not in the index, treating as add"
            );
            self.added_original_policy(&event.to_added());
        }
    }

    fn deleted_original_policy(&mut self, event: &ClusterEvent) {
        if self.remote_policies.remove(&event.obj_id).is_none() {
            warn!(
                obj_id = %event.obj_id,
                "delete event for a NetworkPolicy not in the index"
            );
        }
    }

    /* ------------------------- pods ------------------------- */

    fn added_pod(&mut self, event: &ClusterEvent) {
        let Some(pod) = event.new_pod() else { return };

        if let Some(existing) = self.remote_pods.get(&event.obj_id) {
            warn!(
                obj_id = %event.obj_id,
                "add event for a pod already in the index, treating as update"
            );
            let update = ClusterEvent::updated(&event.cluster_id, existing.pod.clone(), pod.clone());
            self.updated_pod(&update);
        } else {
            self.remote_pods.insert(
                event.obj_id.clone(),
                RemotePod::new(pod.clone(), &event.cluster_id, event.obj_id.clone()),
            );
            for rnp in self.remote_policies.values_mut() {
                rnp.added_pod(event);
            }
        }
    }

    fn updated_pod(&mut self, event: &ClusterEvent) {
        let Some(pod) = event.new_pod() else { return };

        if self.remote_pods.contains_key(&event.obj_id) {
            self.remote_pods.insert(
                event.obj_id.clone(),
                RemotePod::new(pod.clone(), &event.cluster_id, event.obj_id.clone()),
            );
            for rnp in self.remote_policies.values_mut() {
                rnp.updated_pod(event);
            }
        } else {
            warn!(
                obj_id = %event.obj_id,
                "update event for a pod not in the index, treating as add"
            );
            self.added_pod(&event.to_added());
        }
    }

    fn deleted_pod(&mut self, event: &ClusterEvent) {
        if self.remote_pods.contains_key(&event.obj_id) {
            for rnp in self.remote_policies.values_mut() {
                rnp.deleted_pod(event);
            }
            self.remote_pods.remove(&event.obj_id);
        } else {
            warn!(
                obj_id = %event.obj_id,
                "delete event for a pod not in the index"
            );
        }
    }

    /* ------------------------- generated policies ------------------------- */

    // Generated policies written into a cluster come back through that
    // cluster's watcher. They are tracked in the ledger under the ORIGINATING
    // object ID so the ledger lines up with the original-policy index, and
    // they are never translated again.

    fn added_generated_policy(&mut self, event: &ClusterEvent) {
        let Some(np) = event.new_policy() else { return };
        let Some(orig_id) = originating_obj_id(np).map(str::to_string) else {
            return;
        };

        if let Some(existing) = self.generated_ledger.get(&orig_id) {
            let update = ClusterEvent::updated(&event.cluster_id, existing.np.clone(), np.clone());
            self.updated_generated_policy(&update);
        } else {
            self.generated_ledger.insert(
                orig_id,
                GeneratedPolicyEntry {
                    cluster_id: event.cluster_id.clone(),
                    np: np.clone(),
                },
            );
        }
    }

    fn updated_generated_policy(&mut self, event: &ClusterEvent) {
        let Some(np) = event.new_policy() else { return };
        let Some(orig_id) = originating_obj_id(np).map(str::to_string) else {
            return;
        };

        if self.generated_ledger.contains_key(&orig_id) {
            self.generated_ledger.insert(
                orig_id,
                GeneratedPolicyEntry {
                    cluster_id: event.cluster_id.clone(),
                    np: np.clone(),
                },
            );
        } else {
            self.added_generated_policy(&event.to_added());
        }
    }

    fn deleted_generated_policy(&mut self, event: &ClusterEvent) {
        let Some(np) = event.new_policy() else { return };
        let Some(orig_id) = originating_obj_id(np) else { return };

        if self.generated_ledger.remove(orig_id).is_none() {
            warn!(
                obj_id = %event.obj_id,
                "delete event for a generated NetworkPolicy not in the ledger"
            );
        }
    }

    /* ------------------------- reconcile decisions ------------------------- */

    /// Compute the distribute and delete work for one reconcile tick.
    ///
    /// Distribute: every tracked policy with a generated form that the ledger
    /// has not seen, or whose observed copy has drifted. Delete: ledger
    /// entries whose policy no longer generates anything, plus entries whose
    /// original policy is gone from the index.
    pub fn reconcile_actions(&self) -> ReconcileActions {
        let mut actions = ReconcileActions::default();

        for (obj_id, rnp) in &self.remote_policies {
            match rnp.generated_policy() {
                Some(generated) => {
                    let needs_distribution = match self.generated_ledger.get(obj_id) {
                        None => true,
                        Some(entry) => policy_rules_differ(&entry.np, generated),
                    };
                    if needs_distribution {
                        actions
                            .distribute
                            .push((rnp.cluster_id().to_string(), generated.clone()));
                    }
                }
                None => {
                    if let Some(entry) = self.generated_ledger.get(obj_id) {
                        actions
                            .delete
                            .push((rnp.cluster_id().to_string(), entry.np.clone()));
                    }
                }
            }
        }

        for (obj_id, entry) in &self.generated_ledger {
            if !self.remote_policies.contains_key(obj_id) {
                actions
                    .delete
                    .push((entry.cluster_id.clone(), entry.np.clone()));
            }
        }

        actions
    }
}

/* ============================= CONTROLLER ============================= */

/// Owns the cluster watchers, fans their events into one serialized
/// processing loop, and drives the periodic reconcile tick.
pub struct Controller {
    state: Arc<Mutex<ControllerState>>,
    event_tx: mpsc::Sender<ClusterEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<ClusterEvent>>>,
    ready: Arc<AtomicBool>,
}

impl Controller {
    pub fn new() -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        Arc::new(Self {
            state: Arc::new(Mutex::new(ControllerState::default())),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /* ------------------------- cluster lifecycle ------------------------- */

    /// Discovery callback: a new cluster appeared. Builds its watcher, wires
    /// it to the shared event channel and starts it.
    pub async fn on_add(&self, cluster_id: &str, client: Client) {
        info!(cluster = %cluster_id, "adding cluster");

        let cluster = RemoteCluster::new(cluster_id, client);
        cluster.set_event_channel(self.event_tx.clone()).await;

        {
            let mut state = self.state.lock().await;
            state.register_cluster(cluster.clone());
            // A fresh cluster has not synced yet.
            self.ready.store(state.all_clusters_synced(), Ordering::SeqCst);
        }

        let state = self.state.clone();
        let ready = self.ready.clone();
        let cluster_id = cluster_id.to_string();
        cluster.run(Some(Box::pin(async move {
            let mut state = state.lock().await;
            state.mark_cluster_synced(&cluster_id);
            ready.store(state.all_clusters_synced(), Ordering::SeqCst);
        })));
    }

    pub async fn on_update(&self, cluster_id: &str, _client: Client) {
        error!(cluster = %cluster_id, "cluster update requested");
        unimplemented!("updating a discovered cluster is not implemented");
    }

    pub async fn on_remove(&self, cluster_id: &str) {
        error!(cluster = %cluster_id, "cluster removal requested");
        unimplemented!("removing a discovered cluster is not implemented");
    }

    pub async fn all_clusters_synced(&self) -> bool {
        self.state.lock().await.all_clusters_synced()
    }

    /* ------------------------- main loop ------------------------- */

    /// Run the processing loop and the health server until `shutdown` fires,
    /// then stop every watcher and close the event channel. At-most-once.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let Some(mut events) = self.event_rx.lock().await.take() else {
            warn!("controller run called twice, ignoring");
            return Ok(());
        };

        let healthz = HealthzServer::new(HEALTH_ADDR, self.ready.clone());
        let health_shutdown = shutdown.resubscribe();
        let health_handle = tokio::spawn(healthz.run(health_shutdown));

        let mut tick = tokio::time::interval(RECONCILE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("controller started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("exited process loop");
                    break;
                }

                event = events.recv() => match event {
                    Some(event) => self.process_event(event).await,
                    None => {
                        warn!("event channel closed, exiting process loop");
                        break;
                    }
                },

                _ = tick.tick() => self.reconcile_generated_policies().await,
            }
        }

        info!("stopping remote cluster watchers");
        self.state.lock().await.stop_all_clusters();

        // Closing the receiver after the loop exits unblocks any producer
        // still waiting on channel capacity.
        drop(events);

        health_handle.await??;
        Ok(())
    }

    async fn process_event(&self, event: ClusterEvent) {
        metrics::EVENTS_PROCESSED.inc();

        let mut state = self.state.lock().await;
        state.process_event(&event);

        metrics::PODS_TRACKED.set(state.remote_pods().len() as i64);
        metrics::POLICIES_TRACKED.set(state.remote_policies().len() as i64);
        metrics::GENERATED_OBSERVED.set(state.generated_ledger().len() as i64);
    }

    /* ------------------------- reconcile ------------------------- */

    async fn reconcile_generated_policies(&self) {
        let state = self.state.lock().await;

        if !state.all_clusters_synced() {
            info!("skipping generated policy reconcile until all clusters have synced");
            return;
        }

        let _timer = metrics::RECONCILE_DURATION.start_timer();
        let actions = state.reconcile_actions();

        if !actions.distribute.is_empty() || !actions.delete.is_empty() {
            let timestamp = chrono::Utc::now().format("%H:%M:%S");
            println!(
                "[{timestamp}] reconcile: {} to distribute, {} to delete",
                actions.distribute.len(),
                actions.delete.len()
            );
        }

        for (cluster_id, np) in &actions.distribute {
            let Some(cluster) = state.cluster(cluster_id) else {
                warn!(cluster = %cluster_id, "no watcher for cluster, skipping distribute");
                continue;
            };

            match tokio::time::timeout(API_CALL_TIMEOUT, cluster.distribute(np)).await {
                Ok(Ok(())) => metrics::POLICIES_DISTRIBUTED.inc(),
                Ok(Err(e)) => {
                    metrics::DISTRIBUTE_ERRORS.inc();
                    error!(cluster = %cluster_id, error = %format!("{e:#}"), "failed to distribute generated policy");
                }
                Err(_) => {
                    metrics::DISTRIBUTE_ERRORS.inc();
                    error!(cluster = %cluster_id, "timed out distributing generated policy");
                }
            }
        }

        for (cluster_id, np) in &actions.delete {
            let Some(cluster) = state.cluster(cluster_id) else {
                warn!(cluster = %cluster_id, "no watcher for cluster, skipping delete");
                continue;
            };

            match tokio::time::timeout(API_CALL_TIMEOUT, cluster.delete(np)).await {
                Ok(Ok(())) => metrics::POLICIES_DELETED.inc(),
                Ok(Err(e)) => {
                    metrics::DELETE_ERRORS.inc();
                    error!(cluster = %cluster_id, error = %format!("{e:#}"), "failed to delete stale generated policy");
                }
                Err(_) => {
                    metrics::DELETE_ERRORS.inc();
                    error!(cluster = %cluster_id, "timed out deleting stale generated policy");
                }
            }
        }
    }
}

/* ============================= TESTS ============================= */
