use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use tracing::{debug, error, info, warn};

use crate::event::ClusterEvent;

/* ============================= MARKING ============================= */

/// Annotation carrying the originating object ID. Its presence is the sole
/// signal that an observed NetworkPolicy is one of ours.
pub const GENERATED_OBJID_ANNOTATION: &str = "coastguard-objid";

/// Informational label: name of the original NetworkPolicy.
pub const GENERATED_NAME_LABEL: &str = "coastguard-np";

/// Informational label: UID of the original NetworkPolicy.
pub const GENERATED_UID_LABEL: &str = "coastguard-np-uid";

const GENERATED_NAME_PREFIX: &str = "coastguard-";

pub fn generated_policy_name(np: &NetworkPolicy) -> String {
    format!(
        "{GENERATED_NAME_PREFIX}{}",
        np.metadata.uid.as_deref().unwrap_or_default()
    )
}

/// True when the policy was produced by this engine. Generated policies must
/// never be translated again; this check breaks the write-observe cycle.
pub fn is_generated(np: &NetworkPolicy) -> bool {
    originating_obj_id(np).is_some()
}

/// Object ID of the original NetworkPolicy a generated policy derives from.
pub fn originating_obj_id(np: &NetworkPolicy) -> Option<&str> {
    np.metadata
        .annotations
        .as_ref()?
        .get(GENERATED_OBJID_ANNOTATION)
        .map(String::as_str)
}

/// Deep equality on the parts of a policy the translator owns: the pod
/// selector and the ingress rules. Metadata drift (resourceVersion and the
/// like) on observed copies is ignored.
pub fn policy_rules_differ(a: &NetworkPolicy, b: &NetworkPolicy) -> bool {
    let a_spec = a.spec.as_ref();
    let b_spec = b.spec.as_ref();

    a_spec.map(|s| &s.pod_selector) != b_spec.map(|s| &s.pod_selector)
        || a_spec.and_then(|s| s.ingress.as_ref()) != b_spec.and_then(|s| s.ingress.as_ref())
}

/* ============================= SELECTOR MATCHING ============================= */

pub fn selector_is_empty(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().is_none_or(|m| m.is_empty())
        && selector
            .match_expressions
            .as_ref()
            .is_none_or(|e| e.is_empty())
}

/// Evaluate a LabelSelector against a label set: every matchLabels entry and
/// every matchExpressions requirement must hold.
pub fn selector_matches(selector: &LabelSelector, labels: Option<&BTreeMap<String, String>>) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);

    if let Some(required) = &selector.match_labels {
        for (key, value) in required {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expression in expressions {
            if !expression_matches(expression, labels) {
                return false;
            }
        }
    }

    true
}

fn expression_matches(expr: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&expr.key);
    let values = expr.values.as_deref().unwrap_or(&[]);

    match expr.operator.as_str() {
        "In" => value.is_some_and(|v| values.contains(v)),
        "NotIn" => value.is_none_or(|v| !values.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        other => {
            error!(operator = %other, "unknown label selector operator");
            false
        }
    }
}

/* ============================= REMOTE POD ============================= */

/// A pod observed in some cluster, as tracked by the translator.
#[derive(Debug, Clone)]
pub struct RemotePod {
    pub cluster_id: String,
    pub pod: Pod,
    pub obj_id: String,
}

impl RemotePod {
    pub fn new(pod: Pod, cluster_id: &str, obj_id: String) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            pod,
            obj_id,
        }
    }

    fn pod_ip(&self) -> &str {
        self.pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .unwrap_or_default()
    }
}

/* ============================= REMOTE NETWORK POLICY ============================= */

/// Tracks one original NetworkPolicy together with the remote pods its
/// ingress rules currently select, and derives the generated policy whose
/// peers are concrete /32 blocks for those pods.
#[derive(Debug, Clone)]
pub struct RemoteNetworkPolicy {
    /// Cluster the original policy lives in.
    cluster_id: String,

    /// The original NetworkPolicy this tracking derives from.
    pub np: NetworkPolicy,

    pub obj_id: String,

    /// Remote pods selected by this policy's ingress rules, keyed by object
    /// ID. Ordered so generated peer lists are deterministic.
    remote_pods: BTreeMap<String, RemotePod>,

    /// The derived policy, present only while at least one rule has peers.
    generated: Option<NetworkPolicy>,
}

impl RemoteNetworkPolicy {
    pub fn new(
        np: NetworkPolicy,
        cluster_id: &str,
        obj_id: String,
        existing_pods: &BTreeMap<String, RemotePod>,
    ) -> Self {
        let mut rnp = Self {
            cluster_id: cluster_id.to_string(),
            np,
            obj_id,
            remote_pods: BTreeMap::new(),
            generated: None,
        };

        for remote_pod in existing_pods.values() {
            rnp.process_added_pod(remote_pod.clone());
        }

        rnp
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn generated_policy(&self) -> Option<&NetworkPolicy> {
        self.generated.as_ref()
    }

    pub fn tracks_pod(&self, obj_id: &str) -> bool {
        self.remote_pods.contains_key(obj_id)
    }

    pub fn tracked_pod_count(&self) -> usize {
        self.remote_pods.len()
    }

    /* ------------------------- event callbacks ------------------------- */

    pub fn added_pod(&mut self, event: &ClusterEvent) {
        let Some(pod) = event.new_pod() else {
            warn!(obj_id = %event.obj_id, "added_pod called with a non-pod event");
            return;
        };

        let remote_pod = RemotePod::new(pod.clone(), &event.cluster_id, event.obj_id.clone());
        self.process_added_pod(remote_pod);
    }

    fn process_added_pod(&mut self, remote_pod: RemotePod) {
        if let Some(tracked) = self.remote_pods.get(&remote_pod.obj_id) {
            warn!(
                pod = %remote_pod.obj_id,
                policy = %self.obj_id,
                "added pod was already tracked, treating as update"
            );
            let update = ClusterEvent::updated(
                &remote_pod.cluster_id,
                tracked.pod.clone(),
                remote_pod.pod,
            );
            self.updated_pod(&update);
        } else if self.ingress_selects_pod(&remote_pod.pod, &remote_pod.cluster_id) {
            self.remote_pods
                .insert(remote_pod.obj_id.clone(), remote_pod);
            self.update_generated_policy();
        }
    }

    pub fn updated_pod(&mut self, event: &ClusterEvent) {
        let Some(new_pod) = event.new_pod() else {
            warn!(obj_id = %event.obj_id, "updated_pod called with a non-pod event");
            return;
        };

        let Some(tracked) = self.remote_pods.get(&event.obj_id) else {
            // Normal for pods this policy never selected; re-check in case
            // the update made the pod eligible.
            debug!(pod = %event.obj_id, policy = %self.obj_id, "update for an untracked pod, re-checking selectors");
            self.added_pod(&event.to_added());
            return;
        };

        // Only re-evaluate membership when the labels changed; a pod's
        // namespace cannot change in place.
        let labels_changed = tracked.pod.metadata.labels != new_pod.metadata.labels;
        if labels_changed && !self.ingress_selects_pod(new_pod, &event.cluster_id) {
            self.remote_pods.remove(&event.obj_id);
            self.update_generated_policy();
            return;
        }

        let remote_pod = RemotePod::new(new_pod.clone(), &event.cluster_id, event.obj_id.clone());
        self.remote_pods.insert(event.obj_id.clone(), remote_pod);
        self.update_generated_policy();
    }

    pub fn deleted_pod(&mut self, event: &ClusterEvent) {
        if self.remote_pods.remove(&event.obj_id).is_some() {
            self.update_generated_policy();
        } else {
            debug!(pod = %event.obj_id, policy = %self.obj_id, "delete for a pod this policy never tracked");
        }
    }

    /* ------------------------- selector evaluation ------------------------- */

    fn ingress_selects_pod(&self, pod: &Pod, pod_cluster_id: &str) -> bool {
        // Pods in the policy's own cluster are the local CNI's business.
        if self.cluster_id == pod_cluster_id {
            return false;
        }

        let Some(rules) = self.np.spec.as_ref().and_then(|s| s.ingress.as_ref()) else {
            return false;
        };

        rules.iter().any(|rule| self.ingress_rule_selects_pod(rule, pod))
    }

    fn ingress_rule_selects_pod(&self, rule: &NetworkPolicyIngressRule, pod: &Pod) -> bool {
        let Some(peers) = rule.from.as_ref() else {
            return false;
        };

        for peer in peers {
            match (&peer.pod_selector, &peer.namespace_selector) {
                (Some(selector), None) => {
                    if self.matches_pod_selector(selector, pod) {
                        return true;
                    }
                }
                (None, Some(namespace_selector)) => {
                    if selector_is_empty(namespace_selector) {
                        // Wildcard namespace: every pod in every other cluster.
                        return true;
                    }
                    // TODO: resolve non-empty namespace selectors against the
                    // remote cluster's namespace labels.
                    error!(policy = %self.obj_id, "non-empty namespace selectors are not handled yet");
                }
                (Some(_), Some(_)) => {
                    error!(policy = %self.obj_id, "namespace selector combined with pod selector is not handled yet");
                }
                // ipBlock-only peers never select pods.
                (None, None) => {}
            }
        }

        false
    }

    fn matches_pod_selector(&self, selector: &LabelSelector, pod: &Pod) -> bool {
        // Peer pod selectors are scoped to the policy's own namespace.
        let pod_namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let np_namespace = self.np.metadata.namespace.as_deref().unwrap_or_default();
        if pod_namespace != np_namespace {
            return false;
        }

        if selector_is_empty(selector) {
            return true;
        }

        selector_matches(selector, pod.metadata.labels.as_ref())
    }

    /* ------------------------- policy generation ------------------------- */

    fn update_generated_policy(&mut self) {
        if self.remote_pods.is_empty() {
            self.generated = None;
            return;
        }

        let ingress = self.generate_cidr_ingress_rules();
        if ingress.is_empty() {
            if self.generated.take().is_some() {
                info!(policy = %self.obj_id, "no ingress rule has matching pods anymore, dropping generated policy");
            }
            return;
        }

        let pod_selector = self
            .np
            .spec
            .as_ref()
            .map(|s| s.pod_selector.clone())
            .unwrap_or_default();

        let new_policy = NetworkPolicy {
            metadata: ObjectMeta {
                namespace: self.np.metadata.namespace.clone(),
                name: Some(generated_policy_name(&self.np)),
                annotations: Some(BTreeMap::from([(
                    GENERATED_OBJID_ANNOTATION.to_string(),
                    self.obj_id.clone(),
                )])),
                labels: Some(BTreeMap::from([
                    (
                        GENERATED_NAME_LABEL.to_string(),
                        self.np.metadata.name.clone().unwrap_or_default(),
                    ),
                    (
                        GENERATED_UID_LABEL.to_string(),
                        self.np.metadata.uid.clone().unwrap_or_default(),
                    ),
                ])),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector,
                ingress: Some(ingress),
                ..Default::default()
            }),
            ..Default::default()
        };

        let changed = self
            .generated
            .as_ref()
            .is_none_or(|old| policy_rules_differ(old, &new_policy));
        if changed && let Ok(rendered) = serde_json::to_string_pretty(&new_policy) {
            info!(policy = %self.obj_id, "generated policy updated:\n{rendered}");
        }

        self.generated = Some(new_policy);
    }

    fn generate_cidr_ingress_rules(&self) -> Vec<NetworkPolicyIngressRule> {
        let mut rules = Vec::new();

        let Some(original) = self.np.spec.as_ref().and_then(|s| s.ingress.as_ref()) else {
            return rules;
        };

        for rule in original {
            let peers = self.build_pod_peers_for_ingress_rule(rule);
            // Rules whose rewritten peer list is empty are dropped entirely;
            // this covers ipBlock-only rules and rules with no matching pods.
            if !peers.is_empty() {
                rules.push(NetworkPolicyIngressRule {
                    from: Some(peers),
                    ports: rule.ports.clone(),
                });
            }
        }

        rules
    }

    fn build_pod_peers_for_ingress_rule(
        &self,
        rule: &NetworkPolicyIngressRule,
    ) -> Vec<NetworkPolicyPeer> {
        let mut peers = Vec::new();

        for remote_pod in self.remote_pods.values() {
            let pod_ip = remote_pod.pod_ip();
            if pod_ip.is_empty() || !self.ingress_rule_selects_pod(rule, &remote_pod.pod) {
                continue;
            }

            // One /32 per pod; adjacent pods are not aggregated into wider blocks.
            peers.push(NetworkPolicyPeer {
                ip_block: Some(IPBlock {
                    cidr: format!("{pod_ip}/32"),
                    except: None,
                }),
                ..Default::default()
            });
        }

        peers
    }
}

/* ============================= TESTS ============================= */
