#![allow(dead_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicySpec,
    NetworkPolicyPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn make_test_pod(name: &str, namespace: &str, pod_labels: &[(&str, &str)], ip: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("{name}-uid")),
            labels: Some(labels(pod_labels)),
            ..Default::default()
        },
        status: Some(PodStatus {
            pod_ip: if ip.is_empty() {
                None
            } else {
                Some(ip.to_string())
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pod_selector_peer(selector_labels: &[(&str, &str)]) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        pod_selector: Some(LabelSelector {
            match_labels: Some(labels(selector_labels)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn namespace_selector_peer() -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        namespace_selector: Some(LabelSelector::default()),
        ..Default::default()
    }
}

pub fn ip_block_peer(cidr: &str) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        ip_block: Some(IPBlock {
            cidr: cidr.to_string(),
            except: None,
        }),
        ..Default::default()
    }
}

pub fn ingress_rule(from: Vec<NetworkPolicyPeer>, port: i32) -> NetworkPolicyIngressRule {
    NetworkPolicyIngressRule {
        from: Some(from),
        ports: Some(vec![NetworkPolicyPort {
            port: Some(IntOrString::Int(port)),
            ..Default::default()
        }]),
    }
}

pub fn make_network_policy(
    name: &str,
    namespace: &str,
    applied_labels: &[(&str, &str)],
    ingress: Vec<NetworkPolicyIngressRule>,
) -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("{name}-uid")),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(labels(applied_labels)),
                ..Default::default()
            },
            ingress: Some(ingress),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// CIDRs of all ipBlock peers in a rule, in order.
pub fn peer_cidrs(rule: &NetworkPolicyIngressRule) -> Vec<String> {
    rule.from
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|p| p.ip_block.as_ref().map(|b| b.cidr.clone()))
        .collect()
}

pub fn ingress_rules(np: &NetworkPolicy) -> &[NetworkPolicyIngressRule] {
    np.spec
        .as_ref()
        .and_then(|s| s.ingress.as_deref())
        .unwrap_or_default()
}
