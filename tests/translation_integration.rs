mod common;

use common::{
    ingress_rule, ingress_rules, ip_block_peer, make_network_policy, make_test_pod,
    namespace_selector_peer, peer_cidrs, pod_selector_peer,
};
use coastguard::controller::ControllerState;
use coastguard::event::ClusterEvent;
use coastguard::network_policy::originating_obj_id;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

// ══════════════════════════════════════════════════════════════════
// End-to-end translation scenarios (no cluster required)
//
// Drives the controller state machine with synthetic watch events from
// three clusters and checks the generated policies that fall out.
// ══════════════════════════════════════════════════════════════════

const CLUSTER_A: &str = "cluster-a";
const CLUSTER_B: &str = "cluster-b";
const CLUSTER_C: &str = "cluster-c";

/// Cluster A holds the policy; every cluster holds one selected pod.
fn seed_single_rule_scenario(state: &mut ControllerState) -> String {
    let np = make_network_policy(
        "allow-selected",
        "ns1",
        &[("pods", "applied")],
        vec![ingress_rule(
            vec![pod_selector_peer(&[("pods", "selected")])],
            80,
        )],
    );
    let np_event = ClusterEvent::added(CLUSTER_A, np);
    state.process_event(&np_event);

    for (cluster, name, ip) in [
        (CLUSTER_A, "p0", "1.0.0.1"),
        (CLUSTER_B, "p1", "2.0.0.1"),
        (CLUSTER_C, "p2", "3.0.0.1"),
    ] {
        let pod = make_test_pod(name, "ns1", &[("pods", "selected")], ip);
        state.process_event(&ClusterEvent::added(cluster, pod));
    }

    np_event.obj_id
}

#[test]
fn test_single_rule_translation() {
    let mut state = ControllerState::default();
    let np_id = seed_single_rule_scenario(&mut state);

    let rnp = &state.remote_policies()[&np_id];
    let generated = rnp.generated_policy().expect("policy should be generated");

    let rules = ingress_rules(generated);
    assert_eq!(rules.len(), 1);

    // Remote selecting pods become /32 peers; the local pod must not appear.
    assert_eq!(peer_cidrs(&rules[0]), vec!["2.0.0.1/32", "3.0.0.1/32"]);

    let ports = rules[0].ports.as_ref().unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].port, Some(IntOrString::Int(80)));
}

#[test]
fn test_generated_policy_identity() {
    let mut state = ControllerState::default();
    let np_id = seed_single_rule_scenario(&mut state);

    let rnp = &state.remote_policies()[&np_id];
    let generated = rnp.generated_policy().unwrap();

    assert_eq!(
        generated.metadata.name.as_deref(),
        Some("coastguard-allow-selected-uid")
    );
    assert_eq!(generated.metadata.namespace.as_deref(), Some("ns1"));
    assert_eq!(originating_obj_id(generated), Some(np_id.as_str()));
    assert_eq!(
        generated.spec.as_ref().unwrap().pod_selector,
        rnp.np.spec.as_ref().unwrap().pod_selector
    );
}

#[test]
fn test_empty_namespace_selector_selects_all_remote_pods() {
    let mut state = ControllerState::default();

    let np = make_network_policy(
        "allow-any-namespace",
        "ns1",
        &[("pods", "applied")],
        vec![ingress_rule(vec![namespace_selector_peer()], 80)],
    );
    let np_event = ClusterEvent::added(CLUSTER_A, np);
    state.process_event(&np_event);

    // Pods with assorted labels and namespaces on every cluster.
    for (cluster, name, namespace, label, ip) in [
        (CLUSTER_A, "a1", "ns1", "selected", "1.0.0.1"),
        (CLUSTER_B, "b1", "ns1", "selected", "2.0.0.1"),
        (CLUSTER_B, "b2", "ns2", "unrelated", "2.0.0.2"),
        (CLUSTER_C, "c1", "ns3", "other", "3.0.0.1"),
    ] {
        let pod = make_test_pod(name, namespace, &[("pods", label)], ip);
        state.process_event(&ClusterEvent::added(cluster, pod));
    }

    let rnp = &state.remote_policies()[&np_event.obj_id];
    let generated = rnp.generated_policy().expect("policy should be generated");
    let rules = ingress_rules(generated);
    assert_eq!(rules.len(), 1);
    assert_eq!(
        peer_cidrs(&rules[0]),
        vec!["2.0.0.1/32", "2.0.0.2/32", "3.0.0.1/32"]
    );
}

#[test]
fn test_ip_block_only_rule_is_dropped() {
    let mut state = ControllerState::default();

    let np = make_network_policy(
        "mixed-rules",
        "ns1",
        &[("pods", "applied")],
        vec![
            ingress_rule(vec![pod_selector_peer(&[("pods", "selected")])], 80),
            ingress_rule(vec![ip_block_peer("8.8.8.8/32")], 443),
        ],
    );
    let np_event = ClusterEvent::added(CLUSTER_A, np);
    state.process_event(&np_event);

    let pod = make_test_pod("p1", "ns1", &[("pods", "selected")], "2.0.0.1");
    state.process_event(&ClusterEvent::added(CLUSTER_B, pod));

    let rnp = &state.remote_policies()[&np_event.obj_id];
    let generated = rnp.generated_policy().expect("policy should be generated");

    // The ipBlock-only rule has no pod-derived peers and disappears.
    let rules = ingress_rules(generated);
    assert_eq!(rules.len(), 1);
    assert_eq!(peer_cidrs(&rules[0]), vec!["2.0.0.1/32"]);
    assert_eq!(
        rules[0].ports.as_ref().unwrap()[0].port,
        Some(IntOrString::Int(80))
    );
}

#[test]
fn test_no_matching_pods_generates_nothing() {
    let mut state = ControllerState::default();

    let np = make_network_policy(
        "matches-nothing",
        "ns1",
        &[("pods", "applied")],
        vec![ingress_rule(
            vec![pod_selector_peer(&[("pods", "does-not-exist")])],
            80,
        )],
    );
    let np_event = ClusterEvent::added(CLUSTER_A, np);
    state.process_event(&np_event);

    for (cluster, name, ip) in [(CLUSTER_B, "p1", "2.0.0.1"), (CLUSTER_C, "p2", "3.0.0.1")] {
        let pod = make_test_pod(name, "ns1", &[("pods", "selected")], ip);
        state.process_event(&ClusterEvent::added(cluster, pod));
    }

    let rnp = &state.remote_policies()[&np_event.obj_id];
    assert!(rnp.generated_policy().is_none());
}

#[test]
fn test_pod_lifecycle_round_trip() {
    let mut state = ControllerState::default();
    let np_id = seed_single_rule_scenario(&mut state);

    let full = state.remote_policies()[&np_id]
        .generated_policy()
        .unwrap()
        .clone();

    // Delete B's pod: only C's peer remains.
    let p1 = make_test_pod("p1", "ns1", &[("pods", "selected")], "2.0.0.1");
    state.process_event(&ClusterEvent::deleted(CLUSTER_B, p1.clone()));

    {
        let generated = state.remote_policies()[&np_id].generated_policy().unwrap();
        assert_eq!(peer_cidrs(&ingress_rules(generated)[0]), vec!["3.0.0.1/32"]);
    }

    // Re-add it: the generated policy is exactly what it was before.
    state.process_event(&ClusterEvent::added(CLUSTER_B, p1.clone()));
    {
        let generated = state.remote_policies()[&np_id].generated_policy().unwrap();
        assert_eq!(generated, &full);
    }

    // Delete both remote pods: nothing left to generate.
    let p2 = make_test_pod("p2", "ns1", &[("pods", "selected")], "3.0.0.1");
    state.process_event(&ClusterEvent::deleted(CLUSTER_B, p1));
    state.process_event(&ClusterEvent::deleted(CLUSTER_C, p2));

    assert!(state.remote_policies()[&np_id].generated_policy().is_none());
}

#[test]
fn test_pod_add_delete_restores_every_index() {
    let mut state = ControllerState::default();
    let np_id = seed_single_rule_scenario(&mut state);

    let pods_before: Vec<String> = state.remote_pods().keys().cloned().collect();
    let tracked_before = state.remote_policies()[&np_id].tracked_pod_count();

    let extra = make_test_pod("extra", "ns1", &[("pods", "selected")], "2.0.0.9");
    state.process_event(&ClusterEvent::added(CLUSTER_B, extra.clone()));
    assert_eq!(state.remote_pods().len(), pods_before.len() + 1);

    state.process_event(&ClusterEvent::deleted(CLUSTER_B, extra));

    let pods_after: Vec<String> = state.remote_pods().keys().cloned().collect();
    assert_eq!(pods_after, pods_before);
    assert_eq!(
        state.remote_policies()[&np_id].tracked_pod_count(),
        tracked_before
    );
}
