// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end reconciliation scenarios, driven pass by pass against
//! in-memory agents.

use orr_controller::cluster::{ClusterManager, ClusterState};
use orr_controller::db::{
    ClusterDescriptor, ClusterMode, ClusterRecord, ConfigStore, HsmRecord,
    NodeMode, NodeRecord, PolicyRecord, ZoneRecord,
};
use orr_controller::node::{AgentConnector, NodePool};
use orr_controller::testing::{test_logger, FakeAgent, FakeConnector};
use orr_controller::watcher::NodeState;
use orr_controller::Controller;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DNS_URI: &str = "http://dns1.example.net:5353";
const ZONE_CONTENT: &str =
    "example.com. 3600 IN SOA ns1.example.com. host.example.com. 1 2 3 4 5";

fn node_uri(i: usize) -> String {
    format!("http://node{}.example.net:8080", i)
}

/// A cluster manager wired to in-memory agents, with the ids of everything
/// in its descriptor.
struct TestCluster {
    manager: ClusterManager,
    connector: Arc<FakeConnector>,
    node_ids: Vec<Uuid>,
    zone_id: Uuid,
    hsm_id: Uuid,
    policy_id: Uuid,
}

impl TestCluster {
    fn new(node_count: usize) -> TestCluster {
        let connector = FakeConnector::new();
        connector
            .agent_for(DNS_URI)
            .set_zone_content("example.com", ZONE_CONTENT);

        let node_ids: Vec<Uuid> =
            (0..node_count).map(|_| Uuid::new_v4()).collect();
        let zone_id = Uuid::new_v4();
        let hsm_id = Uuid::new_v4();
        let policy_id = Uuid::new_v4();
        let descriptor = ClusterDescriptor {
            uuid: Uuid::new_v4(),
            mode: ClusterMode::Backup,
            policy: PolicyRecord {
                uuid: policy_id,
                data: json!({ "name": "default", "signatures": "rsasha256" }),
            },
            hsms: vec![HsmRecord {
                uuid: hsm_id,
                data: json!({
                    "name": "softhsm",
                    "module": "/usr/lib/softhsm/libsofthsm.so",
                    "pin": "1234",
                }),
            }],
            nodes: node_ids
                .iter()
                .enumerate()
                .map(|(i, id)| NodeRecord {
                    uuid: *id,
                    uri: node_uri(i),
                    mode: if i == 0 {
                        NodeMode::Primary
                    } else {
                        NodeMode::Secondary
                    },
                })
                .collect(),
            zones: vec![ZoneRecord {
                uuid: zone_id,
                name: "example.com".to_string(),
                input_type: "lim_plugin_dns".to_string(),
                input_data: json!({
                    "host": "dns1.example.net",
                    "port": 5353,
                }),
            }],
        };

        let pool =
            Arc::new(NodePool::new(test_logger(), Arc::clone(&connector) as Arc<dyn AgentConnector>));
        let dyn_connector: Arc<dyn AgentConnector> =
            Arc::clone(&connector) as Arc<dyn AgentConnector>;
        let manager = ClusterManager::new(
            &test_logger(),
            &pool,
            &dyn_connector,
            descriptor,
        )
        .expect("valid descriptor");
        TestCluster {
            manager,
            connector,
            node_ids,
            zone_id,
            hsm_id,
            policy_id,
        }
    }

    fn agent(&self, i: usize) -> Arc<FakeAgent> {
        self.connector.agent_for(&node_uri(i))
    }

    async fn reconcile(&mut self, passes: usize) {
        for _ in 0..passes {
            self.manager.reconcile_once().await.expect("no invariant breach");
        }
    }

    fn messages(&self) -> Vec<String> {
        self.manager
            .status()
            .events
            .into_iter()
            .map(|event| event.message)
            .collect()
    }
}

/// Assert that `needles` appear in `haystack` in the given order (not
/// necessarily adjacent).
fn assert_subsequence(haystack: &[String], needles: &[String]) {
    let mut remaining = haystack.iter();
    for needle in needles {
        assert!(
            remaining.any(|message| message == needle),
            "log line {:?} missing or out of order; log was {:#?}",
            needle,
            haystack,
        );
    }
}

#[tokio::test]
async fn test_single_node_cold_start() {
    let mut tc = TestCluster::new(1);
    tc.manager.probe_nodes().await;
    tc.reconcile(6).await;

    assert_eq!(tc.manager.state(), ClusterState::Operational);
    assert_eq!(
        tc.manager.status().nodes[&tc.node_ids[0]],
        NodeState::Online
    );
    let status = tc.manager.status();
    let zone = &status.zones[&tc.zone_id];
    assert!(zone.setup_done);
    assert!(zone.fetched_at.is_some());
    assert_subsequence(
        &tc.messages(),
        &[
            "Fetching version information from nodes".to_string(),
            "Version information correct and supported".to_string(),
            format!("Setting up HSM {}", tc.hsm_id),
            "All HSMs setup ok".to_string(),
            format!("Setting up Policy {}", tc.policy_id),
            "Policy setup ok".to_string(),
            "Verifying OpenDNSSEC is running and starting if not".to_string(),
            "Reload OpenDNSSEC on nodes that need it".to_string(),
            format!("Fetching zone content for zone {}", tc.zone_id),
            format!("Zone content for zone {} fetched", tc.zone_id),
            format!("Setting up zone {}", tc.zone_id),
            format!("Zone {} setup ok", tc.zone_id),
            "Cluster operational".to_string(),
        ],
    );

    // The node ended up with the repository, the policy, a running signer
    // and the zone installed.
    let agent = tc.agent(0);
    let calls = agent.calls();
    for call in [
        "OpenDNSSEC.CreateRepository",
        "OpenDNSSEC.CreatePolicy",
        "OpenDNSSEC.UpdateControlStart",
        "OpenDNSSEC.UpdateEnforcerUpdate",
        "DNS.CreateZone",
        "OpenDNSSEC.CreateEnforcerZone",
    ] {
        assert!(
            calls.contains(&call.to_string()),
            "missing call {:?} in {:?}",
            call,
            calls
        );
    }
}

#[tokio::test]
async fn test_unsupported_version_fails_node_and_cluster() {
    let mut tc = TestCluster::new(1);
    tc.agent(0).set_program_version("ods-signerd", "1.3.13");

    tc.manager.probe_nodes().await;
    tc.reconcile(6).await;

    assert_eq!(tc.manager.state(), ClusterState::Failure);
    assert_eq!(
        tc.manager.status().nodes[&tc.node_ids[0]],
        NodeState::Failure
    );
    let expected = format!(
        "Software ods-signerd version 1.3.13 on node {} is not supported. \
         Supported are minimum version 1.3.14 and maximum version 1.3.15",
        tc.node_ids[0]
    );
    assert!(
        tc.messages().contains(&expected),
        "missing {:?} in {:#?}",
        expected,
        tc.messages()
    );
}

#[tokio::test]
async fn test_transient_offline_degrades_cluster() {
    let mut tc = TestCluster::new(2);
    tc.agent(1).set_reachable(false);

    tc.manager.probe_nodes().await;
    assert_eq!(
        tc.manager.status().nodes[&tc.node_ids[1]],
        NodeState::Offline
    );
    tc.reconcile(6).await;

    assert_eq!(tc.manager.state(), ClusterState::Degraded);
    assert!(tc
        .messages()
        .contains(&"Nodes failure:0 offline:1".to_string()));

    // Zone setup still fanned out to the healthy node; the offline one was
    // skipped rather than treated as a failure.
    assert!(tc
        .agent(0)
        .calls()
        .contains(&"OpenDNSSEC.CreateEnforcerZone".to_string()));
    assert!(!tc.agent(1).calls().contains(&"DNS.ReadZones".to_string()));
    assert!(tc
        .messages()
        .contains(&format!("Zone {} setup ok", tc.zone_id)));
}

#[tokio::test]
async fn test_offline_node_recovery_reinitializes_cluster() {
    let mut tc = TestCluster::new(2);
    tc.agent(1).set_reachable(false);
    tc.manager.probe_nodes().await;
    tc.reconcile(6).await;
    assert_eq!(tc.manager.state(), ClusterState::Degraded);

    // The node comes back: the next probe sees it, the next pass tears the
    // cluster back to INITIALIZING, and the one after that re-provisions.
    tc.agent(1).set_reachable(true);
    tc.manager.probe_nodes().await;
    assert_eq!(
        tc.manager.status().nodes[&tc.node_ids[1]],
        NodeState::Standby
    );
    tc.reconcile(1).await;
    assert_eq!(tc.manager.state(), ClusterState::Initializing);
    assert!(tc.messages().contains(
        &"Cluster (re)initializing because of nodes in STANDBY state"
            .to_string()
    ));

    tc.reconcile(8).await;
    assert_eq!(tc.manager.state(), ClusterState::Operational);
    assert_eq!(
        tc.manager.status().nodes[&tc.node_ids[1]],
        NodeState::Online
    );
    // The recovered node was provisioned from scratch.
    let calls = tc.agent(1).calls();
    for call in ["OpenDNSSEC.CreateRepository", "DNS.CreateZone"] {
        assert!(
            calls.contains(&call.to_string()),
            "missing call {:?} on recovered node; saw {:?}",
            call,
            calls
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_settled_cluster_goes_quiet() {
    let mut tc = TestCluster::new(1);
    tc.manager.probe_nodes().await;
    tc.reconcile(6).await;
    assert_eq!(tc.manager.state(), ClusterState::Operational);

    // A settled cluster makes no RPCs at all on further passes...
    let baseline = tc.connector.total_calls();
    tc.reconcile(2).await;
    tc.manager.probe_nodes().await;
    assert_eq!(tc.connector.total_calls(), baseline);

    // ...except the liveness ping once the node has been quiet for 30s.
    tokio::time::advance(Duration::from_secs(31)).await;
    tc.manager.probe_nodes().await;
    assert_eq!(tc.connector.total_calls(), baseline + 1);
    tc.reconcile(1).await;
    assert_eq!(tc.connector.total_calls(), baseline + 1);
    assert_eq!(tc.manager.state(), ClusterState::Operational);
}

#[tokio::test]
async fn test_node_add_reinitializes_cluster() {
    let mut tc = TestCluster::new(1);
    tc.manager.probe_nodes().await;
    tc.reconcile(6).await;
    assert_eq!(tc.manager.state(), ClusterState::Operational);

    let new_id = Uuid::new_v4();
    tc.manager.add_node(new_id, &node_uri(1)).unwrap();

    // The next pass starts over from scratch and then waits for the new
    // node to be probed.
    tc.reconcile(1).await;
    assert_eq!(tc.manager.state(), ClusterState::Initializing);
    assert!(tc.messages().contains(&"Resetting".to_string()));

    tc.manager.probe_nodes().await;
    tc.reconcile(8).await;
    assert_eq!(tc.manager.state(), ClusterState::Operational);
    assert_eq!(tc.manager.status().nodes[&new_id], NodeState::Online);

    // The newcomer went through the full provisioning sequence.
    let calls = tc.agent(1).calls();
    for call in [
        "OpenDNSSEC.CreateRepository",
        "OpenDNSSEC.CreatePolicy",
        "DNS.CreateZone",
    ] {
        assert!(
            calls.contains(&call.to_string()),
            "missing call {:?} on new node; saw {:?}",
            call,
            calls
        );
    }
}

#[tokio::test]
async fn test_zone_fetch_failure_halts_cluster() {
    let mut tc = TestCluster::new(1);
    tc.connector
        .agent_for(DNS_URI)
        .with_state(|state| state.zone_content.clear());

    tc.manager.probe_nodes().await;
    tc.reconcile(6).await;

    assert_eq!(tc.manager.state(), ClusterState::Failure);
    assert!(tc
        .messages()
        .contains(&format!("Unable to fetch zone {} content", tc.zone_id)));

    // FAILURE is a fixpoint: no further RPC activity of any kind.
    let baseline = tc.connector.total_calls();
    tc.reconcile(3).await;
    tc.manager.probe_nodes().await;
    assert_eq!(tc.connector.total_calls(), baseline);

    // An operator reset starts over, and with the input healthy again the
    // cluster comes up.
    tc.connector
        .agent_for(DNS_URI)
        .set_zone_content("example.com", ZONE_CONTENT);
    tc.manager.reset();
    tc.manager.probe_nodes().await;
    tc.reconcile(8).await;
    assert_eq!(tc.manager.state(), ClusterState::Operational);
}

#[tokio::test]
async fn test_unknown_node_outside_initialization_is_fatal() {
    let mut tc = TestCluster::new(1);
    tc.manager.probe_nodes().await;
    tc.reconcile(6).await;
    assert_eq!(tc.manager.state(), ClusterState::Operational);

    tc.manager.set_node_state(tc.node_ids[0], NodeState::Unknown);
    assert!(tc.manager.reconcile_once().await.is_err());
}

#[tokio::test]
async fn test_zone_remove_is_deferred() {
    let mut tc = TestCluster::new(1);
    tc.manager.probe_nodes().await;
    tc.reconcile(6).await;
    assert_eq!(tc.manager.state(), ClusterState::Operational);

    tc.manager.remove_zone(tc.zone_id);
    assert!(tc.manager.status().zones[&tc.zone_id].pending_remove);
    tc.reconcile(1).await;
    // The zone is gone from management and the cluster stays settled; no
    // node-side tear-down happens.
    assert!(tc.manager.status().zones.is_empty());
    let baseline = tc.connector.total_calls();
    tc.reconcile(2).await;
    assert_eq!(tc.connector.total_calls(), baseline);
    assert_eq!(tc.manager.state(), ClusterState::Operational);
}

#[tokio::test(start_paused = true)]
async fn test_spawned_manager_converges_and_serves_status() {
    let tc = TestCluster::new(1);
    let handle = tc.manager.spawn();

    let mut reached_operational = false;
    for _ in 0..200 {
        if let Some(status) = handle.status().await {
            if status.state == ClusterState::Operational {
                reached_operational = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(reached_operational, "cluster never reached OPERATIONAL");
    handle.stop().await;
}

fn seed_store(store: &ConfigStore, input_type: &str) -> Uuid {
    let cluster =
        ClusterRecord { uuid: Uuid::new_v4(), mode: ClusterMode::Failover };
    store.cluster_create(&cluster).unwrap();

    let node = NodeRecord {
        uuid: Uuid::new_v4(),
        uri: node_uri(0),
        mode: NodeMode::Primary,
    };
    store.node_create(&node).unwrap();
    store.cluster_add_node(cluster.uuid, node.uuid).unwrap();

    let zone = ZoneRecord {
        uuid: Uuid::new_v4(),
        name: "example.com".to_string(),
        input_type: input_type.to_string(),
        input_data: json!({ "host": "dns1.example.net", "port": 5353 }),
    };
    store.zone_create(&zone).unwrap();
    store.cluster_add_zone(cluster.uuid, zone.uuid).unwrap();

    let policy = PolicyRecord {
        uuid: Uuid::new_v4(),
        data: json!({ "name": "default" }),
    };
    store.policy_create(&policy).unwrap();
    store.cluster_set_policy(cluster.uuid, policy.uuid).unwrap();

    cluster.uuid
}

#[tokio::test(start_paused = true)]
async fn test_controller_bootstrap_from_store() {
    let store = Arc::new(ConfigStore::open_in_memory(test_logger()).unwrap());
    let cluster_id = seed_store(&store, "lim_plugin_dns");

    let connector = FakeConnector::new();
    connector
        .agent_for(DNS_URI)
        .set_zone_content("example.com", ZONE_CONTENT);
    let pool = Arc::new(NodePool::new(test_logger(), Arc::clone(&connector) as Arc<dyn AgentConnector>));
    let dyn_connector: Arc<dyn AgentConnector> = connector;

    let controller =
        Controller::start_with(test_logger(), store, pool, dyn_connector)
            .unwrap();
    assert_eq!(controller.clusters().count(), 1);
    let handle = controller.cluster(cluster_id).unwrap();

    let mut reached_operational = false;
    for _ in 0..200 {
        if let Some(status) = handle.status().await {
            if status.state == ClusterState::Operational {
                reached_operational = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(reached_operational, "cluster never reached OPERATIONAL");
    controller.stop().await;
}

#[tokio::test]
async fn test_misconfigured_cluster_is_skipped() {
    let store = Arc::new(ConfigStore::open_in_memory(test_logger()).unwrap());
    seed_store(&store, "no_such_input");

    let connector = FakeConnector::new();
    let pool = Arc::new(NodePool::new(test_logger(), Arc::clone(&connector) as Arc<dyn AgentConnector>));
    let dyn_connector: Arc<dyn AgentConnector> = connector;

    let controller =
        Controller::start_with(test_logger(), store, pool, dyn_connector)
            .unwrap();
    assert_eq!(controller.clusters().count(), 0);
    controller.stop().await;
}
