// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-cluster node tracking: liveness probing, state transitions, and RPC
//! fan-out with per-node result aggregation.

use crate::node::{NodeError, NodeHandle, NodeOp, NodePool, NodeValue, NodeVersions};
use futures::future;
use orr_agent_client::{AgentUri, UriError};
use orr_common::json::canonical;
use slog::{debug, info, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// How often a probe pass runs while the owning cluster is active.
pub const PROBE_PERIOD: Duration = Duration::from_secs(5);

/// A node that has been quiet this long gets pinged again even though it
/// was healthy last time we looked.
const RECHECK_AFTER: Duration = Duration::from_secs(30);

/// Liveness state of one managed node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    /// Newly added, never successfully probed.
    Unknown,
    /// The last probe failed.
    Offline,
    /// Healthy and fully initialized into the cluster.
    Online,
    /// Taken out of service because of unsupported software or an invariant
    /// breach; only an operator brings it back.
    Failure,
    /// Healthy but not yet (re)initialized into the cluster.
    Standby,
    /// Administratively excluded.
    Disabled,
}

impl NodeState {
    fn label(&self) -> &'static str {
        match self {
            NodeState::Unknown => "UNKNOWN",
            NodeState::Offline => "OFFLINE",
            NodeState::Online => "ONLINE",
            NodeState::Failure => "FAILURE",
            NodeState::Standby => "STANDBY",
            NodeState::Disabled => "DISABLED",
        }
    }

    /// Whether fan-out work may be dispatched to a node in this state.
    pub fn callable(&self) -> bool {
        matches!(self, NodeState::Online | NodeState::Standby)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

struct NodeEntry {
    handle: Arc<NodeHandle>,
    state: NodeState,
    /// Inventory from the last successful version collection; lets repeated
    /// version fan-outs complete without touching the node.
    versions: Option<NodeVersions>,
    /// Canonical encodings of repository payloads already applied.
    repositories: BTreeSet<String>,
    pending_remove: bool,
}

/// The per-node outcome map produced by a fan-out.  Nodes that could not be
/// asked at all carry [`NodeError::Unavailable`].
pub type FanoutResult = BTreeMap<Uuid, Result<NodeValue, NodeError>>;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("node {0} is already registered")]
    DuplicateNode(Uuid),
    #[error(transparent)]
    Uri(#[from] UriError),
}

/// Tracks the nodes of one cluster.  Owned exclusively by that cluster's
/// manager task, so none of this needs interior locking.
pub struct NodeWatcher {
    log: Logger,
    pool: Arc<NodePool>,
    nodes: BTreeMap<Uuid, NodeEntry>,
}

impl NodeWatcher {
    pub fn new(log: Logger, pool: Arc<NodePool>) -> NodeWatcher {
        NodeWatcher { log, pool, nodes: BTreeMap::new() }
    }

    /// Register a node.  Fails on a duplicate id or a malformed URI; the
    /// node starts out UNKNOWN until a probe reaches it.
    pub fn add_node(&mut self, id: Uuid, uri: &str) -> Result<(), WatcherError> {
        if self.nodes.contains_key(&id) {
            return Err(WatcherError::DuplicateNode(id));
        }
        let uri = AgentUri::parse(uri)?;
        let handle = self.pool.acquire(&uri);
        info!(self.log, "node registered"; "node_id" => %id, "uri" => %handle.uri());
        self.nodes.insert(
            id,
            NodeEntry {
                handle,
                state: NodeState::Unknown,
                versions: None,
                repositories: BTreeSet::new(),
                pending_remove: false,
            },
        );
        Ok(())
    }

    /// Flag a node for removal.  The entry is dropped by the next probe
    /// pass, between fan-outs, never mid-RPC.  Returns whether the node was
    /// known.
    pub fn remove_node(&mut self, id: Uuid) -> bool {
        match self.nodes.get_mut(&id) {
            Some(entry) => {
                entry.pending_remove = true;
                true
            }
            None => false,
        }
    }

    pub fn set_state(&mut self, id: Uuid, state: NodeState) -> bool {
        match self.nodes.get_mut(&id) {
            Some(entry) => {
                if entry.state != state {
                    debug!(self.log, "node state set";
                        "node_id" => %id,
                        "from" => %entry.state,
                        "to" => %state,
                    );
                }
                entry.state = state;
                true
            }
            None => false,
        }
    }

    pub fn node_states(&self) -> BTreeMap<Uuid, NodeState> {
        self.nodes
            .iter()
            .filter(|(_, entry)| !entry.pending_remove)
            .map(|(id, entry)| (*id, entry.state))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn any_unknown(&self) -> bool {
        self.nodes.values().any(|entry| {
            !entry.pending_remove && entry.state == NodeState::Unknown
        })
    }

    /// One probe pass: reap entries flagged for removal, ping every node
    /// that is due, and apply liveness transitions from the results.
    pub async fn probe(&mut self) {
        let log = self.log.clone();
        self.nodes.retain(|id, entry| {
            if entry.pending_remove {
                info!(log, "node removed"; "node_id" => %id);
            }
            !entry.pending_remove
        });

        let now = Instant::now();
        let mut pings = Vec::new();
        for (id, entry) in &self.nodes {
            let due = match entry.state {
                NodeState::Unknown | NodeState::Offline => true,
                NodeState::Online | NodeState::Standby => {
                    match entry.handle.last_ping() {
                        Some(at) => now.duration_since(at) > RECHECK_AFTER,
                        None => true,
                    }
                }
                NodeState::Failure | NodeState::Disabled => false,
            };
            if due {
                pings.push((*id, entry.handle.submit(NodeOp::Ping)));
            }
        }

        let results = future::join_all(pings.into_iter().map(
            |(id, completion)| async move {
                let result = match completion.await {
                    Ok(result) => result,
                    Err(_) => Err(NodeError::Stopped),
                };
                (id, result)
            },
        ))
        .await;

        for (id, result) in results {
            let Some(entry) = self.nodes.get_mut(&id) else { continue };
            match result {
                Ok(_) => {
                    if matches!(
                        entry.state,
                        NodeState::Unknown | NodeState::Offline
                    ) {
                        info!(self.log, "node answered";
                            "node_id" => %id,
                            "was" => %entry.state,
                        );
                        entry.state = NodeState::Standby;
                    }
                }
                Err(error) => {
                    if matches!(
                        entry.state,
                        NodeState::Online
                            | NodeState::Standby
                            | NodeState::Unknown
                    ) {
                        warn!(self.log, "node unreachable";
                            "node_id" => %id,
                            "was" => %entry.state,
                            "error" => %error,
                        );
                        entry.state = NodeState::Offline;
                        entry.versions = None;
                        entry.repositories.clear();
                    }
                }
            }
        }
    }

    /// Fan `op` out to every node.
    pub async fn broadcast(&mut self, op: &NodeOp) -> FanoutResult {
        let targets: Vec<Uuid> = self.nodes.keys().copied().collect();
        self.broadcast_to(&targets, op).await
    }

    /// Fan `op` out to `targets`.  Non-callable nodes get an immediate
    /// `Unavailable` slot; the rest have the work queued on their pumps and
    /// the map completes when the last completion fires.
    pub async fn broadcast_to(
        &mut self,
        targets: &[Uuid],
        op: &NodeOp,
    ) -> FanoutResult {
        let mut results = FanoutResult::new();
        let mut waits = Vec::new();
        for id in targets {
            let Some(entry) = self.nodes.get(id) else { continue };
            if entry.pending_remove || !entry.state.callable() {
                results.insert(*id, Err(NodeError::Unavailable));
                continue;
            }
            // Short-circuits: answers we already hold.
            match op {
                NodeOp::Versions => {
                    if let Some(versions) = &entry.versions {
                        results.insert(
                            *id,
                            Ok(NodeValue::Versions(versions.clone())),
                        );
                        continue;
                    }
                }
                NodeOp::SetupHsm { data } => {
                    if entry.repositories.contains(&canonical(data)) {
                        results
                            .insert(*id, Ok(NodeValue::Setup { mutated: false }));
                        continue;
                    }
                }
                _ => (),
            }
            waits.push((*id, entry.handle.submit(op.clone())));
        }

        let completed = future::join_all(waits.into_iter().map(
            |(id, completion)| async move {
                let result = match completion.await {
                    Ok(result) => result,
                    Err(_) => Err(NodeError::Stopped),
                };
                (id, result)
            },
        ))
        .await;

        for (id, result) in completed {
            if let Ok(value) = &result {
                if let Some(entry) = self.nodes.get_mut(&id) {
                    match (op, value) {
                        (_, NodeValue::Versions(versions)) => {
                            entry.versions = Some(versions.clone());
                        }
                        (
                            NodeOp::SetupHsm { data },
                            NodeValue::Setup { .. },
                        ) => {
                            entry.repositories.insert(canonical(data));
                        }
                        _ => (),
                    }
                }
            }
            results.insert(id, result);
        }
        results
    }
}

#[cfg(test)]
mod test {
    use super::{NodeState, NodeWatcher, WatcherError};
    use crate::node::{NodeError, NodeOp, NodePool, NodeValue};
    use crate::testing::{test_logger, FakeAgent, FakeConnector};
    use std::sync::Arc;
    use uuid::Uuid;

    const URI_A: &str = "http://node-a.example.net:8080";
    const URI_B: &str = "http://node-b.example.net:8080";

    fn watcher_with(
        agents: &[(&str, Arc<FakeAgent>)],
    ) -> (NodeWatcher, Vec<Uuid>) {
        let connector = FakeConnector::new();
        for (uri, agent) in agents {
            connector.register(uri, Arc::clone(agent));
        }
        let pool = Arc::new(NodePool::new(test_logger(), connector));
        let mut watcher = NodeWatcher::new(test_logger(), pool);
        let mut ids = Vec::new();
        for (uri, _) in agents {
            let id = Uuid::new_v4();
            watcher.add_node(id, uri).unwrap();
            ids.push(id);
        }
        (watcher, ids)
    }

    #[tokio::test]
    async fn test_add_node_validation() {
        let agent = FakeAgent::healthy();
        let (mut watcher, ids) = watcher_with(&[(URI_A, agent)]);

        assert!(matches!(
            watcher.add_node(ids[0], URI_A),
            Err(WatcherError::DuplicateNode(_))
        ));
        assert!(matches!(
            watcher.add_node(Uuid::new_v4(), "not a uri"),
            Err(WatcherError::Uri(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_transitions() {
        let agent = FakeAgent::healthy();
        let (mut watcher, ids) =
            watcher_with(&[(URI_A, Arc::clone(&agent))]);
        let id = ids[0];

        assert_eq!(watcher.node_states()[&id], NodeState::Unknown);
        watcher.probe().await;
        assert_eq!(watcher.node_states()[&id], NodeState::Standby);

        // A healthy standby node is left alone by further probes.
        watcher.probe().await;
        assert_eq!(watcher.node_states()[&id], NodeState::Standby);

        // Losing the node takes it to OFFLINE and clears its caches; a
        // successful probe afterwards brings it back as STANDBY.
        agent.set_reachable(false);
        watcher.probe().await;
        assert_eq!(watcher.node_states()[&id], NodeState::Offline);
        agent.set_reachable(true);
        watcher.probe().await;
        assert_eq!(watcher.node_states()[&id], NodeState::Standby);
    }

    #[tokio::test]
    async fn test_broadcast_marks_unavailable_nodes() {
        let agent_a = FakeAgent::healthy();
        let agent_b = FakeAgent::healthy();
        agent_b.set_reachable(false);
        let (mut watcher, ids) = watcher_with(&[
            (URI_A, Arc::clone(&agent_a)),
            (URI_B, Arc::clone(&agent_b)),
        ]);
        watcher.probe().await;
        assert_eq!(watcher.node_states()[&ids[0]], NodeState::Standby);
        assert_eq!(watcher.node_states()[&ids[1]], NodeState::Offline);

        let results = watcher.broadcast(&NodeOp::Versions).await;
        assert!(matches!(
            results[&ids[0]],
            Ok(NodeValue::Versions(_))
        ));
        assert!(matches!(
            results[&ids[1]],
            Err(NodeError::Unavailable)
        ));
        // The offline node's agent never saw a versions request.
        assert!(!agent_b
            .calls()
            .contains(&"Agent.ReadPlugins".to_string()));
    }

    #[tokio::test]
    async fn test_version_cache_short_circuits() {
        let agent = FakeAgent::healthy();
        let (mut watcher, _ids) =
            watcher_with(&[(URI_A, Arc::clone(&agent))]);
        watcher.probe().await;

        watcher.broadcast(&NodeOp::Versions).await;
        let calls_after_first = agent.calls().len();
        watcher.broadcast(&NodeOp::Versions).await;
        assert_eq!(agent.calls().len(), calls_after_first);
    }

    #[tokio::test]
    async fn test_repository_cache_short_circuits() {
        let agent = FakeAgent::healthy();
        let (mut watcher, ids) =
            watcher_with(&[(URI_A, Arc::clone(&agent))]);
        watcher.probe().await;

        let op = NodeOp::SetupHsm {
            data: serde_json::json!({ "name": "softhsm" }),
        };
        let results = watcher.broadcast(&op).await;
        assert!(
            matches!(results[&ids[0]], Ok(NodeValue::Setup { mutated: true }))
        );
        let calls_after_first = agent.calls().len();

        let results = watcher.broadcast(&op).await;
        assert!(matches!(
            results[&ids[0]],
            Ok(NodeValue::Setup { mutated: false })
        ));
        assert_eq!(agent.calls().len(), calls_after_first);
    }

    #[tokio::test]
    async fn test_deferred_removal() {
        let agent = FakeAgent::healthy();
        let (mut watcher, ids) = watcher_with(&[(URI_A, agent)]);
        let id = ids[0];

        assert!(watcher.remove_node(id));
        // Still present until the next probe pass, but no longer callable.
        assert_eq!(watcher.len(), 1);
        assert!(watcher.node_states().is_empty());
        let results = watcher.broadcast(&NodeOp::Versions).await;
        assert!(matches!(results[&id], Err(NodeError::Unavailable)));

        watcher.probe().await;
        assert_eq!(watcher.len(), 0);
    }
}
