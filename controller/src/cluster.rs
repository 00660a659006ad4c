// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-cluster reconciliation: the state machine that drives a set of bare
//! node agents into an operational, redundantly-signing cluster and keeps
//! it there.
//!
//! A manager is a single task.  It alternates between probe passes (node
//! liveness, every 5 s) and reconciliation passes, and services mutation
//! commands in between; every fan-out is awaited inline, so no two phases
//! ever overlap and deferred removals never land mid-RPC.  A pass works
//! through the phases in order -- version check, HSM upsert, policy upsert,
//! signer start, reload drain, cluster state aggregation, per-zone work --
//! each phase idempotent and skipped once its result is cached.  Progress
//! resets the pass interval to zero; idle passes back the interval off up
//! to [`MAX_BACKOFF_SECS`].

use crate::db::{ClusterDescriptor, ClusterMode, HsmRecord, PolicyRecord, ZoneRecord};
use crate::node::{AgentConnector, NodeError, NodeOp, NodePool, NodeValue, NodeVersions};
use crate::watcher::{NodeState, NodeWatcher, WatcherError, PROBE_PERIOD};
use crate::zone_input::{zone_input_for, ZoneInput, ZoneInputError};
use chrono::{DateTime, Utc};
use orr_common::version::{SUPPORTED_PLUGINS, SUPPORTED_PROGRAMS};
use slog::{debug, error, info, o, warn, Logger};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// Ceiling of the reconciliation back-off, in seconds.
pub const MAX_BACKOFF_SECS: u64 = 10;

/// The event log keeps this many entries.
const EVENT_LOG_CAP: usize = 256;

/// Aggregated health of one cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterState {
    /// Working through the provisioning phases.
    Initializing,
    /// Every node is online and every zone is set up.
    Operational,
    /// Running, but some nodes are offline or failed.
    Degraded,
    /// Too unhealthy to meet its redundancy mode.
    Disfunctional,
    /// Halted; no RPC activity until an operator resets the cluster.
    Failure,
    /// Administratively stopped.
    Disabled,
}

impl ClusterState {
    fn label(&self) -> &'static str {
        match self {
            ClusterState::Initializing => "INITIALIZING",
            ClusterState::Operational => "OPERATIONAL",
            ClusterState::Degraded => "DEGRADED",
            ClusterState::Disfunctional => "DISFUNCTIONAL",
            ClusterState::Failure => "FAILURE",
            ClusterState::Disabled => "DISABLED",
        }
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One line of the user-visible cluster log.
#[derive(Clone, Debug)]
pub struct ClusterEvent {
    pub time: DateTime<Utc>,
    pub message: String,
}

/// Point-in-time snapshot of a cluster for operators and tests.
#[derive(Clone, Debug)]
pub struct ClusterStatus {
    pub state: ClusterState,
    pub interval: u64,
    pub nodes: BTreeMap<Uuid, NodeState>,
    pub zones: BTreeMap<Uuid, ZoneStatus>,
    pub events: Vec<ClusterEvent>,
}

/// The runtime shadow of one zone, as reported in [`ClusterStatus`].
#[derive(Clone, Debug)]
pub struct ZoneStatus {
    pub name: String,
    pub fetched_at: Option<DateTime<Utc>>,
    pub setup_done: bool,
    pub pending_remove: bool,
}

/// Raised when reconciliation observes a state its rules exclude; the
/// cluster halts on it.
#[derive(Debug, thiserror::Error)]
#[error("invariant violated in cluster {cluster_id}: {message}")]
pub struct InvariantError {
    pub cluster_id: Uuid,
    pub message: String,
}

/// A descriptor that cannot be turned into a running manager.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cluster {cluster_id}, node {node_id}")]
    Node {
        cluster_id: Uuid,
        node_id: Uuid,
        #[source]
        error: WatcherError,
    },
    #[error("cluster {cluster_id}, zone {zone_id}")]
    Zone {
        cluster_id: Uuid,
        zone_id: Uuid,
        #[source]
        error: ZoneInputError,
    },
}

/// Scratch state for one reconciliation sequence.  Cleared whenever the
/// cluster goes back to INITIALIZING.
#[derive(Default)]
struct ReconcileCache {
    /// Set by node mutations; the next pass starts over from scratch.
    reset: bool,
    /// Inventory collected by the version phase, `None` per node that could
    /// not be asked.
    versions: Option<BTreeMap<Uuid, Option<NodeVersions>>>,
    hsms_attempted: BTreeSet<Uuid>,
    hsms_setup: bool,
    policy_setup: bool,
    running: bool,
    /// Nodes whose signer must re-read its configuration, accumulated
    /// across the setup phases and drained atomically.
    reload: BTreeSet<Uuid>,
}

/// Runtime shadow of one managed zone.
struct ZoneEntry {
    name: String,
    input: Box<dyn ZoneInput>,
    content: Option<String>,
    fetched_at: Option<DateTime<Utc>>,
    setup_done: bool,
    pending_remove: bool,
}

impl ZoneEntry {
    fn clear_runtime(&mut self) {
        self.content = None;
        self.fetched_at = None;
        self.setup_done = false;
    }
}

/// Commands accepted by a running manager.
pub enum ClusterCommand {
    NodeAdd {
        id: Uuid,
        uri: String,
        reply: oneshot::Sender<Result<(), WatcherError>>,
    },
    NodeRemove {
        id: Uuid,
    },
    SetNodeState {
        id: Uuid,
        state: NodeState,
    },
    ZoneAdd {
        zone: ZoneRecord,
        reply: oneshot::Sender<Result<(), ZoneInputError>>,
    },
    ZoneRemove {
        id: Uuid,
    },
    /// Operator reset: the only way out of FAILURE.
    Reset,
    Disable,
    Status {
        reply: oneshot::Sender<ClusterStatus>,
    },
    Stop,
}

pub struct ClusterManager {
    id: Uuid,
    mode: ClusterMode,
    log: Logger,
    connector: Arc<dyn AgentConnector>,
    watcher: NodeWatcher,
    policy: PolicyRecord,
    hsms: Vec<HsmRecord>,
    zones: BTreeMap<Uuid, ZoneEntry>,
    cache: ReconcileCache,
    state: ClusterState,
    events: VecDeque<ClusterEvent>,
    interval: u64,
    /// Last per-node failure/offline counts written to the event log, to
    /// keep the aggregation phase from repeating itself every pass.
    last_health: Option<(usize, usize)>,
    announced_operational: bool,
}

impl ClusterManager {
    /// Build a manager from its stored descriptor.  Nothing is contacted
    /// yet; nodes start out UNKNOWN and the first passes take it from
    /// there.
    pub fn new(
        log: &Logger,
        pool: &Arc<NodePool>,
        connector: &Arc<dyn AgentConnector>,
        descriptor: ClusterDescriptor,
    ) -> Result<ClusterManager, ConfigError> {
        let cluster_id = descriptor.uuid;
        let log = log.new(o!(
            "component" => "cluster-manager",
            "cluster_id" => cluster_id.to_string(),
        ));
        let mut watcher =
            NodeWatcher::new(log.new(o!("component" => "node-watcher")), Arc::clone(pool));
        for node in &descriptor.nodes {
            watcher.add_node(node.uuid, &node.uri).map_err(|error| {
                ConfigError::Node { cluster_id, node_id: node.uuid, error }
            })?;
        }

        let mut manager = ClusterManager {
            id: cluster_id,
            mode: descriptor.mode,
            log,
            connector: Arc::clone(connector),
            watcher,
            policy: descriptor.policy,
            hsms: descriptor.hsms,
            zones: BTreeMap::new(),
            cache: ReconcileCache::default(),
            state: ClusterState::Initializing,
            events: VecDeque::new(),
            interval: 0,
            last_health: None,
            announced_operational: false,
        };
        for zone in descriptor.zones {
            let zone_id = zone.uuid;
            manager.insert_zone(zone).map_err(|error| ConfigError::Zone {
                cluster_id,
                zone_id,
                error,
            })?;
        }
        Ok(manager)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn status(&self) -> ClusterStatus {
        ClusterStatus {
            state: self.state,
            interval: self.interval,
            nodes: self.watcher.node_states(),
            zones: self
                .zones
                .iter()
                .map(|(id, zone)| {
                    (
                        *id,
                        ZoneStatus {
                            name: zone.name.clone(),
                            fetched_at: zone.fetched_at,
                            setup_done: zone.setup_done,
                            pending_remove: zone.pending_remove,
                        },
                    )
                })
                .collect(),
            events: self.events.iter().cloned().collect(),
        }
    }

    /// Register a node at runtime.  Forces a full re-initialization on the
    /// next pass.
    pub fn add_node(&mut self, id: Uuid, uri: &str) -> Result<(), WatcherError> {
        self.watcher.add_node(id, uri)?;
        self.cache.reset = true;
        Ok(())
    }

    /// Deregister a node.  Removal is deferred to the watcher's next probe
    /// pass; reconciliation restarts from scratch.
    pub fn remove_node(&mut self, id: Uuid) {
        if self.watcher.remove_node(id) {
            self.cache.reset = true;
        }
    }

    pub fn set_node_state(&mut self, id: Uuid, state: NodeState) {
        self.watcher.set_state(id, state);
    }

    /// Put a zone under management at runtime.
    pub fn add_zone(&mut self, zone: ZoneRecord) -> Result<(), ZoneInputError> {
        self.insert_zone(zone)
    }

    /// Detach a zone.  The entry disappears on the next per-zone pass; no
    /// node-side tear-down is performed.
    pub fn remove_zone(&mut self, id: Uuid) {
        if let Some(zone) = self.zones.get_mut(&id) {
            zone.pending_remove = true;
        }
    }

    /// Operator reset: clears all progress and starts over.  This is the
    /// only way out of FAILURE (and DISABLED).
    pub fn reset(&mut self) {
        self.state = ClusterState::Initializing;
        self.cache = ReconcileCache::default();
        self.cache.reset = true;
        self.interval = 0;
    }

    pub fn disable(&mut self) {
        self.transition(ClusterState::Disabled, "Cluster disabled");
    }

    fn insert_zone(&mut self, zone: ZoneRecord) -> Result<(), ZoneInputError> {
        let input = zone_input_for(
            &zone.name,
            &zone.input_type,
            &zone.input_data,
            &self.connector,
        )?;
        self.zones.insert(
            zone.uuid,
            ZoneEntry {
                name: zone.name,
                input,
                content: None,
                fetched_at: None,
                setup_done: false,
                pending_remove: false,
            },
        );
        Ok(())
    }

    /// One probe pass, skipped entirely while the cluster is halted.
    pub async fn probe_nodes(&mut self) {
        if matches!(self.state, ClusterState::Failure | ClusterState::Disabled)
        {
            return;
        }
        self.watcher.probe().await;
    }

    /// One reconciliation pass.  Public so the test suites can drive the
    /// state machine tick by tick.
    pub async fn reconcile_once(&mut self) -> Result<(), InvariantError> {
        if matches!(self.state, ClusterState::Failure | ClusterState::Disabled)
        {
            self.idle();
            return Ok(());
        }

        if self.cache.reset {
            self.transition(ClusterState::Initializing, "Resetting");
            self.cache = ReconcileCache::default();
            for zone in self.zones.values_mut() {
                zone.clear_runtime();
            }
            self.last_health = None;
            self.announced_operational = false;
        }

        // Hold off until the first probe results are in; fanning out to
        // nodes we have never reached would just burn error slots.
        if self.state == ClusterState::Initializing && self.watcher.any_unknown()
        {
            self.idle();
            return Ok(());
        }

        if self.cache.versions.is_none() {
            self.phase_versions().await;
            self.progress();
            return Ok(());
        }
        if !self.cache.hsms_setup {
            self.phase_hsms().await;
            self.progress();
            return Ok(());
        }
        if !self.cache.policy_setup {
            self.phase_policy().await;
            self.progress();
            return Ok(());
        }
        if !self.cache.running {
            self.phase_start().await;
            self.progress();
            return Ok(());
        }

        let mut progressed = false;
        if !self.cache.reload.is_empty() {
            self.phase_reload().await;
            progressed = true;
        }

        progressed |= self.phase_cluster_state()?;

        if matches!(
            self.state,
            ClusterState::Operational | ClusterState::Degraded
        ) {
            progressed |= self.phase_zones().await;
            if self.state == ClusterState::Failure {
                // A zone fetch failure halted the cluster mid-phase.
                self.idle();
                return Ok(());
            }
            if self.state == ClusterState::Operational
                && !self.announced_operational
                && self.zones.values().all(|zone| zone.setup_done)
            {
                self.log_event("Cluster operational".to_string());
                self.announced_operational = true;
                progressed = true;
            }
        }

        if progressed {
            self.progress();
        } else {
            self.idle();
        }
        Ok(())
    }

    /// P1: collect software inventories and check them against the
    /// supported table.  A node outside the table goes to FAILURE; the
    /// cluster carries on with the rest.
    async fn phase_versions(&mut self) {
        self.log_event("Fetching version information from nodes".to_string());
        let results = self.watcher.broadcast(&NodeOp::Versions).await;
        let mut errors = 0;
        let mut unsupported = 0;
        let mut collected = BTreeMap::new();
        for (node_id, result) in results {
            match result {
                Ok(NodeValue::Versions(versions)) => {
                    unsupported += self.check_node_versions(node_id, &versions);
                    collected.insert(node_id, Some(versions));
                }
                Ok(_) => {
                    errors += 1;
                    collected.insert(node_id, None);
                }
                Err(error) => {
                    errors += 1;
                    self.log_event(format!(
                        "Error fetching version information from node {}: {}",
                        node_id, error
                    ));
                    collected.insert(node_id, None);
                }
            }
        }
        if errors == 0 && unsupported == 0 {
            self.log_event(
                "Version information correct and supported".to_string(),
            );
        }
        self.cache.versions = Some(collected);
    }

    /// Check one node's inventory.  Returns the number of violations and
    /// fails the node if there were any.
    fn check_node_versions(
        &mut self,
        node_id: Uuid,
        versions: &NodeVersions,
    ) -> usize {
        let mut failures = 0;
        let categories = [
            ("plugin", SUPPORTED_PLUGINS, &versions.plugin),
            ("program", SUPPORTED_PROGRAMS, &versions.program),
        ];
        for (category, table, reported) in categories {
            for entry in table {
                match reported.get(entry.name) {
                    None if entry.required => {
                        failures += 1;
                        self.log_event(format!(
                            "Required {} {} is missing on node {}",
                            category, entry.name, node_id
                        ));
                    }
                    None => (),
                    Some(found) if !entry.supports(found) => {
                        failures += 1;
                        self.log_event(format!(
                            "Software {} version {} on node {} is not \
                             supported. Supported are minimum version {} \
                             and maximum version {}",
                            entry.name, found, node_id, entry.min, entry.max
                        ));
                    }
                    Some(_) => (),
                }
            }
        }
        if failures > 0 {
            self.watcher.set_state(node_id, NodeState::Failure);
        }
        failures
    }

    /// P2: apply every HSM repository descriptor that has not been
    /// attempted yet.  Nodes that actually changed are queued for a signer
    /// reload.
    async fn phase_hsms(&mut self) {
        let mut errors = 0;
        let hsms = self.hsms.clone();
        for hsm in &hsms {
            if self.cache.hsms_attempted.contains(&hsm.uuid) {
                continue;
            }
            self.log_event(format!("Setting up HSM {}", hsm.uuid));
            let results = self
                .watcher
                .broadcast(&NodeOp::SetupHsm { data: hsm.data.clone() })
                .await;
            for (node_id, result) in results {
                match result {
                    Ok(NodeValue::Setup { mutated: true }) => {
                        self.cache.reload.insert(node_id);
                    }
                    Ok(_) => (),
                    Err(error) => {
                        errors += 1;
                        self.log_event(format!(
                            "Error setting up HSM {} on node {}: {}",
                            hsm.uuid, node_id, error
                        ));
                    }
                }
            }
            self.cache.hsms_attempted.insert(hsm.uuid);
        }
        if errors == 0 {
            self.log_event("All HSMs setup ok".to_string());
        }
        self.cache.hsms_setup = true;
    }

    /// P3: apply the signing policy.
    async fn phase_policy(&mut self) {
        self.log_event(format!("Setting up Policy {}", self.policy.uuid));
        let results = self
            .watcher
            .broadcast(&NodeOp::SetupPolicy { data: self.policy.data.clone() })
            .await;
        let mut errors = 0;
        for (node_id, result) in results {
            match result {
                Ok(NodeValue::Setup { mutated: true }) => {
                    self.cache.reload.insert(node_id);
                }
                Ok(_) => (),
                Err(error) => {
                    errors += 1;
                    self.log_event(format!(
                        "Error setting up Policy {} on node {}: {}",
                        self.policy.uuid, node_id, error
                    ));
                }
            }
        }
        if errors == 0 {
            self.log_event("Policy setup ok".to_string());
        }
        self.cache.policy_setup = true;
    }

    /// P4: make sure the signer daemons run everywhere.
    async fn phase_start(&mut self) {
        self.log_event(
            "Verifying OpenDNSSEC is running and starting if not".to_string(),
        );
        let results = self.watcher.broadcast(&NodeOp::StartSigner).await;
        for (node_id, result) in results {
            if let Err(error) = result {
                self.log_event(format!(
                    "Error starting OpenDNSSEC on node {}: {}",
                    node_id, error
                ));
            }
        }
        self.cache.running = true;
    }

    /// P5: drain the accumulated reload set.
    async fn phase_reload(&mut self) {
        self.log_event("Reload OpenDNSSEC on nodes that need it".to_string());
        let targets: Vec<Uuid> =
            std::mem::take(&mut self.cache.reload).into_iter().collect();
        let results =
            self.watcher.broadcast_to(&targets, &NodeOp::ReloadSigner).await;
        for (node_id, result) in results {
            if let Err(error) = result {
                self.log_event(format!(
                    "Error reloading OpenDNSSEC on node {}: {}",
                    node_id, error
                ));
            }
        }
    }

    /// P6: derive the cluster state from the per-node states.
    fn phase_cluster_state(&mut self) -> Result<bool, InvariantError> {
        let states = self.watcher.node_states();
        let total = states.len();
        let mut failure = 0;
        let mut offline = 0;
        let mut unknown = 0;
        let mut standby = Vec::new();
        for (id, state) in &states {
            match state {
                NodeState::Failure => failure += 1,
                NodeState::Offline => offline += 1,
                NodeState::Standby => standby.push(*id),
                NodeState::Unknown => unknown += 1,
                NodeState::Online | NodeState::Disabled => (),
            }
        }

        if unknown > 0 && self.state != ClusterState::Initializing {
            return Err(InvariantError {
                cluster_id: self.id,
                message: format!(
                    "{} nodes in UNKNOWN state outside initialization",
                    unknown
                ),
            });
        }

        if !standby.is_empty() {
            if self.state == ClusterState::Initializing {
                // The standby nodes have been through the setup phases by
                // now; they take part like any other member.
                for id in standby {
                    self.watcher.set_state(id, NodeState::Online);
                }
            } else {
                self.transition(
                    ClusterState::Initializing,
                    "Cluster (re)initializing because of nodes in STANDBY \
                     state",
                );
                self.cache = ReconcileCache::default();
                for zone in self.zones.values_mut() {
                    zone.clear_runtime();
                }
                self.last_health = None;
            }
            return Ok(true);
        }

        let mut changed = false;
        if failure > 0 || offline > 0 {
            if self.last_health != Some((failure, offline)) {
                self.log_event(format!(
                    "Nodes failure:{} offline:{}",
                    failure, offline
                ));
                self.last_health = Some((failure, offline));
            }
            if failure == total {
                self.transition(
                    ClusterState::Failure,
                    "All nodes in FAILURE state",
                );
                return Ok(true);
            }
            if self.state != ClusterState::Degraded {
                self.transition(ClusterState::Degraded, "Cluster degraded");
                changed = true;
            }
        } else {
            self.last_health = None;
            if self.state != ClusterState::Operational {
                debug!(self.log, "cluster healthy";
                    "from" => %self.state,
                );
                self.state = ClusterState::Operational;
                changed = true;
            }
        }

        if !matches!(
            self.state,
            ClusterState::Operational | ClusterState::Degraded
        ) {
            // Mode-specific quorum rules (when DEGRADED becomes
            // DISFUNCTIONAL or FAILURE) are not defined for any mode yet.
            match self.mode {
                ClusterMode::Backup
                | ClusterMode::Failover
                | ClusterMode::Balance => (),
            }
        }
        Ok(changed)
    }

    /// P7: per-zone work -- deferred removal, content fetch, node
    /// installation.  Only runs while the cluster is OPERATIONAL or
    /// DEGRADED.
    async fn phase_zones(&mut self) -> bool {
        let mut progressed = false;
        let zone_ids: Vec<Uuid> = self.zones.keys().copied().collect();
        for zone_id in zone_ids {
            let Some(zone) = self.zones.get(&zone_id) else { continue };
            if zone.pending_remove {
                info!(self.log, "zone removed"; "zone_id" => %zone_id);
                self.zones.remove(&zone_id);
                progressed = true;
                continue;
            }

            if zone.content.is_none() {
                self.log_event(format!(
                    "Fetching zone content for zone {}",
                    zone_id
                ));
                let fetched = match self.zones.get(&zone_id) {
                    Some(zone) => zone.input.fetch().await,
                    None => continue,
                };
                match fetched {
                    Ok(content) => {
                        if let Some(zone) = self.zones.get_mut(&zone_id) {
                            zone.content = Some(content);
                            zone.fetched_at = Some(Utc::now());
                        }
                        self.log_event(format!(
                            "Zone content for zone {} fetched",
                            zone_id
                        ));
                        progressed = true;
                    }
                    Err(fetch_error) => {
                        warn!(self.log, "zone content fetch failed";
                            "zone_id" => %zone_id,
                            "error" => %fetch_error,
                        );
                        self.transition(
                            ClusterState::Failure,
                            &format!(
                                "Unable to fetch zone {} content",
                                zone_id
                            ),
                        );
                        return true;
                    }
                }
            }

            let needs_setup = self
                .zones
                .get(&zone_id)
                .map(|zone| !zone.setup_done)
                .unwrap_or(false);
            if needs_setup {
                self.log_event(format!("Setting up zone {}", zone_id));
                let Some((name, content)) =
                    self.zones.get(&zone_id).and_then(|zone| {
                        zone.content
                            .clone()
                            .map(|content| (zone.name.clone(), content))
                    })
                else {
                    continue;
                };
                let results = self
                    .watcher
                    .broadcast(&NodeOp::ZoneAdd {
                        name,
                        content,
                        policy: self.policy.data.clone(),
                    })
                    .await;
                let mut errors = 0;
                for (node_id, result) in results {
                    match result {
                        Ok(_) => (),
                        // A node that is offline or failed simply does not
                        // take part; it catches up on re-initialization.
                        Err(NodeError::Unavailable) => (),
                        Err(error) => {
                            errors += 1;
                            self.log_event(format!(
                                "Error setting up zone {} on node {}: {}",
                                zone_id, node_id, error
                            ));
                        }
                    }
                }
                if errors == 0 {
                    if let Some(zone) = self.zones.get_mut(&zone_id) {
                        zone.setup_done = true;
                    }
                    self.log_event(format!("Zone {} setup ok", zone_id));
                    progressed = true;
                }
            }
        }
        progressed
    }

    fn transition(&mut self, state: ClusterState, message: &str) {
        if self.state != state {
            info!(self.log, "cluster state change";
                "from" => %self.state,
                "to" => %state,
            );
            self.state = state;
            if state != ClusterState::Operational {
                self.announced_operational = false;
            }
        }
        self.log_event(message.to_string());
    }

    fn log_event(&mut self, message: String) {
        info!(self.log, "{}", message);
        self.events.push_back(ClusterEvent { time: Utc::now(), message });
        while self.events.len() > EVENT_LOG_CAP {
            self.events.pop_front();
        }
    }

    fn progress(&mut self) {
        self.interval = 0;
    }

    fn idle(&mut self) {
        self.interval = (self.interval + 1).min(MAX_BACKOFF_SECS);
    }

    /// Start the manager loop.
    pub fn spawn(self) -> ClusterHandle {
        let id = self.id;
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(self.run(rx));
        ClusterHandle { id, tx, task }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ClusterCommand>) {
        let mut probe = tokio::time::interval(PROBE_PERIOD);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_pass = Instant::now();
        loop {
            tokio::select! {
                _ = probe.tick() => {
                    self.probe_nodes().await;
                }
                _ = tokio::time::sleep_until(next_pass) => {
                    if let Err(invariant) = self.reconcile_once().await {
                        error!(self.log, "halting cluster";
                            "error" => %invariant,
                        );
                        self.transition(
                            ClusterState::Failure,
                            &invariant.to_string(),
                        );
                    }
                    next_pass = Instant::now()
                        + Duration::from_secs(self.interval);
                }
                command = rx.recv() => {
                    match command {
                        None | Some(ClusterCommand::Stop) => break,
                        Some(command) => {
                            if self.handle_command(command) {
                                // Mutations warrant an immediate pass.
                                next_pass = Instant::now();
                            }
                        }
                    }
                }
            }
        }
        debug!(self.log, "cluster manager stopped");
    }

    fn handle_command(&mut self, command: ClusterCommand) -> bool {
        match command {
            ClusterCommand::NodeAdd { id, uri, reply } => {
                let result = self.add_node(id, &uri);
                let _ = reply.send(result);
                true
            }
            ClusterCommand::NodeRemove { id } => {
                self.remove_node(id);
                true
            }
            ClusterCommand::SetNodeState { id, state } => {
                self.set_node_state(id, state);
                true
            }
            ClusterCommand::ZoneAdd { zone, reply } => {
                let result = self.add_zone(zone);
                let _ = reply.send(result);
                true
            }
            ClusterCommand::ZoneRemove { id } => {
                self.remove_zone(id);
                true
            }
            ClusterCommand::Reset => {
                self.reset();
                true
            }
            ClusterCommand::Disable => {
                self.disable();
                false
            }
            ClusterCommand::Status { reply } => {
                let _ = reply.send(self.status());
                false
            }
            ClusterCommand::Stop => false,
        }
    }
}

/// Handle to a spawned cluster manager.
pub struct ClusterHandle {
    id: Uuid,
    tx: mpsc::Sender<ClusterCommand>,
    task: tokio::task::JoinHandle<()>,
}

impl ClusterHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn status(&self) -> Option<ClusterStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ClusterCommand::Status { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn node_add(
        &self,
        id: Uuid,
        uri: String,
    ) -> Option<Result<(), WatcherError>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ClusterCommand::NodeAdd { id, uri, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn node_remove(&self, id: Uuid) {
        let _ = self.tx.send(ClusterCommand::NodeRemove { id }).await;
    }

    pub async fn set_node_state(&self, id: Uuid, state: NodeState) {
        let _ =
            self.tx.send(ClusterCommand::SetNodeState { id, state }).await;
    }

    pub async fn zone_add(
        &self,
        zone: ZoneRecord,
    ) -> Option<Result<(), ZoneInputError>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ClusterCommand::ZoneAdd { zone, reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn zone_remove(&self, id: Uuid) {
        let _ = self.tx.send(ClusterCommand::ZoneRemove { id }).await;
    }

    pub async fn reset(&self) {
        let _ = self.tx.send(ClusterCommand::Reset).await;
    }

    pub async fn disable(&self) {
        let _ = self.tx.send(ClusterCommand::Disable).await;
    }

    /// Stop the manager.  Anything in flight completes into closed
    /// completions and is discarded.
    pub async fn stop(self) {
        let _ = self.tx.send(ClusterCommand::Stop).await;
        let _ = self.task.await;
    }
}
