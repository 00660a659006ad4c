// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serialised RPC access to individual signing nodes.
//!
//! Every node gets exactly one pump task consuming a FIFO queue of tagged
//! operations, so at most one RPC is ever outstanding against a node no
//! matter how many clusters manage it.  Handles are shared through
//! [`NodePool`], which caches them weakly by URI: when the last owner drops
//! a handle the pump is aborted and anything still queued is discarded.

use orr_agent_client::types::{DnsZoneWrite, EnforcerZoneCreate};
use orr_agent_client::{AgentApi, AgentUri, Client};
use orr_common::json::canonical;
use slog::{debug, o, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Work accepted by a node pump, one variant per operation the controller
/// issues against a node.
#[derive(Clone, Debug)]
pub enum NodeOp {
    /// Cheap liveness check (`Agent.ReadVersion`).
    Ping,
    /// Collect plugin and program versions.
    Versions,
    /// Idempotent upsert of an HSM repository descriptor.
    SetupHsm { data: serde_json::Value },
    /// Idempotent upsert of the signing policy.
    SetupPolicy { data: serde_json::Value },
    /// Make sure the signer daemons are running.
    StartSigner,
    /// Have the enforcer re-read its configuration.
    ReloadSigner,
    /// Install or refresh a zone: write the unsigned content into the DNS
    /// plugin, then register the zone with the enforcer if it is new.
    ZoneAdd { name: String, content: String, policy: serde_json::Value },
}

impl NodeOp {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            NodeOp::Ping => "ping",
            NodeOp::Versions => "versions",
            NodeOp::SetupHsm { .. } => "setup-hsm",
            NodeOp::SetupPolicy { .. } => "setup-policy",
            NodeOp::StartSigner => "start-signer",
            NodeOp::ReloadSigner => "reload-signer",
            NodeOp::ZoneAdd { .. } => "zone-add",
        }
    }
}

/// Successful outcome of a [`NodeOp`].
#[derive(Clone, Debug)]
pub enum NodeValue {
    Pong,
    Versions(NodeVersions),
    /// `mutated` is false when the remote object already matched the
    /// payload, which is what lets reconciliation passes converge to
    /// no-ops.
    Setup { mutated: bool },
    Started,
    Reloaded,
    ZoneAdded,
}

/// Software inventory of one node: plugin name → version and program name →
/// version, loaded plugins only.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeVersions {
    pub plugin: BTreeMap<String, String>,
    pub program: BTreeMap<String, String>,
}

/// Failed outcome of a [`NodeOp`], as seen by fan-out aggregation.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The node was not in a callable state when the work was submitted.
    #[error("node unavailable")]
    Unavailable,
    /// The node's pump went away before the completion fired.
    #[error("node stopped")]
    Stopped,
    /// The zone exists on the node under a different policy.  Changing a
    /// zone's policy is an operator decision, not something reconciliation
    /// may do on its own.
    #[error("zone {zone} is registered with a different policy ({found})")]
    WrongPolicy { zone: String, found: String },
    #[error(transparent)]
    Agent(#[from] orr_agent_client::Error),
}

struct Request {
    op: NodeOp,
    reply: oneshot::Sender<Result<NodeValue, NodeError>>,
}

/// Shared handle to one node's RPC pump.
pub struct NodeHandle {
    uri: AgentUri,
    tx: mpsc::UnboundedSender<Request>,
    last_ping: Arc<Mutex<Option<Instant>>>,
    pump: tokio::task::JoinHandle<()>,
}

impl NodeHandle {
    fn spawn(
        uri: AgentUri,
        agent: Arc<dyn AgentApi>,
        log: Logger,
    ) -> Arc<NodeHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let last_ping = Arc::new(Mutex::new(None));
        let pump = tokio::spawn(pump(agent, log, Arc::clone(&last_ping), rx));
        Arc::new(NodeHandle { uri, tx, last_ping, pump })
    }

    pub fn uri(&self) -> &AgentUri {
        &self.uri
    }

    /// When the node last answered a ping, if ever.
    pub fn last_ping(&self) -> Option<Instant> {
        *self.last_ping.lock().unwrap()
    }

    /// Queue `op` and return its completion.  The receiver resolves once
    /// every operation queued before this one has finished; it resolves
    /// with an error if the pump goes away first.
    pub fn submit(
        &self,
        op: NodeOp,
    ) -> oneshot::Receiver<Result<NodeValue, NodeError>> {
        let (reply, rx) = oneshot::channel();
        // A failed send means the pump is gone; dropping `reply` makes the
        // receiver resolve immediately.
        let _ = self.tx.send(Request { op, reply });
        rx
    }

    /// Queue `op` and wait for it.
    pub async fn call(&self, op: NodeOp) -> Result<NodeValue, NodeError> {
        match self.submit(op).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Stopped),
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        // Dropping the last owner discards the queue along with the pump.
        self.pump.abort();
    }
}

async fn pump(
    agent: Arc<dyn AgentApi>,
    log: Logger,
    last_ping: Arc<Mutex<Option<Instant>>>,
    mut rx: mpsc::UnboundedReceiver<Request>,
) {
    while let Some(Request { op, reply }) = rx.recv().await {
        debug!(log, "executing"; "op" => op.label());
        let result = execute(&*agent, &op).await;
        if matches!(op, NodeOp::Ping) && result.is_ok() {
            *last_ping.lock().unwrap() = Some(Instant::now());
        }
        if let Err(error) = &result {
            debug!(log, "operation failed"; "op" => op.label(), "error" => %error);
        }
        // The caller may have gone away; a dead completion is a no-op.
        let _ = reply.send(result);
    }
}

async fn execute(
    agent: &dyn AgentApi,
    op: &NodeOp,
) -> Result<NodeValue, NodeError> {
    match op {
        NodeOp::Ping => {
            agent.agent_read_version().await?;
            Ok(NodeValue::Pong)
        }
        NodeOp::Versions => versions(agent).await,
        NodeOp::SetupHsm { data } => setup_repository(agent, data).await,
        NodeOp::SetupPolicy { data } => setup_policy(agent, data).await,
        NodeOp::StartSigner => {
            agent.opendnssec_control_start().await?;
            Ok(NodeValue::Started)
        }
        NodeOp::ReloadSigner => {
            agent.opendnssec_enforcer_update().await?;
            Ok(NodeValue::Reloaded)
        }
        NodeOp::ZoneAdd { name, content, policy } => {
            zone_add(agent, name, content, policy).await
        }
    }
}

async fn versions(agent: &dyn AgentApi) -> Result<NodeValue, NodeError> {
    let mut inventory = NodeVersions::default();
    let mut softhsm_loaded = false;
    for plugin in agent.agent_read_plugins().await? {
        if !plugin.loaded {
            continue;
        }
        if plugin.name == "SoftHSM" {
            softhsm_loaded = true;
        }
        inventory.plugin.insert(plugin.name, plugin.version);
    }
    for program in agent.opendnssec_read_version().await? {
        inventory.program.insert(program.name, program.version);
    }
    if softhsm_loaded {
        for program in agent.softhsm_read_version().await? {
            inventory.program.insert(program.name, program.version);
        }
    }
    Ok(NodeValue::Versions(inventory))
}

/// The `name` member of an opaque repository/policy payload, used to address
/// the corresponding remote object.
pub fn payload_name(data: &serde_json::Value) -> &str {
    data.get("name").and_then(serde_json::Value::as_str).unwrap_or("default")
}

async fn setup_repository(
    agent: &dyn AgentApi,
    data: &serde_json::Value,
) -> Result<NodeValue, NodeError> {
    let name = payload_name(data);
    match agent.opendnssec_read_repository(name).await? {
        None => {
            agent.opendnssec_create_repository(data).await?;
            Ok(NodeValue::Setup { mutated: true })
        }
        Some(existing) if canonical(&existing) == canonical(data) => {
            Ok(NodeValue::Setup { mutated: false })
        }
        Some(_) => {
            agent.opendnssec_update_repository(data).await?;
            Ok(NodeValue::Setup { mutated: true })
        }
    }
}

async fn setup_policy(
    agent: &dyn AgentApi,
    data: &serde_json::Value,
) -> Result<NodeValue, NodeError> {
    let name = payload_name(data);
    match agent.opendnssec_read_policy(name).await? {
        None => {
            agent.opendnssec_create_policy(data).await?;
            Ok(NodeValue::Setup { mutated: true })
        }
        Some(existing) if canonical(&existing) == canonical(data) => {
            Ok(NodeValue::Setup { mutated: false })
        }
        Some(_) => {
            agent.opendnssec_update_policy(data).await?;
            Ok(NodeValue::Setup { mutated: true })
        }
    }
}

const ZONE_BASE: &str = "/var/lib/opendnssec";

async fn zone_add(
    agent: &dyn AgentApi,
    name: &str,
    content: &str,
    policy: &serde_json::Value,
) -> Result<NodeValue, NodeError> {
    let unsigned = format!("unsigned/{}", name);
    let files = agent.dns_read_zones().await?;
    let write =
        DnsZoneWrite { file: unsigned.clone(), content: content.to_string() };
    if files.iter().any(|zone| zone.file == unsigned) {
        agent.dns_update_zone(&write).await?;
    } else {
        agent.dns_create_zone(&write).await?;
    }

    let policy_name = payload_name(policy);
    let zones = agent.opendnssec_enforcer_zone_list().await?;
    match zones.iter().find(|zone| zone.name == name) {
        Some(existing) if existing.policy != policy_name => {
            return Err(NodeError::WrongPolicy {
                zone: name.to_string(),
                found: existing.policy.clone(),
            });
        }
        Some(_) => (),
        None => {
            agent
                .opendnssec_create_enforcer_zone(&EnforcerZoneCreate {
                    name: name.to_string(),
                    policy: policy_name.to_string(),
                    signerconf: format!("{}/signconf/{}.xml", ZONE_BASE, name),
                    input: format!("{}/unsigned/{}", ZONE_BASE, name),
                    output: format!("{}/signed/{}", ZONE_BASE, name),
                })
                .await?;
        }
    }
    Ok(NodeValue::ZoneAdded)
}

/// Builds RPC clients for agent endpoints.  The indirection exists so the
/// test suites can hand reconciliation an in-memory agent.
pub trait AgentConnector: Send + Sync {
    fn connect(&self, uri: &AgentUri) -> Arc<dyn AgentApi>;
}

/// Production connector: reqwest-backed clients sharing one connection
/// pool.
pub struct HttpConnector {
    log: Logger,
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(log: Logger) -> HttpConnector {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build HTTP client");
        HttpConnector { log, client }
    }
}

impl AgentConnector for HttpConnector {
    fn connect(&self, uri: &AgentUri) -> Arc<dyn AgentApi> {
        Arc::new(Client::new_with_client(
            uri.clone(),
            self.client.clone(),
            self.log.new(o!("agent_uri" => uri.to_string())),
        ))
    }
}

/// Process-wide cache of node handles keyed by URI.
pub struct NodePool {
    log: Logger,
    connector: Arc<dyn AgentConnector>,
    nodes: Mutex<BTreeMap<String, Weak<NodeHandle>>>,
}

impl NodePool {
    pub fn new(log: Logger, connector: Arc<dyn AgentConnector>) -> NodePool {
        NodePool { log, connector, nodes: Mutex::new(BTreeMap::new()) }
    }

    /// Fetch the handle for `uri`, starting a pump for it if no live handle
    /// exists.  Dead entries are reaped on the way through.
    pub fn acquire(&self, uri: &AgentUri) -> Arc<NodeHandle> {
        let key = uri.to_string();
        let mut nodes = self.nodes.lock().unwrap();
        nodes.retain(|_, weak| weak.strong_count() > 0);
        if let Some(handle) = nodes.get(&key).and_then(Weak::upgrade) {
            return handle;
        }
        debug!(self.log, "starting node pump"; "uri" => &key);
        let handle = NodeHandle::spawn(
            uri.clone(),
            self.connector.connect(uri),
            self.log.new(o!("node_uri" => key.clone())),
        );
        nodes.insert(key, Arc::downgrade(&handle));
        handle
    }
}
