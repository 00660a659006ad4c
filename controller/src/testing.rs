// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test support: an in-memory node agent with scripted state and a call
//! journal, plus the connector that hands it to the controller in place of
//! real HTTP clients.

use crate::node::AgentConnector;
use async_trait::async_trait;
use orr_agent_client::types::{
    AgentVersion, DnsReadZone, DnsZoneContent, DnsZoneFile, DnsZoneWrite,
    EnforcerZone, EnforcerZoneCreate, PluginVersion, ProgramVersion,
};
use orr_agent_client::{AgentApi, AgentUri, Error};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

/// Mutable state of a [`FakeAgent`].
pub struct FakeAgentState {
    /// When false, every call fails the way an unreachable agent would.
    pub reachable: bool,
    pub agent_version: String,
    pub plugins: Vec<PluginVersion>,
    /// Programs reported by `OpenDNSSEC.ReadVersion`.
    pub programs: Vec<ProgramVersion>,
    /// Programs reported by `SoftHSM.ReadVersion`.
    pub softhsm_programs: Vec<ProgramVersion>,
    /// Repositories keyed by their payload `name`.
    pub repositories: BTreeMap<String, serde_json::Value>,
    /// Policies keyed by their payload `name`.
    pub policies: BTreeMap<String, serde_json::Value>,
    pub enforcer_zones: Vec<EnforcerZone>,
    /// Files in the DNS plugin's zone directory, keyed by relative path.
    pub dns_files: BTreeMap<String, String>,
    /// Content served by `DNS.ReadZone`, keyed by requested file name.
    pub zone_content: BTreeMap<String, String>,
    pub start_count: usize,
    pub reload_count: usize,
    /// Every call made, in order, by RPC method name.
    pub calls: Vec<String>,
}

/// In-memory implementation of the agent RPC.
pub struct FakeAgent {
    state: Mutex<FakeAgentState>,
}

impl FakeAgent {
    /// An agent whose inventory satisfies the supported-software table.
    pub fn healthy() -> Arc<FakeAgent> {
        let plugin = |name: &str, version: &str| PluginVersion {
            name: name.to_string(),
            version: version.to_string(),
            loaded: true,
        };
        let program = |name: &str, version: &str| ProgramVersion {
            name: name.to_string(),
            version: version.to_string(),
        };
        Arc::new(FakeAgent {
            state: Mutex::new(FakeAgentState {
                reachable: true,
                agent_version: "0.19".to_string(),
                plugins: vec![
                    plugin("Agent", "0.19"),
                    plugin("OpenDNSSEC", "0.14"),
                    plugin("SoftHSM", "0.14"),
                    plugin("DNS", "0.12"),
                ],
                programs: vec![
                    program("ods-control", "1"),
                    program("ods-signerd", "1.3.14"),
                    program("ods-signer", "1.3.14"),
                    program("ods-enforcerd", "1.3.14"),
                    program("ods-ksmutil", "1.3.14"),
                    program("ods-hsmutil", "1.3.14"),
                ],
                softhsm_programs: vec![program("softhsm", "1.3.3")],
                repositories: BTreeMap::new(),
                policies: BTreeMap::new(),
                enforcer_zones: Vec::new(),
                dns_files: BTreeMap::new(),
                zone_content: BTreeMap::new(),
                start_count: 0,
                reload_count: 0,
                calls: Vec::new(),
            }),
        })
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&mut FakeAgentState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.with_state(|state| state.reachable = reachable);
    }

    /// Override the version one program reports.
    pub fn set_program_version(&self, name: &str, version: &str) {
        self.with_state(|state| {
            for program in &mut state.programs {
                if program.name == name {
                    program.version = version.to_string();
                }
            }
        });
    }

    pub fn set_zone_content(&self, file: &str, content: &str) {
        self.with_state(|state| {
            state.zone_content.insert(file.to_string(), content.to_string());
        });
    }

    pub fn add_enforcer_zone(&self, name: &str, policy: &str) {
        self.with_state(|state| {
            state.enforcer_zones.push(EnforcerZone {
                name: name.to_string(),
                policy: policy.to_string(),
            });
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.with_state(|state| state.calls.clone())
    }

    pub fn call_count(&self) -> usize {
        self.with_state(|state| state.calls.len())
    }

    /// Record a call, failing it if the agent is unreachable.
    fn record(&self, method: &str) -> Result<(), Error> {
        self.with_state(|state| {
            state.calls.push(method.to_string());
            if state.reachable {
                Ok(())
            } else {
                Err(Error::ErrorResponse {
                    status: 503,
                    message: "agent unreachable".to_string(),
                })
            }
        })
    }
}

#[async_trait]
impl AgentApi for FakeAgent {
    async fn agent_read_version(&self) -> Result<AgentVersion, Error> {
        self.record("Agent.ReadVersion")?;
        Ok(AgentVersion {
            version: self.with_state(|state| state.agent_version.clone()),
        })
    }

    async fn agent_read_plugins(&self) -> Result<Vec<PluginVersion>, Error> {
        self.record("Agent.ReadPlugins")?;
        Ok(self.with_state(|state| state.plugins.clone()))
    }

    async fn opendnssec_read_version(
        &self,
    ) -> Result<Vec<ProgramVersion>, Error> {
        self.record("OpenDNSSEC.ReadVersion")?;
        Ok(self.with_state(|state| state.programs.clone()))
    }

    async fn softhsm_read_version(
        &self,
    ) -> Result<Vec<ProgramVersion>, Error> {
        self.record("SoftHSM.ReadVersion")?;
        Ok(self.with_state(|state| state.softhsm_programs.clone()))
    }

    async fn opendnssec_read_repository(
        &self,
        name: &str,
    ) -> Result<Option<serde_json::Value>, Error> {
        self.record("OpenDNSSEC.ReadRepository")?;
        Ok(self.with_state(|state| state.repositories.get(name).cloned()))
    }

    async fn opendnssec_create_repository(
        &self,
        data: &serde_json::Value,
    ) -> Result<(), Error> {
        self.record("OpenDNSSEC.CreateRepository")?;
        let name = crate::node::payload_name(data).to_string();
        self.with_state(|state| {
            state.repositories.insert(name, data.clone());
        });
        Ok(())
    }

    async fn opendnssec_update_repository(
        &self,
        data: &serde_json::Value,
    ) -> Result<(), Error> {
        self.record("OpenDNSSEC.UpdateRepository")?;
        let name = crate::node::payload_name(data).to_string();
        self.with_state(|state| {
            state.repositories.insert(name, data.clone());
        });
        Ok(())
    }

    async fn opendnssec_read_policy(
        &self,
        name: &str,
    ) -> Result<Option<serde_json::Value>, Error> {
        self.record("OpenDNSSEC.ReadPolicy")?;
        Ok(self.with_state(|state| state.policies.get(name).cloned()))
    }

    async fn opendnssec_create_policy(
        &self,
        data: &serde_json::Value,
    ) -> Result<(), Error> {
        self.record("OpenDNSSEC.CreatePolicy")?;
        let name = crate::node::payload_name(data).to_string();
        self.with_state(|state| {
            state.policies.insert(name, data.clone());
        });
        Ok(())
    }

    async fn opendnssec_update_policy(
        &self,
        data: &serde_json::Value,
    ) -> Result<(), Error> {
        self.record("OpenDNSSEC.UpdatePolicy")?;
        let name = crate::node::payload_name(data).to_string();
        self.with_state(|state| {
            state.policies.insert(name, data.clone());
        });
        Ok(())
    }

    async fn opendnssec_control_start(&self) -> Result<(), Error> {
        self.record("OpenDNSSEC.UpdateControlStart")?;
        self.with_state(|state| state.start_count += 1);
        Ok(())
    }

    async fn opendnssec_enforcer_update(&self) -> Result<(), Error> {
        self.record("OpenDNSSEC.UpdateEnforcerUpdate")?;
        self.with_state(|state| state.reload_count += 1);
        Ok(())
    }

    async fn opendnssec_enforcer_zone_list(
        &self,
    ) -> Result<Vec<EnforcerZone>, Error> {
        self.record("OpenDNSSEC.ReadEnforcerZoneList")?;
        Ok(self.with_state(|state| state.enforcer_zones.clone()))
    }

    async fn opendnssec_create_enforcer_zone(
        &self,
        zone: &EnforcerZoneCreate,
    ) -> Result<(), Error> {
        self.record("OpenDNSSEC.CreateEnforcerZone")?;
        self.with_state(|state| {
            state.enforcer_zones.push(EnforcerZone {
                name: zone.name.clone(),
                policy: zone.policy.clone(),
            });
        });
        Ok(())
    }

    async fn dns_read_zones(&self) -> Result<Vec<DnsZoneFile>, Error> {
        self.record("DNS.ReadZones")?;
        Ok(self.with_state(|state| {
            state
                .dns_files
                .keys()
                .map(|file| DnsZoneFile { file: file.clone() })
                .collect()
        }))
    }

    async fn dns_read_zone(
        &self,
        request: &DnsReadZone,
    ) -> Result<DnsZoneContent, Error> {
        self.record("DNS.ReadZone")?;
        Ok(DnsZoneContent {
            content: self.with_state(|state| {
                state.zone_content.get(&request.file).cloned()
            }),
        })
    }

    async fn dns_create_zone(&self, zone: &DnsZoneWrite) -> Result<(), Error> {
        self.record("DNS.CreateZone")?;
        self.with_state(|state| {
            state.dns_files.insert(zone.file.clone(), zone.content.clone());
        });
        Ok(())
    }

    async fn dns_update_zone(&self, zone: &DnsZoneWrite) -> Result<(), Error> {
        self.record("DNS.UpdateZone")?;
        self.with_state(|state| {
            state.dns_files.insert(zone.file.clone(), zone.content.clone());
        });
        Ok(())
    }
}

/// Connector that serves [`FakeAgent`]s by URI.  Unregistered URIs get a
/// fresh healthy agent on first contact.
pub struct FakeConnector {
    agents: Mutex<BTreeMap<String, Arc<FakeAgent>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<FakeConnector> {
        Arc::new(FakeConnector { agents: Mutex::new(BTreeMap::new()) })
    }

    /// Put `agent` behind `uri` (which must be a valid agent URI).
    pub fn register(&self, uri: &str, agent: Arc<FakeAgent>) {
        let key = AgentUri::parse(uri).expect("invalid test URI").to_string();
        self.agents.lock().unwrap().insert(key, agent);
    }

    /// The agent behind `uri`, registering a healthy one if none is there.
    pub fn agent_for(&self, uri: &str) -> Arc<FakeAgent> {
        let key = AgentUri::parse(uri).expect("invalid test URI").to_string();
        Arc::clone(
            self.agents
                .lock()
                .unwrap()
                .entry(key)
                .or_insert_with(FakeAgent::healthy),
        )
    }

    /// Total calls across every agent this connector has served.
    pub fn total_calls(&self) -> usize {
        self.agents
            .lock()
            .unwrap()
            .values()
            .map(|agent| agent.call_count())
            .sum()
    }
}

impl AgentConnector for FakeConnector {
    fn connect(&self, uri: &AgentUri) -> Arc<dyn AgentApi> {
        let agent = self.agent_for(&uri.to_string());
        agent
    }
}
