// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire types for the node agent RPC.

use serde::{Deserialize, Serialize};

/// Response to `Agent.ReadVersion`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AgentVersion {
    pub version: String,
}

/// One entry of the `Agent.ReadPlugins` listing.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PluginVersion {
    pub name: String,
    pub version: String,
    pub loaded: bool,
}

/// One entry of an `{OpenDNSSEC,SoftHSM}.ReadVersion` program listing.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProgramVersion {
    pub name: String,
    pub version: String,
}

/// One entry of `OpenDNSSEC.ReadEnforcerZoneList`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EnforcerZone {
    pub name: String,
    pub policy: String,
}

/// Request body for `OpenDNSSEC.CreateEnforcerZone`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EnforcerZoneCreate {
    pub name: String,
    pub policy: String,
    pub signerconf: String,
    pub input: String,
    pub output: String,
}

/// One entry of the `DNS.ReadZones` file listing.  `file` is a path relative
/// to the DNS plugin's zone directory, e.g. `unsigned/example.com`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DnsZoneFile {
    pub file: String,
}

/// Request body for `DNS.ReadZone`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DnsReadZone {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,
    pub as_content: bool,
}

/// The zone object returned by `DNS.ReadZone`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DnsZoneContent {
    pub content: Option<String>,
}

/// Request body for `DNS.CreateZone` and `DNS.UpdateZone`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DnsZoneWrite {
    pub file: String,
    pub content: String,
}
