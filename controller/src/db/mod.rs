// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent cluster configuration: the bootstrap data that tells the
//! controller which clusters exist, which nodes, zones, HSMs and policy each
//! one owns, and how zone content is obtained.

use std::fmt;
use uuid::Uuid;

mod schema;
mod store;

pub use schema::SCHEMA_VERSION;
pub use store::ConfigStore;

/// Role a node plays inside its cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeMode {
    Primary,
    Secondary,
}

impl NodeMode {
    fn label(&self) -> &'static str {
        match self {
            NodeMode::Primary => "PRIMARY",
            NodeMode::Secondary => "SECONDARY",
        }
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl TryFrom<&str> for NodeMode {
    type Error = String;

    fn try_from(variant: &str) -> Result<Self, Self::Error> {
        match variant {
            "PRIMARY" => Ok(NodeMode::Primary),
            "SECONDARY" => Ok(NodeMode::Secondary),
            _ => Err(format!("unexpected node mode {:?}", variant)),
        }
    }
}

/// Redundancy discipline of a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterMode {
    Backup,
    Failover,
    Balance,
}

impl ClusterMode {
    fn label(&self) -> &'static str {
        match self {
            ClusterMode::Backup => "BACKUP",
            ClusterMode::Failover => "FAILOVER",
            ClusterMode::Balance => "BALANCE",
        }
    }
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl TryFrom<&str> for ClusterMode {
    type Error = String;

    fn try_from(variant: &str) -> Result<Self, Self::Error> {
        match variant {
            "BACKUP" => Ok(ClusterMode::Backup),
            "FAILOVER" => Ok(ClusterMode::Failover),
            "BALANCE" => Ok(ClusterMode::Balance),
            _ => Err(format!("unexpected cluster mode {:?}", variant)),
        }
    }
}

/// One managed signing node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub uuid: Uuid,
    pub uri: String,
    pub mode: NodeMode,
}

/// One managed zone and the description of where its unsigned content comes
/// from.  `input_data` is the opaque configuration of the `input_type`
/// variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneRecord {
    pub uuid: Uuid,
    pub name: String,
    pub input_type: String,
    pub input_data: serde_json::Value,
}

/// An HSM repository descriptor, passed through to the node agents
/// unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HsmRecord {
    pub uuid: Uuid,
    pub data: serde_json::Value,
}

/// A signing policy, passed through to the node agents unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyRecord {
    pub uuid: Uuid,
    pub data: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterRecord {
    pub uuid: Uuid,
    pub mode: ClusterMode,
}

/// Everything needed to run one cluster, assembled from the join tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterDescriptor {
    pub uuid: Uuid,
    pub mode: ClusterMode,
    pub policy: PolicyRecord,
    pub hsms: Vec<HsmRecord>,
    pub nodes: Vec<NodeRecord>,
    pub zones: Vec<ZoneRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error")]
    Database(#[from] rusqlite::Error),
    #[error(
        "database schema version {found} is newer than this controller \
         supports ({supported})"
    )]
    SchemaTooNew { found: i64, supported: i64 },
    #[error(
        "database schema version {found} requires an upgrade to \
         {supported}, which is not implemented"
    )]
    UpgradeRequired { found: i64, supported: i64 },
    #[error("stored {column} of {table} row {key:?} is invalid: {message}")]
    InvalidRow {
        table: &'static str,
        column: &'static str,
        key: String,
        message: String,
    },
    #[error("cluster {0} has no policy")]
    MissingPolicy(Uuid),
}
