// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pluggable sources of unsigned zone content.
//!
//! Each zone records an `input_type` tag and an opaque `input_data`
//! configuration; [`zone_input_for`] turns the pair into a fetcher.  Adding
//! a new kind of source means adding an arm to the registry; callers only
//! ever see the [`ZoneInput`] trait.

use crate::node::AgentConnector;
use async_trait::async_trait;
use orr_agent_client::types::DnsReadZone;
use orr_agent_client::{AgentApi, AgentUri};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ZoneInputError {
    #[error("unknown zone input type {0:?}")]
    UnknownType(String),
    #[error("invalid zone input configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Agent(#[from] orr_agent_client::Error),
    #[error("zone content missing from response")]
    NoContent,
}

/// A source that can produce the current unsigned content of one zone on
/// demand.
#[async_trait]
pub trait ZoneInput: Send + Sync {
    async fn fetch(&self) -> Result<String, FetchError>;
}

/// Build the input for `zone_name` from its stored configuration.
pub fn zone_input_for(
    zone_name: &str,
    input_type: &str,
    input_data: &serde_json::Value,
    connector: &Arc<dyn AgentConnector>,
) -> Result<Box<dyn ZoneInput>, ZoneInputError> {
    match input_type {
        "lim_plugin_dns" => {
            Ok(Box::new(LimPluginDns::new(zone_name, input_data, connector)?))
        }
        other => Err(ZoneInputError::UnknownType(other.to_string())),
    }
}

#[derive(Deserialize)]
struct LimPluginDnsConfig {
    host: String,
    port: u16,
    #[serde(default)]
    software: Option<String>,
}

/// Pulls zone content from the DNS plugin of another node.
pub struct LimPluginDns {
    zone_name: String,
    software: Option<String>,
    agent: Arc<dyn AgentApi>,
}

impl LimPluginDns {
    fn new(
        zone_name: &str,
        input_data: &serde_json::Value,
        connector: &Arc<dyn AgentConnector>,
    ) -> Result<LimPluginDns, ZoneInputError> {
        let config: LimPluginDnsConfig =
            serde_json::from_value(input_data.clone()).map_err(|error| {
                ZoneInputError::InvalidConfig(error.to_string())
            })?;
        let uri = AgentUri::from_host_port(&config.host, config.port)
            .map_err(|error| {
                ZoneInputError::InvalidConfig(error.to_string())
            })?;
        Ok(LimPluginDns {
            zone_name: zone_name.to_string(),
            software: config.software,
            agent: connector.connect(&uri),
        })
    }
}

#[async_trait]
impl ZoneInput for LimPluginDns {
    async fn fetch(&self) -> Result<String, FetchError> {
        let response = self
            .agent
            .dns_read_zone(&DnsReadZone {
                file: self.zone_name.clone(),
                software: self.software.clone(),
                as_content: true,
            })
            .await?;
        response.content.ok_or(FetchError::NoContent)
    }
}
