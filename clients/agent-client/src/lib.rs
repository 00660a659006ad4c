// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the RPC agent running on each managed signing node.
//!
//! The agent speaks JSON over HTTP: each call is a POST of a JSON body to
//! `{base}/rpc/{Plugin}.{Call}` answered with a JSON body.  The surface the
//! controller consumes is captured by the [`AgentApi`] trait so that tests
//! can substitute an in-memory agent; [`Client`] is the reqwest-backed
//! implementation.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use slog::{debug, Logger};
use std::fmt;
use url::Url;

pub mod types;

/// Errors produced when talking to a node agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request never produced a usable HTTP response.
    #[error("communication error: {0}")]
    CommunicationError(#[from] reqwest::Error),
    /// The agent answered with a non-success status.
    #[error("error response from agent: status {status}: {message}")]
    ErrorResponse { status: u16, message: String },
    /// The agent answered 200 but the body did not have the expected shape.
    #[error("invalid response payload: {0}")]
    InvalidResponsePayload(String),
}

/// Errors produced when validating a candidate agent URI.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("malformed URI {uri:?}: {message}")]
    Malformed { uri: String, message: String },
    #[error("unsupported scheme {scheme:?} in URI {uri:?}")]
    UnsupportedScheme { uri: String, scheme: String },
    #[error("URI {uri:?} has no host")]
    NoHost { uri: String },
    #[error("URI {uri:?} has no port")]
    NoPort { uri: String },
    #[error("URI {uri:?} has a path, query or fragment")]
    NotABase { uri: String },
}

/// A validated agent endpoint: `scheme://host:port` with an http(s) scheme.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AgentUri {
    url: Url,
}

impl AgentUri {
    /// Parse and validate `uri`.  Anything other than a bare
    /// `http(s)://host:port` is rejected.
    pub fn parse(uri: &str) -> Result<AgentUri, UriError> {
        let url = Url::parse(uri).map_err(|error| UriError::Malformed {
            uri: uri.to_string(),
            message: error.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => (),
            other => {
                return Err(UriError::UnsupportedScheme {
                    uri: uri.to_string(),
                    scheme: other.to_string(),
                });
            }
        }
        if url.host_str().is_none() {
            return Err(UriError::NoHost { uri: uri.to_string() });
        }
        if url.port_or_known_default().is_none() {
            return Err(UriError::NoPort { uri: uri.to_string() });
        }
        if !matches!(url.path(), "" | "/")
            || url.query().is_some()
            || url.fragment().is_some()
        {
            return Err(UriError::NotABase { uri: uri.to_string() });
        }
        Ok(AgentUri { url })
    }

    /// Build an endpoint from a bare host and port, as stored in zone input
    /// configurations.
    pub fn from_host_port(host: &str, port: u16) -> Result<AgentUri, UriError> {
        AgentUri::parse(&format!("http://{}:{}", host, port))
    }

    pub fn host(&self) -> &str {
        // Validated at construction.
        self.url.host_str().unwrap_or("")
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(0)
    }
}

impl fmt::Display for AgentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `Url` renders a trailing "/" path; the bare endpoint reads better
        // in logs and pool keys.
        write!(f, "{}", self.url.as_str().trim_end_matches('/'))
    }
}

/// The agent RPC surface the controller consumes, one method per call.
///
/// `Client` implements this over HTTP; the test suites substitute in-memory
/// agents.
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn agent_read_version(&self) -> Result<types::AgentVersion, Error>;
    async fn agent_read_plugins(&self)
        -> Result<Vec<types::PluginVersion>, Error>;

    async fn opendnssec_read_version(
        &self,
    ) -> Result<Vec<types::ProgramVersion>, Error>;
    async fn softhsm_read_version(
        &self,
    ) -> Result<Vec<types::ProgramVersion>, Error>;

    async fn opendnssec_read_repository(
        &self,
        name: &str,
    ) -> Result<Option<serde_json::Value>, Error>;
    async fn opendnssec_create_repository(
        &self,
        data: &serde_json::Value,
    ) -> Result<(), Error>;
    async fn opendnssec_update_repository(
        &self,
        data: &serde_json::Value,
    ) -> Result<(), Error>;

    async fn opendnssec_read_policy(
        &self,
        name: &str,
    ) -> Result<Option<serde_json::Value>, Error>;
    async fn opendnssec_create_policy(
        &self,
        data: &serde_json::Value,
    ) -> Result<(), Error>;
    async fn opendnssec_update_policy(
        &self,
        data: &serde_json::Value,
    ) -> Result<(), Error>;

    async fn opendnssec_control_start(&self) -> Result<(), Error>;
    async fn opendnssec_enforcer_update(&self) -> Result<(), Error>;
    async fn opendnssec_enforcer_zone_list(
        &self,
    ) -> Result<Vec<types::EnforcerZone>, Error>;
    async fn opendnssec_create_enforcer_zone(
        &self,
        zone: &types::EnforcerZoneCreate,
    ) -> Result<(), Error>;

    async fn dns_read_zones(&self) -> Result<Vec<types::DnsZoneFile>, Error>;
    async fn dns_read_zone(
        &self,
        request: &types::DnsReadZone,
    ) -> Result<types::DnsZoneContent, Error>;
    async fn dns_create_zone(
        &self,
        zone: &types::DnsZoneWrite,
    ) -> Result<(), Error>;
    async fn dns_update_zone(
        &self,
        zone: &types::DnsZoneWrite,
    ) -> Result<(), Error>;
}

// Response envelopes.  The agent wraps every payload in an object keyed by
// the kind of thing returned.

#[derive(Deserialize)]
struct PluginsEnvelope {
    plugin: Vec<types::PluginVersion>,
}

#[derive(Deserialize)]
struct ProgramsEnvelope {
    program: Vec<types::ProgramVersion>,
}

#[derive(Deserialize)]
struct RepositoryEnvelope {
    repository: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct PolicyEnvelope {
    policy: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct EnforcerZonesEnvelope {
    zone: Vec<types::EnforcerZone>,
}

#[derive(Deserialize)]
struct DnsZonesEnvelope {
    zone: Vec<types::DnsZoneFile>,
}

#[derive(Deserialize)]
struct DnsZoneEnvelope {
    zone: types::DnsZoneContent,
}

#[derive(Serialize)]
struct NameRequest<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct RepositoryRequest<'a> {
    repository: &'a serde_json::Value,
}

#[derive(Serialize)]
struct PolicyRequest<'a> {
    policy: &'a serde_json::Value,
}

#[derive(Serialize)]
struct EnforcerZoneRequest<'a> {
    zone: &'a types::EnforcerZoneCreate,
}

#[derive(Serialize)]
struct DnsZoneWriteRequest<'a> {
    zone: &'a types::DnsZoneWrite,
}

const EMPTY: serde_json::Value = serde_json::Value::Null;

/// reqwest-backed agent client for one endpoint.
#[derive(Clone)]
pub struct Client {
    baseurl: AgentUri,
    client: reqwest::Client,
    log: Logger,
}

impl Client {
    pub fn new(baseurl: AgentUri, log: Logger) -> Client {
        Client::new_with_client(baseurl, reqwest::Client::new(), log)
    }

    /// Build a client sharing an existing connection pool.
    pub fn new_with_client(
        baseurl: AgentUri,
        client: reqwest::Client,
        log: Logger,
    ) -> Client {
        Client { baseurl, client, log }
    }

    pub fn baseurl(&self) -> &AgentUri {
        &self.baseurl
    }

    async fn call<B, R>(&self, method: &str, body: &B) -> Result<R, Error>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/rpc/{}", self.baseurl, method);
        debug!(self.log, "client request"; "method" => method, "uri" => &url);
        let response =
            self.client.post(url.as_str()).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            debug!(self.log, "client error response";
                "method" => method,
                "status" => status.as_u16(),
            );
            return Err(Error::ErrorResponse {
                status: status.as_u16(),
                message,
            });
        }
        let body = response.text().await?;
        debug!(self.log, "client response"; "method" => method);
        serde_json::from_str(&body)
            .map_err(|error| Error::InvalidResponsePayload(error.to_string()))
    }

    /// Like `call`, for operations whose response body carries nothing the
    /// controller needs.
    async fn call_no_result<B>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<(), Error>
    where
        B: Serialize + ?Sized,
    {
        let _: serde_json::Value = self.call(method, body).await?;
        Ok(())
    }
}

#[async_trait]
impl AgentApi for Client {
    async fn agent_read_version(&self) -> Result<types::AgentVersion, Error> {
        self.call("Agent.ReadVersion", &EMPTY).await
    }

    async fn agent_read_plugins(
        &self,
    ) -> Result<Vec<types::PluginVersion>, Error> {
        let envelope: PluginsEnvelope =
            self.call("Agent.ReadPlugins", &EMPTY).await?;
        Ok(envelope.plugin)
    }

    async fn opendnssec_read_version(
        &self,
    ) -> Result<Vec<types::ProgramVersion>, Error> {
        let envelope: ProgramsEnvelope =
            self.call("OpenDNSSEC.ReadVersion", &EMPTY).await?;
        Ok(envelope.program)
    }

    async fn softhsm_read_version(
        &self,
    ) -> Result<Vec<types::ProgramVersion>, Error> {
        let envelope: ProgramsEnvelope =
            self.call("SoftHSM.ReadVersion", &EMPTY).await?;
        Ok(envelope.program)
    }

    async fn opendnssec_read_repository(
        &self,
        name: &str,
    ) -> Result<Option<serde_json::Value>, Error> {
        let envelope: RepositoryEnvelope = self
            .call("OpenDNSSEC.ReadRepository", &NameRequest { name })
            .await?;
        Ok(envelope.repository)
    }

    async fn opendnssec_create_repository(
        &self,
        data: &serde_json::Value,
    ) -> Result<(), Error> {
        self.call_no_result(
            "OpenDNSSEC.CreateRepository",
            &RepositoryRequest { repository: data },
        )
        .await
    }

    async fn opendnssec_update_repository(
        &self,
        data: &serde_json::Value,
    ) -> Result<(), Error> {
        self.call_no_result(
            "OpenDNSSEC.UpdateRepository",
            &RepositoryRequest { repository: data },
        )
        .await
    }

    async fn opendnssec_read_policy(
        &self,
        name: &str,
    ) -> Result<Option<serde_json::Value>, Error> {
        let envelope: PolicyEnvelope =
            self.call("OpenDNSSEC.ReadPolicy", &NameRequest { name }).await?;
        Ok(envelope.policy)
    }

    async fn opendnssec_create_policy(
        &self,
        data: &serde_json::Value,
    ) -> Result<(), Error> {
        self.call_no_result(
            "OpenDNSSEC.CreatePolicy",
            &PolicyRequest { policy: data },
        )
        .await
    }

    async fn opendnssec_update_policy(
        &self,
        data: &serde_json::Value,
    ) -> Result<(), Error> {
        self.call_no_result(
            "OpenDNSSEC.UpdatePolicy",
            &PolicyRequest { policy: data },
        )
        .await
    }

    async fn opendnssec_control_start(&self) -> Result<(), Error> {
        self.call_no_result("OpenDNSSEC.UpdateControlStart", &EMPTY).await
    }

    async fn opendnssec_enforcer_update(&self) -> Result<(), Error> {
        self.call_no_result("OpenDNSSEC.UpdateEnforcerUpdate", &EMPTY).await
    }

    async fn opendnssec_enforcer_zone_list(
        &self,
    ) -> Result<Vec<types::EnforcerZone>, Error> {
        let envelope: EnforcerZonesEnvelope =
            self.call("OpenDNSSEC.ReadEnforcerZoneList", &EMPTY).await?;
        Ok(envelope.zone)
    }

    async fn opendnssec_create_enforcer_zone(
        &self,
        zone: &types::EnforcerZoneCreate,
    ) -> Result<(), Error> {
        self.call_no_result(
            "OpenDNSSEC.CreateEnforcerZone",
            &EnforcerZoneRequest { zone },
        )
        .await
    }

    async fn dns_read_zones(&self) -> Result<Vec<types::DnsZoneFile>, Error> {
        let envelope: DnsZonesEnvelope =
            self.call("DNS.ReadZones", &EMPTY).await?;
        Ok(envelope.zone)
    }

    async fn dns_read_zone(
        &self,
        request: &types::DnsReadZone,
    ) -> Result<types::DnsZoneContent, Error> {
        let envelope: DnsZoneEnvelope =
            self.call("DNS.ReadZone", request).await?;
        Ok(envelope.zone)
    }

    async fn dns_create_zone(
        &self,
        zone: &types::DnsZoneWrite,
    ) -> Result<(), Error> {
        self.call_no_result("DNS.CreateZone", &DnsZoneWriteRequest { zone })
            .await
    }

    async fn dns_update_zone(
        &self,
        zone: &types::DnsZoneWrite,
    ) -> Result<(), Error> {
        self.call_no_result("DNS.UpdateZone", &DnsZoneWriteRequest { zone })
            .await
    }
}

#[cfg(test)]
mod test {
    use super::{AgentUri, UriError};

    #[test]
    fn test_parse_valid() {
        let uri = AgentUri::parse("http://signer1.example.net:8080").unwrap();
        assert_eq!(uri.host(), "signer1.example.net");
        assert_eq!(uri.port(), 8080);
        assert_eq!(uri.to_string(), "http://signer1.example.net:8080");

        let uri = AgentUri::parse("https://10.0.0.1:4443").unwrap();
        assert_eq!(uri.host(), "10.0.0.1");
        assert_eq!(uri.port(), 4443);
    }

    #[test]
    fn test_parse_default_port() {
        let uri = AgentUri::parse("http://agent.example.net").unwrap();
        assert_eq!(uri.port(), 80);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            AgentUri::parse("not a uri"),
            Err(UriError::Malformed { .. })
        ));
        assert!(matches!(
            AgentUri::parse("ftp://example.net:21"),
            Err(UriError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            AgentUri::parse("http://example.net:8080/some/path"),
            Err(UriError::NotABase { .. })
        ));
        assert!(matches!(
            AgentUri::parse("http://example.net:8080?x=1"),
            Err(UriError::NotABase { .. })
        ));
    }

    #[test]
    fn test_from_host_port() {
        let uri = AgentUri::from_host_port("dns1.example.net", 5353).unwrap();
        assert_eq!(uri.to_string(), "http://dns1.example.net:5353");
    }
}
