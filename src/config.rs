// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::identifier::{BackendClass, ValidatorConfig};
use crate::state::migration::ProtocolVersion;

const CONFIG_PATH: &str = "TUNNELGATE_CONFIG";
const LOCAL_STATE_PATH: &str = "LOCAL_STATE_PATH";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";
const WORKER_THREADS: &str = "TUNNELGATE_WORKER_THREADS";
const DESTINATION_HEADER: &str = "DESTINATION_HEADER";
const DEFAULT_REDIRECT: &str = "DEFAULT_REDIRECT";
const TENANT_NAMESPACE: &str = "TENANT_NAMESPACE";
const GATEWAY_ADDRESS: &str = "GATEWAY_ADDRESS";
const GATEWAY_LEGACY_ADDRESS: &str = "GATEWAY_LEGACY_ADDRESS";
const CLIENT_PROTOCOL: &str = "CLIENT_PROTOCOL";

pub const DEFAULT_DESTINATION_HEADER: &str = "x-tunnel-destination";

const DEFAULT_WORKER_THREADS: usize = 2;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("failed to read config file {0}: {1}")]
    File(PathBuf, std::io::Error),
    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// ConfigSource is a file on disk or, mostly for tests, inline contents.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Static(Bytes),
}

impl ConfigSource {
    pub async fn read_to_string(&self) -> anyhow::Result<String> {
        Ok(match self {
            ConfigSource::File(path) => tokio::fs::read_to_string(path).await?,
            ConfigSource::Static(data) => std::str::from_utf8(data).map(|s| s.to_string())?,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub admin_addr: SocketAddr,
    pub stats_addr: SocketAddr,
    pub readiness_addr: SocketAddr,

    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub termination_grace_period: Duration,
    /// Worker threads for the tokio runtime.
    pub num_worker_threads: usize,

    /// Name of the CONNECT request header that carries the destination identifier.
    pub destination_header: String,
    pub validator: ValidatorConfig,
    pub socket: SocketConfig,

    pub gateway: GatewayConfig,
    pub client: ClientConfig,
    pub reverse_client: ReverseClientConfig,
    pub reverse_server: ReverseServerConfig,

    /// Where routes and migration flags are loaded from.
    #[serde(skip_deserializing)]
    pub local_state: Option<ConfigSource>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            admin_addr: SocketAddr::from(([127, 0, 0, 1], 15000)),
            stats_addr: SocketAddr::from(([0, 0, 0, 0], 15020)),
            readiness_addr: SocketAddr::from(([0, 0, 0, 0], 15021)),
            termination_grace_period: Duration::from_secs(5),
            num_worker_threads: DEFAULT_WORKER_THREADS,
            destination_header: DEFAULT_DESTINATION_HEADER.to_string(),
            validator: ValidatorConfig::default(),
            socket: SocketConfig::default(),
            gateway: GatewayConfig::default(),
            client: ClientConfig::default(),
            reverse_client: ReverseClientConfig::default(),
            reverse_server: ReverseServerConfig::default(),
            local_state: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketConfig {
    pub keepalive_enabled: bool,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub keepalive_time: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub keepalive_interval: Duration,
    pub keepalive_retries: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            keepalive_enabled: true,
            keepalive_time: Duration::from_secs(180),
            keepalive_interval: Duration::from_secs(180),
            keepalive_retries: 9,
        }
    }
}

/// Whether the gateway prepends its own PROXY v2 header when dialing each backend class.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyProtocolConfig {
    pub api_server: bool,
    pub tunnel_server: bool,
}

impl ProxyProtocolConfig {
    pub fn enabled_for(&self, class: BackendClass) -> bool {
        match class {
            BackendClass::ApiServer => self.api_server,
            BackendClass::TunnelServer { .. } => self.tunnel_server,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub sni_addr: SocketAddr,
    pub connect_addr: SocketAddr,
    pub legacy_addr: SocketAddr,
    /// Where unmatched HTTP requests are redirected. Unset means they get a 404.
    pub default_redirect: Option<String>,
    pub proxy_protocol: ProxyProtocolConfig,

    /// Bound on reading the ClientHello, the CONNECT request head or the legacy header.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub match_timeout: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub dial_timeout: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub idle_timeout: Duration,
    /// How long the other direction may keep flowing after one side has closed.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub linger_timeout: Duration,
    pub max_client_hello: usize,

    pub local_state_path: Option<PathBuf>,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub reload_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            sni_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            connect_addr: SocketAddr::from(([0, 0, 0, 0], 8132)),
            legacy_addr: SocketAddr::from(([0, 0, 0, 0], 9443)),
            default_redirect: None,
            proxy_protocol: ProxyProtocolConfig::default(),
            match_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(3600),
            linger_timeout: Duration::from_secs(5),
            max_client_hello: 16 * 1024,
            local_state_path: None,
            reload_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub listen_addr: SocketAddr,
    /// The gateway's CONNECT listener, `host:port`.
    pub gateway_addr: String,
    /// The gateway's legacy listener, used while the tenant is on the legacy protocol.
    pub gateway_legacy_addr: Option<String>,
    pub tenant: String,
    pub class: BackendClass,
    pub protocol: ProtocolVersion,
    /// Backend address announced in the legacy header.
    pub legacy_destination: Option<SocketAddr>,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub connect_timeout: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub max_retry_elapsed: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub idle_timeout: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub linger_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 6443)),
            gateway_addr: String::new(),
            gateway_legacy_addr: None,
            tenant: String::new(),
            class: BackendClass::ApiServer,
            protocol: ProtocolVersion::Legacy,
            legacy_destination: None,
            connect_timeout: Duration::from_secs(10),
            max_retry_elapsed: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(3600),
            linger_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReverseClientConfig {
    pub gateway_addr: String,
    pub tenant: String,
    pub replica: Option<u8>,
    /// Address ranges of the tenant network announced to the server.
    pub ranges: Vec<IpNet>,
    /// Local UDP socket exchanging raw IP packets with the tenant network.
    pub packet_addr: SocketAddr,
    /// Peer of `packet_addr` that packets from the link are sent to.
    pub packet_peer: Option<SocketAddr>,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub connect_timeout: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub keepalive_interval: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub keepalive_timeout: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub initial_backoff: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub max_backoff: Duration,
}

impl Default for ReverseClientConfig {
    fn default() -> Self {
        ReverseClientConfig {
            gateway_addr: String::new(),
            tenant: String::new(),
            replica: None,
            ranges: Vec::new(),
            packet_addr: SocketAddr::from(([127, 0, 0, 1], 5194)),
            packet_peer: None,
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(15),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReverseServerConfig {
    pub listen_addr: SocketAddr,
    pub tenant: String,
    /// Address ranges on the control plane side. Tenant ranges may not overlap them.
    pub ranges: Vec<IpNet>,
    pub packet_addr: SocketAddr,
    pub packet_peer: Option<SocketAddr>,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub handshake_timeout: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub keepalive_interval: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub keepalive_timeout: Duration,
}

impl Default for ReverseServerConfig {
    fn default() -> Self {
        ReverseServerConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 1194)),
            tenant: String::new(),
            ranges: Vec::new(),
            packet_addr: SocketAddr::from(([127, 0, 0, 1], 5195)),
            packet_peer: None,
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(30),
        }
    }
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(Some)
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

fn parse_duration(env: &str) -> Result<Option<Duration>, Error> {
    match std::env::var(env) {
        Ok(val) => duration_str::parse(&val)
            .map(Some)
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

pub fn parse_config() -> Result<Config, Error> {
    let contents = match parse::<PathBuf>(CONFIG_PATH)? {
        Some(path) => Some(std::fs::read_to_string(&path).map_err(|e| Error::File(path, e))?),
        None => None,
    };
    construct_config(contents.as_deref())
}

/// Build the configuration from an optional YAML document, then apply env overrides.
pub fn construct_config(file: Option<&str>) -> Result<Config, Error> {
    let mut cfg: Config = match empty_to_none(file) {
        Some(contents) => serde_yaml::from_str(contents)?,
        None => Config::default(),
    };

    if let Some(v) = parse_duration(TERMINATION_GRACE_PERIOD)? {
        cfg.termination_grace_period = v;
    }
    if let Some(v) = parse(WORKER_THREADS)? {
        cfg.num_worker_threads = v;
    }
    if let Some(v) = empty_to_none(parse::<String>(DESTINATION_HEADER)?) {
        cfg.destination_header = v;
    }
    if let Some(v) = empty_to_none(parse::<String>(DEFAULT_REDIRECT)?) {
        cfg.gateway.default_redirect = Some(v);
    }
    if let Some(v) = empty_to_none(parse::<String>(TENANT_NAMESPACE)?) {
        cfg.client.tenant = v.clone();
        cfg.reverse_client.tenant = v.clone();
        cfg.reverse_server.tenant = v;
    }
    if let Some(v) = empty_to_none(parse::<String>(GATEWAY_ADDRESS)?) {
        cfg.client.gateway_addr = v.clone();
        cfg.reverse_client.gateway_addr = v;
    }
    if let Some(v) = empty_to_none(parse::<String>(GATEWAY_LEGACY_ADDRESS)?) {
        cfg.client.gateway_legacy_addr = Some(v);
    }
    if let Some(v) = parse_protocol(CLIENT_PROTOCOL)? {
        cfg.client.protocol = v;
    }

    cfg.local_state = empty_to_none(parse::<String>(LOCAL_STATE_PATH)?)
        .map(PathBuf::from)
        .or_else(|| cfg.gateway.local_state_path.clone())
        .map(ConfigSource::File);

    if cfg.num_worker_threads == 0 {
        return Err(Error::Invalid("numWorkerThreads must be positive".to_string()));
    }
    if http::HeaderName::from_bytes(cfg.destination_header.as_bytes()).is_err() {
        return Err(Error::Invalid(format!(
            "destinationHeader {:?} is not a valid header name",
            cfg.destination_header
        )));
    }
    Ok(cfg)
}

fn parse_protocol(env: &str) -> Result<Option<ProtocolVersion>, Error> {
    match std::env::var(env).as_deref() {
        Ok("legacy") => Ok(Some(ProtocolVersion::Legacy)),
        Ok("current") => Ok(Some(ProtocolVersion::Current)),
        Ok(other) => Err(Error::EnvVar(env.to_string(), other.to_string())),
        Err(_) => Ok(None),
    }
}

pub fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
    inp.filter(|s| !s.as_ref().is_empty())
}
