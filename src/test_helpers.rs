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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;

use crate::config::{
    ClientConfig, Config, ConfigSource, GatewayConfig, ReverseClientConfig, ReverseServerConfig,
};
use crate::identifier::BackendClass;
use crate::state::LocalState;
use crate::state::routes::{BackendAddress, RouteEntry};

pub mod app;
pub mod tcp;

// Tenant namespaces used across tests.
pub const TENANT_A: &str = "shoot--dev--alpha";
pub const TENANT_B: &str = "shoot--dev--beta";

/// Localhost with an ephemeral port, so tests neither collide nor listen publicly.
pub fn localhost() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

pub fn test_config() -> Config {
    Config {
        admin_addr: localhost(),
        stats_addr: localhost(),
        readiness_addr: localhost(),
        termination_grace_period: Duration::from_secs(1),
        gateway: GatewayConfig {
            sni_addr: localhost(),
            connect_addr: localhost(),
            legacy_addr: localhost(),
            match_timeout: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(1),
            ..Default::default()
        },
        client: ClientConfig {
            listen_addr: localhost(),
            connect_timeout: Duration::from_secs(1),
            max_retry_elapsed: Duration::from_millis(500),
            ..Default::default()
        },
        reverse_client: ReverseClientConfig {
            packet_addr: localhost(),
            connect_timeout: Duration::from_secs(1),
            keepalive_interval: Duration::from_millis(200),
            keepalive_timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
            ..Default::default()
        },
        reverse_server: ReverseServerConfig {
            listen_addr: localhost(),
            packet_addr: localhost(),
            handshake_timeout: Duration::from_secs(1),
            keepalive_interval: Duration::from_millis(200),
            keepalive_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn route(tenant: &str, class: BackendClass, backend: SocketAddr) -> RouteEntry {
    RouteEntry {
        tenant: tenant.to_string(),
        class,
        address: BackendAddress {
            host: backend.ip().to_string(),
            port: backend.port(),
        },
        hostnames: Vec::new(),
    }
}

/// Serve `local` as the gateway's local state.
pub fn with_local_state(cfg: Config, local: &LocalState) -> Config {
    let yaml = serde_yaml::to_string(local).unwrap();
    Config {
        local_state: Some(ConfigSource::Static(Bytes::from(yaml))),
        ..cfg
    }
}
