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

use std::sync::Arc;

use hyper::{Method, StatusCode};
use tokio::net::TcpStream;

use tunnelgate::app::{self, Role};
use tunnelgate::config::Config;
use tunnelgate::identifier::BackendClass;
use tunnelgate::state::LocalState;
use tunnelgate::state::migration::ProtocolVersion;
use tunnelgate::test_helpers::app::TestApp;
use tunnelgate::test_helpers::tcp::{EchoServer, echo_round_trip};
use tunnelgate::test_helpers::{TENANT_A, route, test_config, with_local_state};

async fn gateway_for(backend: std::net::SocketAddr) -> TestApp {
    let local = LocalState {
        routes: vec![route(TENANT_A, BackendClass::ApiServer, backend)],
        ..Default::default()
    };
    TestApp::start(with_local_state(test_config(), &local), Role::Gateway).await
}

fn client_config(gateway: &TestApp, protocol: ProtocolVersion) -> Config {
    let mut cfg = test_config();
    cfg.client.tenant = TENANT_A.to_string();
    cfg.client.gateway_addr = gateway.connect().to_string();
    cfg.client.gateway_legacy_addr = gateway.legacy().map(|a| a.to_string());
    cfg.client.protocol = protocol;
    cfg
}

async fn opened(gateway: &TestApp, entrypoint: &str) -> u64 {
    let prefix = format!("tunnelgate_tcp_connections_opened_total{{entrypoint=\"{entrypoint}\"}} ");
    gateway
        .metrics()
        .await
        .lines()
        .find_map(|l| l.strip_prefix(&prefix))
        .map(|v| v.trim().parse().unwrap())
        .unwrap_or(0)
}

#[tokio::test]
async fn client_tunnels_through_connect() {
    let (backend, _) = EchoServer::new().await;
    let backend = backend.spawn();
    let gateway = gateway_for(backend).await;
    let client = TestApp::start(client_config(&gateway, ProtocolVersion::Current), Role::Client).await;

    let mut stream = TcpStream::connect(client.addresses.client.unwrap())
        .await
        .unwrap();
    assert_eq!(echo_round_trip(&mut stream, b"kubectl get pods").await, b"kubectl get pods");
    assert_eq!(opened(&gateway, "connect").await, 1);
    assert_eq!(opened(&gateway, "legacy").await, 0);
}

#[tokio::test]
async fn client_migrates_from_legacy_to_connect() {
    let (backend, _) = EchoServer::new().await;
    let backend = backend.spawn();
    let gateway = gateway_for(backend).await;
    let mut cfg = client_config(&gateway, ProtocolVersion::Legacy);
    cfg.client.legacy_destination = Some(backend);
    let client = TestApp::start(cfg, Role::Client).await;
    let listen = client.addresses.client.unwrap();

    let mut stream = TcpStream::connect(listen).await.unwrap();
    assert_eq!(echo_round_trip(&mut stream, b"legacy").await, b"legacy");
    assert_eq!(opened(&gateway, "legacy").await, 1);

    let (status, body) = client.admin_request(Method::POST, "/migrate").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "protocol is current (changed: true)\n");
    let (_, body) = client.admin_request(Method::POST, "/migrate").await;
    assert_eq!(body, "protocol is current (changed: false)\n");

    // The open connection keeps its protocol; new ones use CONNECT.
    assert_eq!(echo_round_trip(&mut stream, b"still open").await, b"still open");
    let mut stream = TcpStream::connect(listen).await.unwrap();
    assert_eq!(echo_round_trip(&mut stream, b"current").await, b"current");
    assert_eq!(opened(&gateway, "connect").await, 1);
    assert_eq!(opened(&gateway, "legacy").await, 1);
}

#[tokio::test]
async fn client_refuses_a_destination_it_cannot_name() {
    let mut cfg = test_config();
    cfg.client.tenant = "Not_A_Namespace".to_string();
    cfg.client.gateway_addr = "127.0.0.1:1".to_string();
    assert!(app::build(Arc::new(cfg), Role::Client).await.is_err());
}

#[tokio::test]
async fn refused_tunnel_closes_the_local_connection() {
    // The gateway has no route for this tenant, so every attempt is answered with 503 until
    // the client gives up.
    let gateway = TestApp::start(test_config(), Role::Gateway).await;
    let client = TestApp::start(client_config(&gateway, ProtocolVersion::Current), Role::Client).await;

    let mut stream = TcpStream::connect(client.addresses.client.unwrap())
        .await
        .unwrap();
    let mut buf = [0u8; 8];
    let n = tokio::io::AsyncReadExt::read(&mut stream, &mut buf)
        .await
        .unwrap_or(0);
    assert_eq!(n, 0);
}
