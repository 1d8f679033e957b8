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
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};

use tunnelgate::app::Role;
use tunnelgate::config::Config;
use tunnelgate::identifier::BackendClass;
use tunnelgate::state::LocalState;
use tunnelgate::test_helpers::app::TestApp;
use tunnelgate::test_helpers::{localhost, route, test_config, with_local_state};

fn ipv4_packet(dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut p = vec![0u8; 20];
    p[0] = 0x45;
    p[12..16].copy_from_slice(&[10, 0, 0, 1]);
    p[16..20].copy_from_slice(&dst);
    p.extend_from_slice(payload);
    p
}

struct Landscape {
    gateway: TestApp,
    server: TestApp,
}

async fn reverse_server(listen_addr: SocketAddr) -> TestApp {
    let mut cfg = test_config();
    cfg.reverse_server.tenant = "tenant-b".to_string();
    cfg.reverse_server.ranges = vec!["100.64.0.0/13".parse().unwrap()];
    cfg.reverse_server.listen_addr = listen_addr;
    TestApp::start(cfg, Role::ReverseServer).await
}

/// A gateway routing tenant-b's tunnel server class to a running reverse server.
async fn landscape() -> Landscape {
    let server = reverse_server(localhost()).await;

    let mut cfg = test_config();
    cfg.gateway.proxy_protocol.tunnel_server = true;
    let local = LocalState {
        routes: vec![route(
            "tenant-b",
            BackendClass::TunnelServer { replica: None },
            server.addresses.reverse_server.unwrap(),
        )],
        ..Default::default()
    };
    let gateway = TestApp::start(with_local_state(cfg, &local), Role::Gateway).await;
    Landscape { gateway, server }
}

fn reverse_client_config(gateway: &TestApp, ranges: &[&str], peer: SocketAddr) -> Config {
    let mut cfg = test_config();
    cfg.reverse_client.gateway_addr = gateway.connect().to_string();
    cfg.reverse_client.tenant = "tenant-b".to_string();
    cfg.reverse_client.ranges = ranges.iter().map(|r| r.parse().unwrap()).collect();
    cfg.reverse_client.packet_peer = Some(peer);
    cfg
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("packet delivered")
        .unwrap();
    buf.truncate(n);
    buf
}

async fn wait_installed(server: &TestApp, installed: bool) {
    let links = server.components.links.clone().unwrap();
    for _ in 0..250 {
        if links.is_installed("tenant-b") == installed {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("link installed != {installed}");
}

#[tokio::test]
async fn packets_flow_over_the_reverse_link() {
    let Landscape { gateway, server } = landscape().await;
    let tenant_stack = UdpSocket::bind(localhost()).await.unwrap();
    let client = TestApp::start(
        reverse_client_config(&gateway, &["10.250.0.0/16"], tenant_stack.local_addr().unwrap()),
        Role::ReverseClient,
    )
    .await;
    wait_installed(&server, true).await;

    // The control plane side originates traffic toward the tenant network.
    let control_plane_stack = UdpSocket::bind(localhost()).await.unwrap();
    let to_tenant = ipv4_packet([10, 250, 1, 5], b"ping");
    control_plane_stack
        .send_to(&to_tenant, server.addresses.packets.unwrap())
        .await
        .unwrap();
    assert_eq!(recv(&tenant_stack).await, to_tenant);

    // Replies travel back; the server learned where its stack is from the first datagram.
    let reply = ipv4_packet([100, 64, 0, 9], b"pong");
    tenant_stack
        .send_to(&reply, client.addresses.packets.unwrap())
        .await
        .unwrap();
    assert_eq!(recv(&control_plane_stack).await, reply);

    // Nothing routes to addresses no link claims.
    let stray = ipv4_packet([192, 168, 7, 7], b"lost");
    control_plane_stack
        .send_to(&stray, server.addresses.packets.unwrap())
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    assert!(
        tokio::time::timeout(Duration::from_millis(200), tenant_stack.recv_from(&mut buf))
            .await
            .is_err()
    );

    let (_, body) = server
        .admin_request(hyper::Method::GET, "/config_dump")
        .await;
    let dump: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(dump["links"].to_string().contains("10.250.0.0/16"));
}

#[tokio::test]
async fn overlapping_ranges_are_refused() {
    let Landscape { gateway, server } = landscape().await;
    let tenant_stack = UdpSocket::bind(localhost()).await.unwrap();
    let _client = TestApp::start(
        reverse_client_config(&gateway, &["100.64.8.0/24"], tenant_stack.local_addr().unwrap()),
        Role::ReverseClient,
    )
    .await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    wait_installed(&server, false).await;
}

#[tokio::test]
async fn link_comes_back_after_the_server_restarts() {
    let Landscape { gateway, server } = landscape().await;
    let tenant_stack = UdpSocket::bind(localhost()).await.unwrap();
    let _client = TestApp::start(
        reverse_client_config(&gateway, &["10.250.0.0/16"], tenant_stack.local_addr().unwrap()),
        Role::ReverseClient,
    )
    .await;
    wait_installed(&server, true).await;

    // Restart the server on the same address, so the gateway route stays valid.
    let address = server.addresses.reverse_server.unwrap();
    server.shutdown().await;
    let mut freed = false;
    for _ in 0..100 {
        if TcpListener::bind(address).await.is_ok() {
            freed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(freed, "old server released {address}");
    let server = reverse_server(address).await;

    // The client dials through the gateway again and the new server installs the link.
    wait_installed(&server, true).await;
    let control_plane_stack = UdpSocket::bind(localhost()).await.unwrap();
    let to_tenant = ipv4_packet([10, 250, 3, 3], b"again");
    control_plane_stack
        .send_to(&to_tenant, server.addresses.packets.unwrap())
        .await
        .unwrap();
    assert_eq!(recv(&tenant_stack).await, to_tenant);
}
