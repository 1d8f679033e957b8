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
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::admin::Components;
use crate::app::{self, Addresses, Role};
use crate::config::Config;
use crate::signal::ShutdownTrigger;
use crate::telemetry::testing::setup_test_logging;

/// TestApp is a fully built process, running until it is dropped or shut down.
pub struct TestApp {
    pub addresses: Addresses,
    pub components: Components,
    shutdown: ShutdownTrigger,
}

impl TestApp {
    pub async fn start(cfg: Config, role: Role) -> TestApp {
        setup_test_logging();
        let bound = app::build(Arc::new(cfg), role).await.unwrap();
        let app = TestApp {
            addresses: bound.addresses,
            components: bound.components.clone(),
            shutdown: bound.shutdown.trigger(),
        };
        tokio::spawn(bound.wait_termination());
        app
    }

    pub fn sni(&self) -> SocketAddr {
        self.gateway().sni
    }

    pub fn connect(&self) -> SocketAddr {
        self.gateway().connect
    }

    pub fn legacy(&self) -> Option<SocketAddr> {
        self.gateway().legacy
    }

    fn gateway(&self) -> crate::proxy::Addresses {
        self.addresses.gateway.expect("not a gateway")
    }

    pub async fn admin_request(&self, method: Method, path: &str) -> (StatusCode, Bytes) {
        http_request(self.addresses.admin, method, path).await
    }

    pub async fn metrics(&self) -> String {
        let (status, body) = http_request(self.addresses.stats, Method::GET, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        String::from_utf8(body.to_vec()).unwrap()
    }

    pub async fn shutdown(self) {
        self.shutdown.shutdown_now().await;
    }
}

pub async fn http_request(addr: SocketAddr, method: Method, path: &str) -> (StatusCode, Bytes) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    let req = Request::builder()
        .method(method)
        .uri(path)
        .header(hyper::header::HOST, addr.to_string())
        .body(Empty::<Bytes>::new())
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}
