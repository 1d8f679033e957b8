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
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Request, Response, StatusCode};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

use crate::drain::DrainWatcher;
use crate::hyper_util::{Server, empty_response, plaintext_response};
use crate::signal::ShutdownTrigger;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text;charset=utf-8;version=1.0.0";

/// Service serves the metrics registry for scraping.
pub struct Service {
    s: Server<Mutex<Registry>>,
}

impl Service {
    pub async fn new(
        addr: SocketAddr,
        registry: Registry,
        shutdown_trigger: ShutdownTrigger,
        drain_rx: DrainWatcher,
    ) -> anyhow::Result<Self> {
        Server::bind("stats", addr, shutdown_trigger, drain_rx, Mutex::new(registry))
            .await
            .map(|s| Service { s })
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s.spawn(|registry, req| async move {
            match req.uri().path() {
                "/metrics" | "/stats/prometheus" => handle_metrics(&registry, req),
                _ => empty_response(StatusCode::NOT_FOUND),
            }
        })
    }
}

fn handle_metrics(registry: &Mutex<Registry>, _req: Request<Incoming>) -> Response<Full<Bytes>> {
    let mut buf = String::new();
    let registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(err) = encode(&mut buf, &registry) {
        return plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }
    let mut resp = Response::new(Full::new(Bytes::from(buf)));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(OPENMETRICS_CONTENT_TYPE));
    resp
}
