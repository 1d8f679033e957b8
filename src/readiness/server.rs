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

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use itertools::Itertools;

use crate::drain::DrainWatcher;
use crate::hyper_util::{Server, empty_response, plaintext_response};
use crate::readiness::Ready;
use crate::signal::ShutdownTrigger;

pub struct Service {
    s: Server<Ready>,
}

impl Service {
    pub async fn new(
        addr: SocketAddr,
        ready: Ready,
        shutdown_trigger: ShutdownTrigger,
        drain_rx: DrainWatcher,
    ) -> anyhow::Result<Self> {
        Server::bind("readiness", addr, shutdown_trigger, drain_rx, ready)
            .await
            .map(|s| Service { s })
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s.spawn(|ready, req| async move {
            match req.uri().path() {
                "/healthz/ready" => handle_ready(&ready, req),
                _ => empty_response(StatusCode::NOT_FOUND),
            }
        })
    }
}

fn handle_ready(ready: &Ready, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    let pending = ready.pending();
    if pending.is_empty() {
        return plaintext_response(StatusCode::OK, "ready\n".into());
    }
    plaintext_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!(
            "not ready, pending: {}\n",
            pending.into_iter().sorted().join(", ")
        ),
    )
}
