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

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::drain::DrainWatcher;
use crate::signal::ShutdownTrigger;

pub fn empty_response(code: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::default());
    *resp.status_mut() = code;
    resp
}

pub fn plaintext_response(code: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = code;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}

pub fn json_response<T: serde::Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec_pretty(value) {
        Ok(body) => {
            let mut resp = Response::new(Full::new(Bytes::from(body)));
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(e) => plaintext_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to serialize: {e}\n"),
        ),
    }
}

/// Server is the plaintext HTTP/1.1 server behind the admin, stats and readiness endpoints.
/// It stops accepting on drain and finishes in-flight requests before releasing the drain.
pub struct Server<S> {
    name: String,
    listener: TcpListener,
    shutdown_trigger: ShutdownTrigger,
    drain_rx: DrainWatcher,
    state: Arc<S>,
}

impl<S> Server<S> {
    pub async fn bind(
        name: &str,
        addr: SocketAddr,
        shutdown_trigger: ShutdownTrigger,
        drain_rx: DrainWatcher,
        s: S,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {name} server to {addr}: {e}"))?;
        Ok(Server {
            name: name.to_string(),
            listener,
            shutdown_trigger,
            drain_rx,
            state: Arc::new(s),
        })
    }

    pub fn address(&self) -> SocketAddr {
        // A bound listener always has a local address.
        self.listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    pub fn state(&self) -> Arc<S> {
        self.state.clone()
    }

    pub fn spawn<F, R>(self, f: F)
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, Request<Incoming>) -> R + Send + Sync + 'static,
        R: Future<Output = Response<Full<Bytes>>> + Send + 'static,
    {
        let address = self.address();
        let Server {
            name,
            listener,
            shutdown_trigger,
            drain_rx,
            state,
        } = self;
        info!(%address, component = name, "listener established");
        let f = Arc::new(f);
        tokio::spawn(async move {
            let drained = drain_rx.clone().wait_for_drain();
            tokio::pin!(drained);
            loop {
                let (stream, remote) = tokio::select! {
                    res = listener.accept() => match res {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(component = name, "accept failed: {e}");
                            shutdown_trigger.shutdown_now().await;
                            return;
                        }
                    },
                    blocker = &mut drained => {
                        info!(component = name, "starting drain");
                        drop(blocker);
                        return;
                    }
                };
                let state = state.clone();
                let f = f.clone();
                let drain = drain_rx.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let fut = f(state.clone(), req);
                        async move { Ok::<_, Infallible>(fut.await) }
                    });
                    let conn = http1::Builder::new()
                        .timer(TokioTimer::new())
                        .half_close(true)
                        .header_read_timeout(Duration::from_secs(2))
                        .max_buf_size(8 * 1024)
                        .serve_connection(TokioIo::new(stream), svc);
                    tokio::pin!(conn);
                    tokio::select! {
                        res = conn.as_mut() => {
                            if let Err(e) = res {
                                debug!(component = name, %remote, "connection error: {e}");
                            }
                        }
                        blocker = drain.wait_for_drain() => {
                            conn.as_mut().graceful_shutdown();
                            let _ = conn.await;
                            drop(blocker);
                        }
                    }
                });
            }
        });
    }
}
