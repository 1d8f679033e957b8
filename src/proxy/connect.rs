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
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span};

use crate::drain::{DrainWatcher, run_with_drain};
use crate::hyper_util::empty_response;
use crate::proxy::session::{Entrypoint, SessionState};
use crate::proxy::{Error, GatewayInputs, dial_backend, log_complete, record_rejection, relay};
use crate::socket;

// CONNECT requests are a request line and a few headers.
const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// ConnectListener accepts HTTP/1.1 CONNECT requests naming their destination in a header, and
/// turns each accepted request into a tunnel to that tenant's backend.
pub(super) struct ConnectListener {
    pi: GatewayInputs,
    drain: DrainWatcher,
    listener: socket::Listener,
    address: SocketAddr,
}

impl ConnectListener {
    pub(super) async fn new(pi: GatewayInputs, drain: DrainWatcher) -> Result<ConnectListener, Error> {
        let addr = pi.cfg.gateway.connect_addr;
        let listener = socket::Listener::bind(addr, pi.cfg.socket)
            .await
            .map_err(|e| Error::Bind(addr, e))?;
        let address = listener.local_addr().map_err(|e| Error::Bind(addr, e))?;
        info!(%address, component = "connect", "listener established");
        Ok(ConnectListener {
            pi,
            drain,
            listener,
            address,
        })
    }

    pub(super) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(super) async fn run(self) {
        let ConnectListener {
            pi,
            drain,
            listener,
            ..
        } = self;
        let deadline = pi.cfg.termination_grace_period;
        let accept = move |drain: DrainWatcher, force_shutdown: watch::Receiver<()>| async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        if crate::proxy::is_runtime_shutdown(&e) {
                            return;
                        }
                        error!("failed to accept connection: {e}");
                        continue;
                    }
                };
                let pi = pi.clone();
                let drain = drain.clone();
                let force_shutdown = force_shutdown.clone();
                let span = info_span!("connect", src = %remote);
                tokio::spawn(
                    Self::serve_connection(pi, stream, remote, drain, force_shutdown).instrument(span),
                );
            }
        };
        run_with_drain("connect".to_string(), drain, deadline, accept).await
    }

    async fn serve_connection(
        pi: GatewayInputs,
        stream: TcpStream,
        remote: SocketAddr,
        drain: DrainWatcher,
        mut force_shutdown: watch::Receiver<()>,
    ) {
        let match_timeout = pi.cfg.gateway.match_timeout;
        let svc = {
            let drain = drain.clone();
            let force_shutdown = force_shutdown.clone();
            service_fn(move |req| {
                let pi = pi.clone();
                let drain = drain.clone();
                let force_shutdown = force_shutdown.clone();
                async move {
                    Ok::<_, Infallible>(
                        Self::serve_request(pi, remote, req, drain, force_shutdown).await,
                    )
                }
                .in_current_span()
            })
        };
        let conn = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(match_timeout)
            .max_buf_size(MAX_REQUEST_HEAD)
            .serve_connection(TokioIo::new(stream), svc)
            .with_upgrades();
        tokio::pin!(conn);
        let res = tokio::select! {
            res = conn.as_mut() => res,
            _ = force_shutdown.changed() => return,
            blocker = drain.clone().wait_for_drain() => {
                // Finish the request in flight, if any, then close.
                conn.as_mut().graceful_shutdown();
                let res = tokio::select! {
                    res = conn.as_mut() => res,
                    _ = force_shutdown.changed() => Ok(()),
                };
                drop(blocker);
                res
            }
        };
        if let Err(e) = res {
            debug!("connection error: {e}");
        }
        drop(drain);
    }

    async fn serve_request(
        pi: GatewayInputs,
        remote: SocketAddr,
        req: Request<Incoming>,
        drain: DrainWatcher,
        mut force_shutdown: watch::Receiver<()>,
    ) -> Response<Full<Bytes>> {
        if req.method() != Method::CONNECT {
            debug!(method = %req.method(), "not a CONNECT request");
            return redirect(pi.cfg.gateway.default_redirect.as_deref());
        }
        let session = pi.sessions.open(Entrypoint::Connect, remote);
        session.set_state(SessionState::Matching);
        let m = match pi.matcher.match_connect(req.headers(), &pi.destination_header) {
            Ok(m) => m,
            Err(e) => {
                record_rejection(&pi, Entrypoint::Connect, &e);
                return empty_response(e.status());
            }
        };
        // Dial before answering, so the client never sees 200 for a backend that is down.
        let upstream = match dial_backend(&pi, &session, &m).await {
            Ok(s) => s,
            Err(e) => {
                record_rejection(&pi, Entrypoint::Connect, &e);
                return empty_response(e.status());
            }
        };
        let span = info_span!("tunnel", id = session.id(), tenant = m.tenant, class = %m.class);
        tokio::spawn(
            async move {
                let res = tokio::select! {
                    res = async {
                        let upgraded = hyper::upgrade::on(req).await?;
                        relay(&pi, &session, TokioIo::new(upgraded), upstream, &m, BytesMut::new()).await
                    } => res,
                    _ = force_shutdown.changed() => Err(Error::Terminated),
                };
                log_complete(&session, &res);
                drop(drain);
            }
            .instrument(span),
        );
        empty_response(StatusCode::OK)
    }
}

/// Anything other than CONNECT is pointed at the configured redirect, if there is one.
fn redirect(location: Option<&str>) -> Response<Full<Bytes>> {
    let Some(location) = location.and_then(|l| HeaderValue::from_str(l).ok()) else {
        return empty_response(StatusCode::NOT_FOUND);
    };
    let mut resp = empty_response(StatusCode::PERMANENT_REDIRECT);
    resp.headers_mut().insert(LOCATION, location);
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_location() {
        let resp = redirect(Some("https://example.com/docs"));
        assert_eq!(resp.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(resp.headers()[LOCATION], "https://example.com/docs");
        assert_eq!(redirect(None).status(), StatusCode::NOT_FOUND);
    }
}
