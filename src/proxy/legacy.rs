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

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span};

use crate::drain::{DrainWatcher, run_with_drain};
use crate::proxy::matcher::Match;
use crate::proxy::session::{Entrypoint, SessionState, TunnelSession};
use crate::proxy::{Error, GatewayInputs, dial_backend, hints, log_complete, record_rejection, relay};
use crate::socket;

/// LegacyListener serves tenants that have not moved to CONNECT yet. Each connection starts with a
/// PROXY v2 header whose original destination picks the backend.
pub(super) struct LegacyListener {
    pi: GatewayInputs,
    drain: DrainWatcher,
    listener: socket::Listener,
    address: SocketAddr,
}

impl LegacyListener {
    pub(super) async fn new(pi: GatewayInputs, drain: DrainWatcher) -> Result<LegacyListener, Error> {
        let addr = pi.cfg.gateway.legacy_addr;
        let listener = socket::Listener::bind(addr, pi.cfg.socket)
            .await
            .map_err(|e| Error::Bind(addr, e))?;
        let address = listener.local_addr().map_err(|e| Error::Bind(addr, e))?;
        info!(%address, component = "legacy", "listener established");
        Ok(LegacyListener {
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
        let LegacyListener {
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
                let mut force_shutdown = force_shutdown.clone();
                let session = pi.sessions.open(Entrypoint::Legacy, remote);
                let span = info_span!("legacy", id = session.id(), src = %remote);
                tokio::spawn(
                    async move {
                        let res = tokio::select! {
                            res = Self::proxy(&pi, &session, stream) => res,
                            _ = force_shutdown.changed() => Err(Error::Terminated),
                        };
                        log_complete(&session, &res);
                        drop(drain);
                    }
                    .instrument(span),
                );
            }
        };
        run_with_drain("legacy".to_string(), drain, deadline, accept).await
    }

    async fn proxy(
        pi: &GatewayInputs,
        session: &TunnelSession,
        mut stream: TcpStream,
    ) -> Result<(), Error> {
        session.set_state(SessionState::Matching);
        let (m, prefix) = match Self::classify(pi, &mut stream).await {
            Ok(matched) => matched,
            Err(e) => {
                record_rejection(pi, Entrypoint::Legacy, &e);
                return Err(e);
            }
        };
        let upstream = match dial_backend(pi, session, &m).await {
            Ok(s) => s,
            Err(e) => {
                record_rejection(pi, Entrypoint::Legacy, &e);
                return Err(e);
            }
        };
        relay(pi, session, stream, upstream, &m, prefix).await
    }

    async fn classify(pi: &GatewayInputs, stream: &mut TcpStream) -> Result<(Match, BytesMut), Error> {
        // Checked per connection, so disabling the port at runtime refuses new connections while
        // leaving established ones alone.
        let migration = pi.state.migration.snapshot();
        if !migration.legacy_port_enabled() {
            return Err(Error::LegacyPortDisabled);
        }
        let timeout = pi.cfg.gateway.match_timeout;
        let mut buf = BytesMut::with_capacity(1024);
        let header = hints::read_header(stream, &mut buf, timeout).await?;
        debug!(source = %header.source, destination = %header.destination, "read PROXY header");
        let m = pi.matcher.match_legacy(header.destination, &migration)?;
        // Only the first header is trusted. Stacked ones are dropped however the client splits
        // them across segments, so this waits for the first payload bytes up to the timeout.
        let stacked = hints::strip_forged(stream, &mut buf, timeout).await?;
        if stacked > 0 {
            debug!(stacked, "discarded stacked PROXY headers");
        }
        Ok((m, buf))
    }
}
