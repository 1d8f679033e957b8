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

use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{Instrument, error, info, info_span, warn};

use crate::drain::{DrainWatcher, run_with_drain};
use crate::proxy::matcher::Match;
use crate::proxy::session::{Entrypoint, SessionState, TunnelSession};
use crate::proxy::sni::{self, Sniff};
use crate::proxy::{Error, GatewayInputs, dial_backend, log_complete, record_rejection, relay};
use crate::socket;

/// SniListener routes TLS connections by the server name in their ClientHello, passing the
/// handshake through untouched.
pub(super) struct SniListener {
    pi: GatewayInputs,
    drain: DrainWatcher,
    listener: socket::Listener,
    address: SocketAddr,
}

impl SniListener {
    pub(super) async fn new(pi: GatewayInputs, drain: DrainWatcher) -> Result<SniListener, Error> {
        let addr = pi.cfg.gateway.sni_addr;
        let listener = socket::Listener::bind(addr, pi.cfg.socket)
            .await
            .map_err(|e| Error::Bind(addr, e))?;
        let address = listener.local_addr().map_err(|e| Error::Bind(addr, e))?;
        info!(%address, component = "sni", "listener established");
        Ok(SniListener {
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
        let SniListener {
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
                let session = pi.sessions.open(Entrypoint::Sni, remote);
                let span = info_span!("sni", id = session.id(), src = %remote);
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
        run_with_drain("sni".to_string(), drain, deadline, accept).await
    }

    async fn proxy(pi: &GatewayInputs, session: &TunnelSession, mut stream: TcpStream) -> Result<(), Error> {
        session.set_state(SessionState::Matching);
        let (m, prefix) = match Self::classify(pi, &mut stream).await {
            Ok(matched) => matched,
            Err(e) => {
                record_rejection(pi, Entrypoint::Sni, &e);
                return Err(e);
            }
        };
        let upstream = match dial_backend(pi, session, &m).await {
            Ok(s) => s,
            Err(e) => {
                record_rejection(pi, Entrypoint::Sni, &e);
                return Err(e);
            }
        };
        relay(pi, session, stream, upstream, &m, prefix).await
    }

    async fn classify(
        pi: &GatewayInputs,
        stream: &mut TcpStream,
    ) -> Result<(Match, BytesMut), Error> {
        let gw = &pi.cfg.gateway;
        let (sniff, buf) = sni::read_client_hello(stream, gw.max_client_hello, gw.match_timeout)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::TimedOut => Error::MatchTimeout,
                _ => Error::Io(e),
            })?;
        match sniff {
            Sniff::Sni(name) => Ok((pi.matcher.match_sni(&name)?, buf)),
            Sniff::NotTls { http: true } => {
                if let Err(e) = redirect(stream, gw.default_redirect.as_deref()).await {
                    warn!("failed to write redirect: {e}");
                }
                Err(Error::NotTls)
            }
            Sniff::NotTls { http: false } => Err(Error::NotTls),
            Sniff::NoSni => Err(Error::NoServerName),
            Sniff::Incomplete => Err(Error::ClientDisconnected),
            Sniff::Malformed => Err(Error::Malformed("invalid ClientHello".to_string())),
        }
    }
}

/// Answer a plaintext HTTP request on the TLS port with the configured redirect, or a 404.
async fn redirect<W: AsyncWrite + Unpin>(w: &mut W, location: Option<&str>) -> io::Result<()> {
    let response = match location {
        Some(location) => format!(
            "HTTP/1.1 308 Permanent Redirect\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        ),
        None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
    };
    w.write_all(response.as_bytes()).await?;
    w.shutdown().await
}
