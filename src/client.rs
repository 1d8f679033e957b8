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

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoff;
use bytes::Bytes;
use http::HeaderName;
use http_body_util::Empty;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{Config, SocketConfig};
use crate::copy::{self, CopyTimeouts};
use crate::drain::{DrainWatcher, run_with_drain};
use crate::identifier::{self, Destination, Validator};
use crate::proxy::session::{Entrypoint, SessionManager, SessionState, SessionTarget, TunnelSession};
use crate::proxy::{self, hints};
use crate::socket;
use crate::state::migration::ProtocolVersion;

const INITIAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind to address {0}: {1}")]
    Bind(SocketAddr, io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("own destination is not allowed: {0}")]
    Identifier(#[from] identifier::Error),

    #[error("gateway unreachable: {0}")]
    Connect(io::Error),

    #[error("http failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("gateway refused tunnel: {0}")]
    Refused(StatusCode),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("tunnel failed: {0}")]
    Tunnel(#[from] proxy::Error),
}

impl Error {
    /// Whether trying again later could succeed. A refusal on the request itself will not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connect(_) | Error::Http(_) | Error::Io(_) => true,
            Error::Refused(code) => matches!(
                *code,
                StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
            ),
            _ => false,
        }
    }
}

/// ProtocolSwitch holds the protocol new connections use. It only ever moves from legacy to
/// current.
#[derive(Clone, Debug)]
pub struct ProtocolSwitch(Arc<AtomicBool>);

impl ProtocolSwitch {
    pub fn new(protocol: ProtocolVersion) -> Self {
        ProtocolSwitch(Arc::new(AtomicBool::new(protocol == ProtocolVersion::Current)))
    }

    pub fn get(&self) -> ProtocolVersion {
        if self.0.load(Ordering::Acquire) {
            ProtocolVersion::Current
        } else {
            ProtocolVersion::Legacy
        }
    }

    /// Switch to the current protocol. Returns false if already switched.
    pub fn migrate(&self) -> bool {
        let switched = !self.0.swap(true, Ordering::AcqRel);
        if switched {
            info!("client migrated to the current protocol");
        }
        switched
    }
}

/// Open a tunnel to `destination` through the gateway's CONNECT listener.
pub async fn connect_via_gateway(
    gateway: &str,
    header: &HeaderName,
    destination: &Destination,
    timeout: Duration,
    socket_cfg: &SocketConfig,
) -> Result<TokioIo<Upgraded>, Error> {
    let stream = socket::dial(gateway, timeout, socket_cfg)
        .await
        .map_err(Error::Connect)?;
    let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
        .handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
        .await?;
    // Drive the connection; it finishes once the tunnel is handed over.
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            debug!("gateway connection failed: {e}");
        }
    });

    let request = Request::builder()
        .method(Method::CONNECT)
        .uri(destination.address.as_str())
        .header(header, destination.identifier.as_str())
        .body(Empty::<Bytes>::new())?;
    let response = tokio::time::timeout(timeout, sender.send_request(request))
        .await
        .map_err(|_| Error::Connect(io::Error::new(io::ErrorKind::TimedOut, "CONNECT timed out")))??;
    if response.status() != StatusCode::OK {
        return Err(Error::Refused(response.status()));
    }
    let upgraded = hyper::upgrade::on(response).await?;
    Ok(TokioIo::new(upgraded))
}

/// Connect to the gateway's legacy listener and announce `destination` in a PROXY header.
pub async fn connect_legacy(
    gateway: &str,
    source: SocketAddr,
    destination: SocketAddr,
    authority: &str,
    timeout: Duration,
    socket_cfg: &SocketConfig,
) -> Result<TcpStream, Error> {
    let mut stream = socket::dial(gateway, timeout, socket_cfg)
        .await
        .map_err(Error::Connect)?;
    let header = hints::encode(source, destination, authority)?;
    stream.write_all(&header).await?;
    Ok(stream)
}

/// Run `op` until it succeeds, fails permanently, or `max_elapsed` passes.
pub async fn with_retry<T, F, Fut>(max_elapsed: Duration, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let policy = ExponentialBackoff {
        initial_interval: INITIAL_RETRY_INTERVAL,
        max_interval: MAX_RETRY_INTERVAL,
        max_elapsed_time: Some(max_elapsed),
        ..Default::default()
    };
    backoff::future::retry_notify(
        policy,
        || {
            let attempt = op();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_transient() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |e, after: Duration| debug!("gateway connection failed, retrying in {after:?}: {e}"),
    )
    .await
}

#[derive(Clone)]
struct ClientInputs {
    cfg: Arc<Config>,
    switch: ProtocolSwitch,
    sessions: SessionManager,
    destination: Arc<Destination>,
    header: HeaderName,
}

/// TunnelClient runs next to tenant workloads and carries each local connection to this tenant's
/// own backend through the gateway.
pub struct TunnelClient {
    inputs: ClientInputs,
    listener: socket::Listener,
    address: SocketAddr,
    drain: DrainWatcher,
}

impl TunnelClient {
    pub async fn new(
        cfg: Arc<Config>,
        switch: ProtocolSwitch,
        sessions: SessionManager,
        drain: DrainWatcher,
    ) -> Result<TunnelClient, Error> {
        let c = &cfg.client;
        if c.tenant.is_empty() {
            return Err(Error::Config("client.tenant must be set".to_string()));
        }
        if c.gateway_addr.is_empty() {
            return Err(Error::Config("client.gatewayAddr must be set".to_string()));
        }
        // Derived from our own tenant, never from a caller. Checking it against the gateway's
        // patterns catches a misconfigured suffix here rather than as a 403 later.
        let destination = cfg.validator.destination(c.class, &c.tenant);
        Validator::new(&cfg.validator)?.validate(&destination.identifier)?;
        let header = HeaderName::from_bytes(cfg.destination_header.as_bytes())
            .map_err(|e| Error::Config(format!("destination header: {e}")))?;

        let listener = socket::Listener::bind(c.listen_addr, cfg.socket)
            .await
            .map_err(|e| Error::Bind(c.listen_addr, e))?;
        let address = listener.local_addr().map_err(|e| Error::Bind(c.listen_addr, e))?;
        info!(%address, identifier = destination.identifier, "client listener established");
        Ok(TunnelClient {
            inputs: ClientInputs {
                cfg,
                switch,
                sessions,
                destination: Arc::new(destination),
                header,
            },
            listener,
            address,
            drain,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn destination(&self) -> &Destination {
        &self.inputs.destination
    }

    pub async fn run(self) {
        let TunnelClient {
            inputs,
            listener,
            drain,
            ..
        } = self;
        let deadline = inputs.cfg.termination_grace_period;
        let accept = move |drain: DrainWatcher, force_shutdown: watch::Receiver<()>| async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        if proxy::is_runtime_shutdown(&e) {
                            return;
                        }
                        error!("failed to accept connection: {e}");
                        continue;
                    }
                };
                let inputs = inputs.clone();
                let drain = drain.clone();
                let mut force_shutdown = force_shutdown.clone();
                let session = inputs.sessions.open(Entrypoint::Client, remote);
                let span = info_span!("client", id = session.id(), src = %remote);
                tokio::spawn(
                    async move {
                        let res = tokio::select! {
                            res = Self::proxy(&inputs, &session, stream) => res,
                            _ = force_shutdown.changed() => Err(Error::Tunnel(proxy::Error::Terminated)),
                        };
                        match res {
                            Ok(()) => info!(
                                bytes_in = session.bytes_in(),
                                bytes_out = session.bytes_out(),
                                "complete"
                            ),
                            Err(e) => warn!("tunnel failed: {e}"),
                        }
                        drop(drain);
                    }
                    .instrument(span),
                );
            }
        };
        run_with_drain("client".to_string(), drain, deadline, accept).await
    }

    async fn proxy(inputs: &ClientInputs, session: &TunnelSession, stream: TcpStream) -> Result<(), Error> {
        let cfg = &inputs.cfg;
        let c = &cfg.client;
        let timeouts = CopyTimeouts {
            idle: c.idle_timeout,
            linger: c.linger_timeout,
        };
        let dest = &inputs.destination;
        // Read once. A switch mid-session does not move an open connection.
        let protocol = inputs.switch.get();
        session.set_state(SessionState::Dialing);
        match protocol {
            ProtocolVersion::Current => {
                let upstream = with_retry(c.max_retry_elapsed, || {
                    connect_via_gateway(
                        &c.gateway_addr,
                        &inputs.header,
                        dest,
                        c.connect_timeout,
                        &cfg.socket,
                    )
                })
                .await?;
                session.validated(target(dest, &c.gateway_addr));
                session.set_state(SessionState::Proxying);
                copy::copy_bidirectional(stream, upstream, session, timeouts).await?;
            }
            ProtocolVersion::Legacy => {
                let gateway = c.gateway_legacy_addr.as_deref().ok_or_else(|| {
                    Error::Config("client.gatewayLegacyAddr must be set for the legacy protocol".to_string())
                })?;
                let backend = c.legacy_destination.ok_or_else(|| {
                    Error::Config("client.legacyDestination must be set for the legacy protocol".to_string())
                })?;
                let upstream = with_retry(c.max_retry_elapsed, || {
                    connect_legacy(
                        gateway,
                        session.client(),
                        backend,
                        &dest.identifier,
                        c.connect_timeout,
                        &cfg.socket,
                    )
                })
                .await?;
                session.validated(target(dest, gateway));
                session.set_state(SessionState::Proxying);
                copy::copy_bidirectional(stream, upstream, session, timeouts).await?;
            }
        }
        Ok(())
    }
}

fn target(dest: &Destination, gateway: &str) -> SessionTarget {
    SessionTarget {
        tenant: dest.tenant.clone(),
        class: dest.class,
        backend: gateway.to_string(),
        identifier: Some(dest.identifier.clone()),
    }
}
