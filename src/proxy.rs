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
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use http::HeaderName;
use hyper::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{Instrument, debug, info, warn};

use crate::config::Config;
use crate::copy::{self, CopyTimeouts, Direction, Transfer};
use crate::drain::DrainWatcher;
use crate::identifier;
use crate::proxy::connect::ConnectListener;
use crate::proxy::legacy::LegacyListener;
use crate::proxy::matcher::{Match, Matcher};
use crate::proxy::metrics::{ListenerLabels, Metrics, RejectReason, RejectionLabels};
use crate::proxy::passthrough::SniListener;
use crate::proxy::session::{Entrypoint, SessionManager, SessionState, TunnelSession};
use crate::socket;
use crate::state::GatewayState;
use crate::state::routes::RouteKey;

mod connect;
pub mod hints;
mod legacy;
pub mod matcher;
pub mod metrics;
mod passthrough;
pub mod session;
pub mod sni;

/// Gateway runs the three shared-ingress listeners over one route table.
pub struct Gateway {
    sni: SniListener,
    connect: ConnectListener,
    legacy: Option<LegacyListener>,
}

#[derive(Clone)]
pub(crate) struct GatewayInputs {
    cfg: Arc<Config>,
    state: GatewayState,
    matcher: Arc<Matcher>,
    sessions: SessionManager,
    destination_header: HeaderName,
}

impl GatewayInputs {
    pub fn new(
        cfg: Arc<Config>,
        state: GatewayState,
        validator: Arc<identifier::Validator>,
        sessions: SessionManager,
    ) -> Result<Self, Error> {
        let destination_header = HeaderName::from_bytes(cfg.destination_header.as_bytes())
            .map_err(|e| Error::Malformed(format!("destination header: {e}")))?;
        let matcher = Matcher::new(validator, cfg.validator.clone(), state.clone());
        Ok(GatewayInputs {
            cfg,
            state,
            matcher: Arc::new(matcher),
            sessions,
            destination_header,
        })
    }

    fn metrics(&self) -> &Metrics {
        self.sessions.metrics()
    }

    fn copy_timeouts(&self) -> CopyTimeouts {
        CopyTimeouts {
            idle: self.cfg.gateway.idle_timeout,
            linger: self.cfg.gateway.linger_timeout,
        }
    }
}

impl Gateway {
    pub async fn new(
        cfg: Arc<Config>,
        state: GatewayState,
        validator: Arc<identifier::Validator>,
        sessions: SessionManager,
        drain: DrainWatcher,
    ) -> Result<Gateway, Error> {
        let pi = GatewayInputs::new(cfg, state, validator, sessions)?;
        Self::from_inputs(pi, drain).await
    }

    pub(crate) async fn from_inputs(pi: GatewayInputs, drain: DrainWatcher) -> Result<Self, Error> {
        // Bind everything up front so a bad address blocks startup.
        let sni = SniListener::new(pi.clone(), drain.clone()).await?;
        let connect = ConnectListener::new(pi.clone(), drain.clone()).await?;
        // A port disabled at startup is never bound. Disabling it later refuses new connections.
        let legacy = if pi.state.migration.snapshot().legacy_port_enabled() {
            Some(LegacyListener::new(pi, drain).await?)
        } else {
            info!("legacy port disabled, not listening");
            None
        };
        Ok(Gateway {
            sni,
            connect,
            legacy,
        })
    }

    pub fn addresses(&self) -> Addresses {
        Addresses {
            sni: self.sni.address(),
            connect: self.connect.address(),
            legacy: self.legacy.as_ref().map(LegacyListener::address),
        }
    }

    pub async fn run(self) {
        let mut tasks = vec![
            tokio::spawn(self.sni.run().in_current_span()),
            tokio::spawn(self.connect.run().in_current_span()),
        ];
        if let Some(legacy) = self.legacy {
            tasks.push(tokio::spawn(legacy.run().in_current_span()));
        }
        futures::future::join_all(tasks).await;
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Addresses {
    pub sni: SocketAddr,
    pub connect: SocketAddr,
    pub legacy: Option<SocketAddr>,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind to address {0}: {1}")]
    Bind(SocketAddr, io::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("untrusted destination \"{0}\": {1}")]
    Untrusted(String, identifier::Error),

    #[error("no route for server name \"{0}\"")]
    UnknownHostname(String),

    #[error("no route for original destination {0}")]
    UnknownAddress(SocketAddr),

    #[error("destination unavailable: no route for {0}")]
    Unavailable(RouteKey),

    #[error("tenant {0} has migrated off the legacy port")]
    TenantMigrated(String),

    #[error("legacy port is disabled")]
    LegacyPortDisabled,

    #[error("backend {0} unreachable: {1}")]
    BackendUnreachable(String, io::Error),

    #[error("client did not identify its destination in time")]
    MatchTimeout,

    #[error("no traffic for {0:?}")]
    IdleTimeout(Duration),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("backend disconnected")]
    BackendDisconnected,

    #[error("http failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid PROXY header: {0}")]
    ProxyHeader(String),

    #[error("not a TLS ClientHello")]
    NotTls,

    #[error("ClientHello has no server name")]
    NoServerName,

    #[error("connection terminated by shutdown")]
    Terminated,
}

impl Error {
    pub fn reason(&self) -> RejectReason {
        match self {
            Error::Malformed(_) | Error::ProxyHeader(_) | Error::NoServerName => {
                RejectReason::malformed
            }
            Error::Untrusted(..) => RejectReason::untrusted,
            Error::UnknownHostname(_) => RejectReason::unknown_hostname,
            Error::UnknownAddress(_) => RejectReason::unknown_address,
            Error::Unavailable(_) => RejectReason::unavailable,
            Error::TenantMigrated(_) => RejectReason::migrated,
            Error::LegacyPortDisabled => RejectReason::legacy_disabled,
            Error::BackendUnreachable(..) => RejectReason::backend_unreachable,
            Error::MatchTimeout | Error::IdleTimeout(_) => RejectReason::timeout,
            Error::NotTls => RejectReason::not_tls,
            Error::Bind(..)
            | Error::Io(_)
            | Error::ClientDisconnected
            | Error::BackendDisconnected
            | Error::Http(_)
            | Error::Terminated => RejectReason::io,
        }
    }

    /// The status a CONNECT client sees when its request is refused.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Malformed(_) => StatusCode::BAD_REQUEST,
            Error::Untrusted(..) => StatusCode::FORBIDDEN,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::BackendUnreachable(..) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub fn is_runtime_shutdown(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::Other
        && e.to_string() == "A Tokio 1.x context was found, but it is being shutdown."
}

/// Count a connection refused before proxying, and log it. Identifiers that fail validation are
/// logged for audit.
fn record_rejection(pi: &GatewayInputs, entrypoint: Entrypoint, err: &Error) {
    match err {
        Error::Untrusted(..) => warn!(audit = true, %entrypoint, "rejected: {err}"),
        _ => info!(%entrypoint, "rejected: {err}"),
    }
    pi.metrics()
        .rejections
        .get_or_create(&RejectionLabels {
            entrypoint,
            reason: err.reason(),
        })
        .inc();
}

fn log_complete(session: &TunnelSession, res: &Result<(), Error>) {
    let info = session.info();
    match res {
        Ok(()) => info!(
            bytes_in = info.bytes_in,
            bytes_out = info.bytes_out,
            dur = ?info.age,
            "complete"
        ),
        Err(e) => info!(
            bytes_in = info.bytes_in,
            bytes_out = info.bytes_out,
            dur = ?info.age,
            "closed: {e}"
        ),
    }
}

/// Open a fresh connection to the matched backend. Backend connections are never shared.
async fn dial_backend(pi: &GatewayInputs, session: &TunnelSession, m: &Match) -> Result<TcpStream, Error> {
    session.validated(m.target());
    session.set_state(SessionState::Dialing);
    let target = m.backend.to_string();
    let res = match m.backend.socket_addr() {
        Some(addr) => socket::dial(addr, pi.cfg.gateway.dial_timeout, &pi.cfg.socket).await,
        None => socket::dial(target.as_str(), pi.cfg.gateway.dial_timeout, &pi.cfg.socket).await,
    };
    let stream = res.map_err(|e| Error::BackendUnreachable(target, e))?;
    debug!(backend = %m.backend, tenant = m.tenant, "connected to backend");
    Ok(stream)
}

/// Relay an admitted connection. `prefix` holds client bytes read while matching; they reach the
/// backend first, after the routing hint when the backend expects one.
async fn relay<S>(
    pi: &GatewayInputs,
    session: &TunnelSession,
    mut downstream: S,
    mut upstream: TcpStream,
    m: &Match,
    mut prefix: BytesMut,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if pi.cfg.gateway.proxy_protocol.enabled_for(m.class) {
        let stripped =
            hints::strip_forged(&mut downstream, &mut prefix, pi.cfg.gateway.match_timeout).await?;
        if stripped > 0 {
            warn!(stripped, "removed client supplied PROXY header");
            pi.metrics()
                .stripped_hints
                .get_or_create(&ListenerLabels {
                    entrypoint: session.entrypoint(),
                })
                .inc();
        }
        let header = hints::encode(session.client(), upstream.peer_addr()?, &m.authority)?;
        upstream.write_all(&header).await?;
    }
    if !prefix.is_empty() {
        upstream.write_all(&prefix).await?;
        session.record(Direction::Upstream, prefix.len() as u64);
    }
    session.set_state(SessionState::Proxying);
    copy::copy_bidirectional(downstream, upstream, session, pi.copy_timeouts()).await
}
