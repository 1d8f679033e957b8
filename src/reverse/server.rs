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

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::config::Config;
use crate::drain::{DrainWatcher, run_with_drain};
use crate::proxy::{self, hints};
use crate::reverse::frame::{Accept, Frame, FrameCodec, Reject};
use crate::reverse::link::{Keepalive, LinkId, LinkTable, run_link};
use crate::reverse::Error;
use crate::socket;

#[derive(Clone)]
struct ServerInputs {
    cfg: Arc<Config>,
    links: LinkTable,
    sink: mpsc::Sender<Bytes>,
}

/// ReverseServer accepts links dialed by the tenant's reverse client, through the gateway, and
/// installs the tenant's address ranges over them.
pub struct ReverseServer {
    inputs: ServerInputs,
    listener: socket::Listener,
    address: SocketAddr,
    drain: DrainWatcher,
}

impl ReverseServer {
    /// Packets arriving over any link are sent to `sink`.
    pub async fn new(
        cfg: Arc<Config>,
        links: LinkTable,
        sink: mpsc::Sender<Bytes>,
        drain: DrainWatcher,
    ) -> Result<ReverseServer, Error> {
        let s = &cfg.reverse_server;
        if s.tenant.is_empty() {
            return Err(Error::Config("reverseServer.tenant must be set".to_string()));
        }
        let listener = socket::Listener::bind(s.listen_addr, cfg.socket)
            .await
            .map_err(|e| Error::Bind(s.listen_addr, e))?;
        let address = listener.local_addr().map_err(|e| Error::Bind(s.listen_addr, e))?;
        info!(%address, tenant = s.tenant, "reverse tunnel server listening");
        Ok(ReverseServer {
            inputs: ServerInputs { cfg, links, sink },
            listener,
            address,
            drain,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub async fn run(self) {
        let ReverseServer {
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
                tokio::spawn(
                    async move {
                        tokio::select! {
                            res = Self::serve(&inputs, stream) => match res {
                                Ok(()) => info!("link closed"),
                                Err(e) => warn!("link failed: {e}"),
                            },
                            _ = force_shutdown.changed() => debug!("link terminated by shutdown"),
                        }
                        drop(drain);
                    }
                    .instrument(info_span!("reverse_server", src = %remote)),
                );
            }
        };
        run_with_drain("reverse-server".to_string(), drain, deadline, accept).await
    }

    async fn serve(inputs: &ServerInputs, mut stream: TcpStream) -> Result<(), Error> {
        let s = &inputs.cfg.reverse_server;
        // The gateway may put a routing hint in front of the link.
        let mut buf = BytesMut::new();
        let stripped = hints::strip_forged(&mut stream, &mut buf, s.handshake_timeout)
            .await
            .map_err(|e| Error::Frame(e.to_string()))?;
        if stripped > 0 {
            trace!(stripped, "skipped routing hint");
        }
        let mut parts = FramedParts::new::<Frame>(stream, FrameCodec::new());
        parts.read_buf = buf;
        let mut framed = Framed::from_parts(parts);

        let (link, mut outbound) = Self::handshake(inputs, &mut framed).await?;
        let keepalive = Keepalive {
            interval: s.keepalive_interval,
            timeout: s.keepalive_timeout,
        };
        let res = run_link(framed, &mut outbound, &inputs.sink, keepalive).await;
        inputs.links.remove(&link);
        res
    }

    async fn handshake(
        inputs: &ServerInputs,
        framed: &mut Framed<TcpStream, FrameCodec>,
    ) -> Result<(LinkId, mpsc::Receiver<Bytes>), Error> {
        let s = &inputs.cfg.reverse_server;
        let hello = match tokio::time::timeout(s.handshake_timeout, framed.next()).await {
            Err(_) => return Err(Error::HandshakeTimeout),
            Ok(None) => return Err(Error::LinkClosed),
            Ok(Some(frame)) => match frame? {
                Frame::Hello(hello) => hello,
                other => return Err(Error::UnexpectedFrame(other.kind())),
            },
        };
        let installed = if hello.tenant != s.tenant {
            Err(Error::TenantMismatch {
                expected: s.tenant.clone(),
                got: hello.tenant,
            })
        } else {
            inputs.links.install(&hello.tenant, hello.ranges)
        };
        match installed {
            Ok((link, rx)) => {
                let accept = Frame::Accept(Accept {
                    ranges: s.ranges.clone(),
                });
                if let Err(e) = framed.send(accept).await {
                    inputs.links.remove(&link);
                    return Err(e);
                }
                Ok((link, rx))
            }
            Err(e) => {
                warn!("refusing link: {e}");
                let reject = Frame::Reject(Reject {
                    reason: e.to_string(),
                });
                if let Err(send) = framed.send(reject).await {
                    debug!("failed to send reject: {send}");
                }
                Err(e)
            }
        }
    }
}

/// Route packets from the local network stack onto the installed links.
pub async fn route_packets(links: LinkTable, mut packets: mpsc::Receiver<Bytes>) {
    while let Some(packet) = packets.recv().await {
        if let Err(e) = links.send_packet(packet) {
            trace!("dropping packet: {e}");
        }
    }
}
