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

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::HeaderName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

use crate::client::connect_via_gateway;
use crate::config::Config;
use crate::drain::DrainWatcher;
use crate::identifier::{BackendClass, Destination, Validator};
use crate::reverse::frame::{Frame, FrameCodec, Hello};
use crate::reverse::link::{Keepalive, run_link};
use crate::reverse::{Error, check_overlap};

/// ReverseClient runs in the tenant network. It keeps a link open to its own tunnel server by
/// dialing out through the gateway, reconnecting whenever the link drops.
pub struct ReverseClient {
    cfg: Arc<Config>,
    destination: Destination,
    header: HeaderName,
    outbound: mpsc::Receiver<Bytes>,
    inbound: mpsc::Sender<Bytes>,
}

impl ReverseClient {
    /// Packets read from `outbound` are sent over the link; packets from the link go to `inbound`.
    pub fn new(
        cfg: Arc<Config>,
        outbound: mpsc::Receiver<Bytes>,
        inbound: mpsc::Sender<Bytes>,
    ) -> Result<ReverseClient, Error> {
        let c = &cfg.reverse_client;
        if c.tenant.is_empty() || c.gateway_addr.is_empty() {
            return Err(Error::Config(
                "reverseClient.tenant and reverseClient.gatewayAddr must be set".to_string(),
            ));
        }
        let class = BackendClass::TunnelServer { replica: c.replica };
        let destination = cfg.validator.destination(class, &c.tenant);
        Validator::new(&cfg.validator)
            .and_then(|v| v.validate(&destination.identifier))
            .map_err(|e| Error::Config(format!("own destination is not allowed: {e}")))?;
        let header = HeaderName::from_bytes(cfg.destination_header.as_bytes())
            .map_err(|e| Error::Config(format!("destination header: {e}")))?;
        Ok(ReverseClient {
            cfg,
            destination,
            header,
            outbound,
            inbound,
        })
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Keep the link up until a drain starts or the server refuses us.
    pub async fn run(mut self, drain: DrainWatcher) -> Result<(), Error> {
        let c = self.cfg.reverse_client.clone();
        let mut backoff = c.initial_backoff;
        let drained = drain.wait_for_drain();
        tokio::pin!(drained);
        loop {
            let mut established = false;
            let res = tokio::select! {
                res = self.connect_once(&mut established) => res,
                blocker = &mut drained => {
                    info!("reverse client drained");
                    drop(blocker);
                    return Ok(());
                }
            };
            match res {
                Ok(()) => info!("link closed"),
                Err(e) if e.is_fatal() => {
                    error!("giving up on link: {e}");
                    return Err(e);
                }
                Err(e) => warn!("link failed: {e}"),
            }
            if established {
                backoff = c.initial_backoff;
            }
            warn!("reconnecting in {backoff:?}");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                blocker = &mut drained => {
                    drop(blocker);
                    return Ok(());
                }
            }
            backoff = next_backoff(backoff, c.max_backoff);
        }
    }

    async fn connect_once(&mut self, established: &mut bool) -> Result<(), Error> {
        let c = &self.cfg.reverse_client;
        let tunnel = connect_via_gateway(
            &c.gateway_addr,
            &self.header,
            &self.destination,
            c.connect_timeout,
            &self.cfg.socket,
        )
        .await?;
        let mut framed = Framed::new(tunnel, FrameCodec::new());
        self.handshake(&mut framed).await?;
        *established = true;
        info!(identifier = self.destination.identifier, "link established");
        let keepalive = Keepalive {
            interval: c.keepalive_interval,
            timeout: c.keepalive_timeout,
        };
        run_link(framed, &mut self.outbound, &self.inbound, keepalive).await
    }

    async fn handshake<T>(&self, framed: &mut Framed<T, FrameCodec>) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let c = &self.cfg.reverse_client;
        framed
            .send(Frame::Hello(Hello {
                tenant: c.tenant.clone(),
                ranges: c.ranges.clone(),
            }))
            .await?;
        let reply = tokio::time::timeout(c.connect_timeout, framed.next())
            .await
            .map_err(|_| Error::HandshakeTimeout)?
            .ok_or(Error::LinkClosed)??;
        match reply {
            // Check the server's side too; either end refuses an overlap.
            Frame::Accept(accept) => check_overlap(&c.ranges, &accept.ranges),
            Frame::Reject(reject) => Err(Error::Rejected(reject.reason)),
            other => Err(Error::UnexpectedFrame(other.kind())),
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}
