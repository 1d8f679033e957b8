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

//! The reverse tunnel: the tenant network dials out through the gateway to its control plane's
//! tunnel server, which then uses the link to reach into the tenant network.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use ipnet::IpNet;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub mod client;
pub mod frame;
pub mod link;
pub mod server;

// Large enough for any IP packet.
const MAX_PACKET: usize = 65535;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind to address {0}: {1}")]
    Bind(SocketAddr, io::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid frame: {0}")]
    Frame(String),

    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),

    #[error("address range {theirs} overlaps {ours}")]
    Overlap { ours: IpNet, theirs: IpNet },

    #[error("peer is tenant {got}, expected {expected}")]
    TenantMismatch { expected: String, got: String },

    #[error("link rejected by server: {0}")]
    Rejected(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("no frames for {0:?}")]
    KeepaliveTimeout(std::time::Duration),

    #[error("no link for {0}")]
    NoRoute(IpAddr),

    #[error("not an IP packet")]
    InvalidPacket,

    #[error("link is busy")]
    LinkBusy,

    #[error("link closed")]
    LinkClosed,

    #[error("gateway: {0}")]
    Gateway(#[from] crate::client::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Errors that reconnecting cannot fix.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Rejected(_)
            | Error::Overlap { .. }
            | Error::TenantMismatch { .. }
            | Error::Config(_) => true,
            Error::Gateway(e) => !e.is_transient(),
            _ => false,
        }
    }
}

fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Refuse any range in `theirs` that shares an address with a range in `ours`.
pub fn check_overlap(ours: &[IpNet], theirs: &[IpNet]) -> Result<(), Error> {
    for t in theirs {
        if let Some(o) = ours.iter().find(|o| overlaps(o, t)) {
            return Err(Error::Overlap {
                ours: *o,
                theirs: *t,
            });
        }
    }
    Ok(())
}

/// The destination address of a raw IPv4 or IPv6 packet.
pub fn destination_ip(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let b: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(b)))
        }
        6 if packet.len() >= 40 => {
            let b: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(b)))
        }
        _ => None,
    }
}

/// PacketBridge exchanges raw IP packets with the local network stack over UDP, one packet per
/// datagram. Until a peer is configured or heard from, packets from the link are dropped.
pub struct PacketBridge {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl PacketBridge {
    pub async fn bind(addr: SocketAddr, peer: Option<SocketAddr>) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| Error::Bind(addr, e))?;
        Ok(PacketBridge { socket, peer })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Forward datagrams to `to_link` and packets from `from_link` back out, until either
    /// channel closes.
    pub async fn run(self, to_link: mpsc::Sender<Bytes>, mut from_link: mpsc::Receiver<Bytes>) {
        let PacketBridge { socket, mut peer } = self;
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            tokio::select! {
                res = socket.recv_from(&mut buf) => match res {
                    Ok((n, from)) => {
                        if peer.is_none() {
                            debug!(%from, "learned packet peer");
                            peer = Some(from);
                        }
                        if to_link.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("packet receive failed: {e}"),
                },
                packet = from_link.recv() => {
                    let Some(packet) = packet else {
                        return;
                    };
                    match peer {
                        Some(peer) => {
                            if let Err(e) = socket.send_to(&packet, peer).await {
                                warn!(%peer, "packet send failed: {e}");
                            }
                        }
                        None => trace!(len = packet.len(), "no packet peer, dropping"),
                    }
                }
            }
        }
    }
}
