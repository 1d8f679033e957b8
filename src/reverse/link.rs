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

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use ipnet::IpNet;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace};

use crate::reverse::frame::{Frame, FrameCodec};
use crate::reverse::{Error, check_overlap, destination_ip};

// Packets queued per link before new ones are dropped.
pub const LINK_QUEUE: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    pub interval: Duration,
    pub timeout: Duration,
}

struct Installed {
    id: u64,
    ranges: Vec<IpNet>,
    tx: mpsc::Sender<Bytes>,
}

#[derive(Default)]
struct Links {
    next_id: u64,
    by_tenant: HashMap<String, Installed>,
}

/// LinkTable holds the links the server has installed, and the address ranges routed over each.
#[derive(Clone)]
pub struct LinkTable {
    local: Arc<Vec<IpNet>>,
    links: Arc<Mutex<Links>>,
}

/// Identifies one installed link, so removing it never removes a newer link for the same tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkId {
    pub tenant: String,
    id: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LinkInfo {
    pub tenant: String,
    pub ranges: Vec<IpNet>,
}

impl LinkTable {
    /// `local` are the ranges on this side. No link may claim any part of them.
    pub fn new(local: Vec<IpNet>) -> Self {
        LinkTable {
            local: Arc::new(local),
            links: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate `ranges` and route them over a new link. A link already installed for `tenant` is
    /// replaced: its queue closes and its runner exits.
    pub fn install(
        &self,
        tenant: &str,
        ranges: Vec<IpNet>,
    ) -> Result<(LinkId, mpsc::Receiver<Bytes>), Error> {
        check_overlap(&self.local, &ranges)?;
        let mut links = self.lock();
        for (other, installed) in &links.by_tenant {
            if other != tenant {
                check_overlap(&installed.ranges, &ranges)?;
            }
        }
        links.next_id += 1;
        let id = links.next_id;
        let (tx, rx) = mpsc::channel(LINK_QUEUE);
        let replaced = links
            .by_tenant
            .insert(tenant.to_string(), Installed { id, ranges, tx })
            .is_some();
        info!(tenant, replaced, "link installed");
        Ok((
            LinkId {
                tenant: tenant.to_string(),
                id,
            },
            rx,
        ))
    }

    pub fn remove(&self, link: &LinkId) {
        let mut links = self.lock();
        if links.by_tenant.get(&link.tenant).is_some_and(|l| l.id == link.id) {
            links.by_tenant.remove(&link.tenant);
            info!(tenant = link.tenant, "link removed");
        }
    }

    /// The link whose most specific range contains `dst`.
    fn route(&self, dst: IpAddr) -> Option<mpsc::Sender<Bytes>> {
        let links = self.lock();
        links
            .by_tenant
            .values()
            .flat_map(|l| l.ranges.iter().map(move |r| (r, l)))
            .filter(|(r, _)| r.contains(&dst))
            .max_by_key(|(r, _)| r.prefix_len())
            .map(|(_, l)| l.tx.clone())
    }

    /// Send one IP packet over the link routing its destination.
    pub fn send_packet(&self, packet: Bytes) -> Result<(), Error> {
        let dst = destination_ip(&packet).ok_or(Error::InvalidPacket)?;
        let tx = self.route(dst).ok_or(Error::NoRoute(dst))?;
        tx.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => Error::LinkBusy,
            TrySendError::Closed(_) => Error::LinkClosed,
        })
    }

    pub fn list(&self) -> Vec<LinkInfo> {
        let mut out: Vec<_> = self
            .lock()
            .by_tenant
            .iter()
            .map(|(tenant, l)| LinkInfo {
                tenant: tenant.clone(),
                ranges: l.ranges.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        out
    }

    pub fn is_installed(&self, tenant: &str) -> bool {
        self.lock().by_tenant.contains_key(tenant)
    }
}

/// Carry packets over an established link until it fails, the peer goes quiet for longer than
/// the keepalive timeout, or `outbound` closes. Packets from the peer go to `inbound`.
pub async fn run_link<T>(
    framed: Framed<T, FrameCodec>,
    outbound: &mut mpsc::Receiver<Bytes>,
    inbound: &mpsc::Sender<Bytes>,
    keepalive: Keepalive,
) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = framed.split();
    let mut ticker = tokio::time::interval(keepalive.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();
    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame.ok_or(Error::LinkClosed)?? {
                    Frame::Packet(p) => {
                        last_seen = Instant::now();
                        trace!(len = p.len(), "packet from link");
                        if inbound.send(p).await.is_err() {
                            debug!("packet sink closed");
                            return Ok(());
                        }
                    }
                    Frame::Keepalive => last_seen = Instant::now(),
                    other => return Err(Error::UnexpectedFrame(other.kind())),
                }
            }
            packet = outbound.recv() => {
                let Some(packet) = packet else {
                    debug!("link queue closed");
                    return Ok(());
                };
                sink.send(Frame::Packet(packet)).await?;
            }
            _ = ticker.tick() => {
                if last_seen.elapsed() > keepalive.timeout {
                    return Err(Error::KeepaliveTimeout(keepalive.timeout));
                }
                sink.send(Frame::Keepalive).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    fn nets(s: &[&str]) -> Vec<IpNet> {
        s.iter().map(|n| n.parse().unwrap()).collect()
    }

    fn packet_to(ip: [u8; 4]) -> Bytes {
        let mut p = vec![0u8; 20];
        p[0] = 0x45;
        p[16..20].copy_from_slice(&ip);
        Bytes::from(p)
    }

    #[test]
    fn install_checks_overlap() {
        let table = LinkTable::new(nets(&["10.242.0.0/16"]));
        assert_matches!(
            table.install("tenant-b", nets(&["10.242.1.0/24"])),
            Err(Error::Overlap { .. })
        );
        let _b = table.install("tenant-b", nets(&["10.250.0.0/16"])).unwrap();
        assert_matches!(
            table.install("tenant-c", nets(&["10.250.8.0/24"])),
            Err(Error::Overlap { .. })
        );
        // The same tenant may claim its own ranges again.
        let _b2 = table.install("tenant-b", nets(&["10.250.0.0/16"])).unwrap();
        assert_eq!(table.list().len(), 1);
    }

    #[tokio::test]
    async fn routes_by_destination() {
        let table = LinkTable::new(vec![]);
        let (_, mut b) = table
            .install("tenant-b", nets(&["10.0.0.0/8", "10.250.0.0/16"]))
            .unwrap();
        let (_, mut c) = table.install("tenant-c", nets(&["192.168.0.0/16"])).unwrap();
        table.send_packet(packet_to([10, 250, 0, 5])).unwrap();
        table.send_packet(packet_to([192, 168, 3, 4])).unwrap();
        assert_eq!(
            destination_ip(&b.recv().await.unwrap()),
            Some("10.250.0.5".parse().unwrap())
        );
        assert_eq!(
            destination_ip(&c.recv().await.unwrap()),
            Some("192.168.3.4".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn reinstall_replaces_link() {
        let table = LinkTable::new(vec![]);
        let (first, mut first_rx) = table.install("tenant-b", nets(&["10.250.0.0/16"])).unwrap();
        let (second, mut second_rx) = table.install("tenant-b", nets(&["10.250.0.0/16"])).unwrap();
        // The old queue is closed.
        assert!(first_rx.recv().await.is_none());
        // Removing the stale link leaves the new one in place.
        table.remove(&first);
        assert!(table.is_installed("tenant-b"));
        table.send_packet(packet_to([10, 250, 1, 1])).unwrap();
        assert!(second_rx.recv().await.is_some());
        table.remove(&second);
        assert!(!table.is_installed("tenant-b"));
        assert_matches!(
            table.send_packet(packet_to([10, 250, 1, 1])),
            Err(Error::NoRoute(_))
        );
        assert_matches!(table.send_packet(Bytes::from_static(b"junk")), Err(Error::InvalidPacket));
    }

    #[tokio::test(start_paused = true)]
    async fn link_times_out_without_keepalives() {
        let (a, _b) = tokio::io::duplex(1024);
        let (_tx, mut outbound) = mpsc::channel(1);
        let (inbound, _rx) = mpsc::channel(1);
        let res = run_link(
            Framed::new(a, FrameCodec::new()),
            &mut outbound,
            &inbound,
            Keepalive {
                interval: Duration::from_secs(1),
                timeout: Duration::from_secs(3),
            },
        )
        .await;
        assert_matches!(res, Err(Error::KeepaliveTimeout(_)));
    }
}
