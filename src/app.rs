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

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::Context;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use prometheus_client::registry::Registry;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{Instrument, error, info, warn};

use crate::admin::Components;
use crate::client::{ProtocolSwitch, TunnelClient};
use crate::config::Config;
use crate::drain::{DrainMode, DrainTrigger};
use crate::identifier::Validator;
use crate::proxy::Gateway;
use crate::proxy::metrics::Metrics;
use crate::proxy::session::SessionManager;
use crate::reverse::client::ReverseClient;
use crate::reverse::link::LinkTable;
use crate::reverse::server::{ReverseServer, route_packets};
use crate::reverse::PacketBridge;
use crate::state::{GatewayState, LocalStateClient};
use crate::{admin, drain, metrics, proxy, readiness, signal, stats};

// Packets buffered between the packet bridge and the links.
const PACKET_QUEUE: usize = 1024;

/// Role selects which component this process runs next to the shared admin, stats and readiness
/// servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Gateway,
    Client,
    ReverseClient,
    ReverseServer,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Gateway => "gateway",
            Role::Client => "client",
            Role::ReverseClient => "reverse-client",
            Role::ReverseServer => "reverse-server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "gateway" => Role::Gateway,
            "client" => Role::Client,
            "reverse-client" => Role::ReverseClient,
            "reverse-server" => Role::ReverseServer,
            _ => anyhow::bail!("unknown role {s}"),
        })
    }
}

pub async fn build(config: Arc<Config>, role: Role) -> anyhow::Result<Bound> {
    let mut registry = Registry::default();
    let sub_registry = metrics::sub_registry(&mut registry);
    metrics::register_build_info(sub_registry, role.name());
    let sessions = SessionManager::new(Arc::new(Metrics::new(sub_registry)));

    let shutdown = signal::Shutdown::new();
    // Anything that wants time to finish on shutdown holds a watcher; the drain completes once
    // every watcher is released, or the grace period runs out.
    let (drain_tx, drain_rx) = drain::new();

    let ready = readiness::Ready::new();
    let component_task = ready.register_task(role.name());

    let mut components = Components {
        sessions: Some(sessions.clone()),
        ..Default::default()
    };
    let mut tasks: Vec<BoxFuture<'static, ()>> = Vec::new();
    let mut addresses = Addresses::default();

    match role {
        Role::Gateway => {
            let state = GatewayState::new();
            match config.local_state.clone() {
                Some(source) => {
                    let local = LocalStateClient {
                        source,
                        state: state.clone(),
                        poll_interval: config.gateway.reload_interval,
                    };
                    let modified = local.load().await.context("initial local state")?;
                    let drain = drain_rx.clone();
                    tokio::spawn(local.run(modified, drain).in_current_span());
                }
                None => warn!("no local state configured, starting with no routes"),
            }
            let validator = Arc::new(Validator::new(&config.validator)?);
            let gateway = Gateway::new(
                config.clone(),
                state.clone(),
                validator,
                sessions,
                drain_rx.clone(),
            )
            .await?;
            addresses.gateway = Some(gateway.addresses());
            components.gateway = Some(state);
            tasks.push(gateway.run().boxed());
        }
        Role::Client => {
            let switch = ProtocolSwitch::new(config.client.protocol);
            let client =
                TunnelClient::new(config.clone(), switch.clone(), sessions, drain_rx.clone())
                    .await?;
            addresses.client = Some(client.address());
            components.client_protocol = Some(switch);
            tasks.push(client.run().boxed());
        }
        Role::ReverseClient => {
            let c = &config.reverse_client;
            let bridge = PacketBridge::bind(c.packet_addr, c.packet_peer).await?;
            addresses.packets = Some(bridge.local_addr()?);
            let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(PACKET_QUEUE);
            let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(PACKET_QUEUE);
            let client = ReverseClient::new(config.clone(), outbound_rx, inbound_tx)?;
            info!(identifier = client.destination().identifier, "reverse tunnel client starting");
            tasks.push(bridge.run(outbound_tx, inbound_rx).boxed());
            let drain = drain_rx.clone();
            let trigger = shutdown.trigger();
            tasks.push(
                async move {
                    if let Err(e) = client.run(drain).await {
                        error!("reverse tunnel client stopped: {e}");
                        trigger.shutdown_now().await;
                    }
                }
                .boxed(),
            );
        }
        Role::ReverseServer => {
            let s = &config.reverse_server;
            let links = LinkTable::new(s.ranges.clone());
            let bridge = PacketBridge::bind(s.packet_addr, s.packet_peer).await?;
            addresses.packets = Some(bridge.local_addr()?);
            // Packets arriving over links go out the bridge; packets read from the bridge are
            // routed to a link by destination.
            let (sink_tx, sink_rx) = mpsc::channel::<Bytes>(PACKET_QUEUE);
            let (routed_tx, routed_rx) = mpsc::channel::<Bytes>(PACKET_QUEUE);
            let server =
                ReverseServer::new(config.clone(), links.clone(), sink_tx, drain_rx.clone())
                    .await?;
            addresses.reverse_server = Some(server.address());
            components.links = Some(links.clone());
            tasks.push(bridge.run(routed_tx, sink_rx).boxed());
            tasks.push(route_packets(links, routed_rx).boxed());
            tasks.push(server.run().boxed());
        }
    }

    let admin_server = admin::Service::new(
        config.clone(),
        components.clone(),
        shutdown.trigger(),
        drain_rx.clone(),
    )
    .await
    .context("admin server starts")?;
    let stats_server = stats::Service::new(
        config.stats_addr,
        registry,
        shutdown.trigger(),
        drain_rx.clone(),
    )
    .await
    .context("stats server starts")?;
    let readiness_server = readiness::Service::new(
        config.readiness_addr,
        ready,
        shutdown.trigger(),
        drain_rx.clone(),
    )
    .await
    .context("readiness server starts")?;
    addresses.admin = admin_server.address();
    addresses.stats = stats_server.address();
    addresses.readiness = readiness_server.address();
    drop(drain_rx);

    admin_server.spawn();
    stats_server.spawn();
    readiness_server.spawn();

    let worker_threads = config.num_worker_threads;
    let span = tracing::Span::current();
    thread::spawn(move || {
        let _span = span.enter();
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name_fn(|| {
                static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
                let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
                format!("tunnelgate-worker-{id}")
            })
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("failed to start worker runtime: {e}");
                return;
            }
        };
        runtime.block_on(
            async move {
                futures::future::join_all(tasks).await;
            }
            .in_current_span(),
        );
    });
    // Listeners are bound, so traffic can be served.
    drop(component_task);
    info!(role = role.name(), "started");

    Ok(Bound {
        addresses,
        components,
        shutdown,
        config,
        drain_tx,
    })
}

/// Where everything ended up listening. Ports of 0 in the config are resolved here.
#[derive(Debug, Clone, Copy)]
pub struct Addresses {
    pub admin: SocketAddr,
    pub stats: SocketAddr,
    pub readiness: SocketAddr,
    pub gateway: Option<proxy::Addresses>,
    pub client: Option<SocketAddr>,
    pub reverse_server: Option<SocketAddr>,
    pub packets: Option<SocketAddr>,
}

impl Default for Addresses {
    fn default() -> Self {
        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
        Addresses {
            admin: unspecified,
            stats: unspecified,
            readiness: unspecified,
            gateway: None,
            client: None,
            reverse_server: None,
            packets: None,
        }
    }
}

pub struct Bound {
    pub addresses: Addresses,
    pub components: Components,
    pub shutdown: signal::Shutdown,
    config: Arc<Config>,
    drain_tx: DrainTrigger,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        // Wait for a signal to shutdown from explicit admin shutdown or signal
        self.shutdown.wait().await;

        let grace = self.config.termination_grace_period;
        match time::timeout(grace, self.drain_tx.start_drain_and_wait(DrainMode::Graceful)).await {
            Ok(()) => info!("shutdown completed gracefully"),
            Err(_) => warn!("graceful shutdown did not complete in {grace:?}, terminating now"),
        }
        Ok(())
    }
}
