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
use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::trace;

use crate::copy::{Direction, Transfer};
use crate::identifier::BackendClass;
use crate::proxy::metrics::{ListenerLabels, Metrics, TrafficLabels};

/// The listener (or local client) a session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Entrypoint {
    Sni,
    Connect,
    Legacy,
    Client,
}

impl fmt::Display for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entrypoint::Sni => "sni",
            Entrypoint::Connect => "connect",
            Entrypoint::Legacy => "legacy",
            Entrypoint::Client => "client",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Accepted,
    Matching,
    Validated,
    Dialing,
    Proxying,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTarget {
    pub tenant: String,
    pub class: BackendClass,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

/// TunnelSession is one client connection and, once matched, the backend it is paired with.
#[derive(Debug)]
pub struct TunnelSession {
    id: u64,
    entrypoint: Entrypoint,
    client: SocketAddr,
    opened: Instant,
    target: OnceLock<SessionTarget>,
    state: Mutex<SessionState>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    // Milliseconds after `opened`.
    last_activity: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: u64,
    pub entrypoint: Entrypoint,
    pub client: SocketAddr,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<SessionTarget>,
    pub age: Duration,
    /// Bytes received from the client.
    pub bytes_in: u64,
    /// Bytes sent to the client.
    pub bytes_out: u64,
}

impl TunnelSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn entrypoint(&self) -> Entrypoint {
        self.entrypoint
    }

    fn state_lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        *self.state_lock()
    }

    pub fn set_state(&self, state: SessionState) {
        let mut cur = self.state_lock();
        trace!(session = self.id, from = ?*cur, to = ?state, "session state");
        *cur = state;
    }

    /// Record the validated match. Only the first call has any effect.
    pub fn validated(&self, target: SessionTarget) {
        let _ = self.target.set(target);
        self.set_state(SessionState::Validated);
    }

    pub fn target(&self) -> Option<&SessionTarget> {
        self.target.get()
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity
            .store(self.opened.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            entrypoint: self.entrypoint,
            client: self.client,
            state: self.state(),
            target: self.target.get().cloned(),
            age: self.opened.elapsed(),
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
        }
    }
}

impl Transfer for TunnelSession {
    fn record(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Upstream => self.bytes_in.fetch_add(bytes, Ordering::Relaxed),
            Direction::Downstream => self.bytes_out.fetch_add(bytes, Ordering::Relaxed),
        };
        self.touch();
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.opened.elapsed().saturating_sub(last)
    }
}

/// SessionManager tracks every open session for the admin endpoint and the session metrics.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<u64, Arc<TunnelSession>>>>,
    next_id: Arc<AtomicU64>,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("open", &self.len())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        SessionManager {
            sessions: Default::default(),
            next_id: Arc::new(AtomicU64::new(1)),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<TunnelSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(&self, entrypoint: Entrypoint, client: SocketAddr) -> SessionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(TunnelSession {
            id,
            entrypoint,
            client,
            opened: Instant::now(),
            target: OnceLock::new(),
            state: Mutex::new(SessionState::Accepted),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            last_activity: AtomicU64::new(0),
        });
        self.lock().insert(id, session.clone());
        let labels = ListenerLabels { entrypoint };
        self.metrics.connections_opened.get_or_create(&labels).inc();
        self.metrics.active_sessions.get_or_create(&labels).inc();
        SessionGuard {
            session,
            manager: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.lock().values().map(|s| s.info()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn close(&self, session: &TunnelSession) {
        session.set_state(SessionState::Closed);
        self.lock().remove(&session.id);
        let labels = ListenerLabels {
            entrypoint: session.entrypoint,
        };
        self.metrics.connections_closed.get_or_create(&labels).inc();
        self.metrics.active_sessions.get_or_create(&labels).dec();
        if let Some(target) = session.target() {
            let traffic = TrafficLabels {
                entrypoint: session.entrypoint,
                tenant: target.tenant.clone(),
            };
            self.metrics
                .received_bytes
                .get_or_create(&traffic)
                .inc_by(session.bytes_in());
            self.metrics
                .sent_bytes
                .get_or_create(&traffic)
                .inc_by(session.bytes_out());
        }
    }
}

/// SessionGuard unregisters its session when dropped.
pub struct SessionGuard {
    session: Arc<TunnelSession>,
    manager: SessionManager,
}

impl Deref for SessionGuard {
    type Target = TunnelSession;

    fn deref(&self) -> &TunnelSession {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.close(&self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::registry::Registry;

    fn manager() -> SessionManager {
        let mut registry = Registry::default();
        SessionManager::new(Arc::new(Metrics::new(&mut registry)))
    }

    #[test]
    fn sessions_are_tracked_until_dropped() {
        let m = manager();
        let a = m.open(Entrypoint::Connect, "127.0.0.1:1000".parse().unwrap());
        let b = m.open(Entrypoint::Sni, "127.0.0.1:1001".parse().unwrap());
        assert_ne!(a.id(), b.id());
        assert_eq!(m.len(), 2);

        a.validated(SessionTarget {
            tenant: "tenant-a".to_string(),
            class: BackendClass::ApiServer,
            backend: "10.0.0.1:443".to_string(),
            identifier: None,
        });
        a.record(Direction::Upstream, 10);
        a.record(Direction::Downstream, 4);
        let info = &m.list()[0];
        assert_eq!(info.state, SessionState::Validated);
        assert_eq!((info.bytes_in, info.bytes_out), (10, 4));

        drop(a);
        assert_eq!(m.len(), 1);
        let labels = TrafficLabels {
            entrypoint: Entrypoint::Connect,
            tenant: "tenant-a".to_string(),
        };
        assert_eq!(m.metrics().received_bytes.get_or_create(&labels).get(), 10);
        drop(b);
        assert!(m.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_tracks_activity() {
        let m = manager();
        let s = m.open(Entrypoint::Legacy, "127.0.0.1:1000".parse().unwrap());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(s.idle_for() >= Duration::from_secs(5));
        s.record(Direction::Upstream, 1);
        assert!(s.idle_for() < Duration::from_secs(1));
    }
}
