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

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info};

use crate::identifier::BackendClass;
use crate::state::Error;

/// BackendAddress is where the gateway dials a backend. The host may be a name or an IP literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddress {
    pub host: String,
    pub port: u16,
}

impl BackendAddress {
    /// The address as a socket address, if the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        host.parse()
            .ok()
            .map(|ip| crate::socket::to_canonical(SocketAddr::new(ip, self.port)))
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for BackendAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(BackendAddress {
                host: addr.ip().to_string(),
                port: addr.port(),
            });
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Parse(format!("backend address {s:?} has no port")))?;
        let port = port
            .parse()
            .map_err(|_| Error::Parse(format!("backend address {s:?} has an invalid port")))?;
        if host.is_empty() || host.contains(':') {
            return Err(Error::Parse(format!("backend address {s:?} has an invalid host")));
        }
        Ok(BackendAddress {
            host: host.to_string(),
            port,
        })
    }
}

impl Serialize for BackendAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BackendAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RouteKey {
    pub tenant: String,
    pub class: BackendClass,
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.class)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub tenant: String,
    pub class: BackendClass,
    pub address: BackendAddress,
    /// TLS server names that select this route on the SNI listener.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,
}

impl RouteEntry {
    pub fn key(&self) -> RouteKey {
        RouteKey {
            tenant: self.tenant.clone(),
            class: self.class,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteUpdate {
    Upsert(RouteEntry),
    Delete { tenant: String, class: BackendClass },
    DeleteTenant(String),
}

fn normalize_hostname(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// An immutable view of every route. Readers hold one of these for the whole lookup.
#[derive(Debug, Default, Serialize)]
pub struct RouteSnapshot {
    version: u64,
    routes: BTreeMap<RouteKey, Arc<RouteEntry>>,
    #[serde(skip)]
    by_hostname: HashMap<String, Arc<RouteEntry>>,
    #[serde(skip)]
    by_address: HashMap<SocketAddr, Arc<RouteEntry>>,
}

impl RouteSnapshot {
    fn build(version: u64, routes: BTreeMap<RouteKey, Arc<RouteEntry>>) -> Result<Self, Error> {
        let mut by_hostname: HashMap<String, Arc<RouteEntry>> = HashMap::new();
        let mut by_address: HashMap<SocketAddr, Arc<RouteEntry>> = HashMap::new();
        for entry in routes.values() {
            for name in &entry.hostnames {
                let name = normalize_hostname(name);
                if let Some(existing) = by_hostname.get(&name) {
                    if existing.tenant != entry.tenant {
                        return Err(Error::Conflict(format!(
                            "hostname {name} claimed by {} and {}",
                            existing.key(),
                            entry.key()
                        )));
                    }
                }
                by_hostname.insert(name, entry.clone());
            }
            if let Some(addr) = entry.address.socket_addr() {
                if let Some(existing) = by_address.get(&addr) {
                    if existing.tenant != entry.tenant {
                        return Err(Error::Conflict(format!(
                            "address {addr} claimed by {} and {}",
                            existing.key(),
                            entry.key()
                        )));
                    }
                }
                by_address.insert(addr, entry.clone());
            }
        }
        Ok(RouteSnapshot {
            version,
            routes,
            by_hostname,
            by_address,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn resolve(&self, tenant: &str, class: BackendClass) -> Option<Arc<RouteEntry>> {
        self.routes
            .get(&RouteKey {
                tenant: tenant.to_string(),
                class,
            })
            .cloned()
    }

    pub fn resolve_hostname(&self, name: &str) -> Option<Arc<RouteEntry>> {
        self.by_hostname.get(&normalize_hostname(name)).cloned()
    }

    pub fn resolve_address(&self, addr: SocketAddr) -> Option<Arc<RouteEntry>> {
        self.by_address
            .get(&crate::socket::to_canonical(addr))
            .cloned()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<RouteEntry>> {
        self.routes.values()
    }
}

/// RouteTable maps (tenant, class) to a backend. Updates replace the whole snapshot, so a lookup
/// never observes a partially applied batch.
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    current: Arc<ArcSwap<RouteSnapshot>>,
    // Serializes writers; readers never take it.
    writer: Arc<std::sync::Mutex<()>>,
    version: Arc<AtomicU64>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.current.load_full()
    }

    pub fn resolve(&self, tenant: &str, class: BackendClass) -> Option<Arc<RouteEntry>> {
        self.current.load().resolve(tenant, class)
    }

    /// Apply a batch of updates. Either every update lands in the new snapshot or none do.
    pub fn apply(&self, updates: impl IntoIterator<Item = RouteUpdate>) -> Result<u64, Error> {
        let _guard = self.writer.lock().map_err(|_| Error::Poisoned)?;
        let mut routes = self.current.load().routes.clone();
        let mut changes = 0;
        for update in updates {
            changes += 1;
            match update {
                RouteUpdate::Upsert(entry) => {
                    debug!(route=%entry.key(), address=%entry.address, "upsert route");
                    routes.insert(entry.key(), Arc::new(entry));
                }
                RouteUpdate::Delete { tenant, class } => {
                    debug!(%tenant, %class, "delete route");
                    routes.remove(&RouteKey { tenant, class });
                }
                RouteUpdate::DeleteTenant(tenant) => {
                    debug!(%tenant, "delete tenant routes");
                    routes.retain(|k, _| k.tenant != tenant);
                }
            }
        }
        self.swap(routes, changes)
    }

    /// Replace every route at once.
    pub fn replace(&self, entries: impl IntoIterator<Item = RouteEntry>) -> Result<u64, Error> {
        let _guard = self.writer.lock().map_err(|_| Error::Poisoned)?;
        let routes: BTreeMap<_, _> = entries
            .into_iter()
            .map(|e| (e.key(), Arc::new(e)))
            .collect();
        let changes = routes.len();
        self.swap(routes, changes)
    }

    /// Validate a full replacement without publishing it.
    pub fn check(entries: &[RouteEntry]) -> Result<(), Error> {
        let routes = entries
            .iter()
            .map(|e| (e.key(), Arc::new(e.clone())))
            .collect();
        RouteSnapshot::build(0, routes).map(|_| ())
    }

    fn swap(&self, routes: BTreeMap<RouteKey, Arc<RouteEntry>>, changes: usize) -> Result<u64, Error> {
        let version = self.version.load(Ordering::Relaxed) + 1;
        let snapshot = RouteSnapshot::build(version, routes)?;
        let count = snapshot.len();
        self.current.store(Arc::new(snapshot));
        self.version.store(version, Ordering::Relaxed);
        info!(version, routes = count, changes, "route table updated");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    fn entry(tenant: &str, class: BackendClass, address: &str) -> RouteEntry {
        RouteEntry {
            tenant: tenant.to_string(),
            class,
            address: address.parse().unwrap(),
            hostnames: vec![],
        }
    }

    #[test]
    fn resolve_after_upsert() {
        let table = RouteTable::new();
        assert!(table.resolve("a", BackendClass::ApiServer).is_none());
        table
            .apply([RouteUpdate::Upsert(entry("a", BackendClass::ApiServer, "10.0.0.1:443"))])
            .unwrap();
        let e = table.resolve("a", BackendClass::ApiServer).unwrap();
        assert_eq!(e.address.to_string(), "10.0.0.1:443");
        assert!(table.resolve("b", BackendClass::ApiServer).is_none());
        assert!(
            table
                .resolve("a", BackendClass::TunnelServer { replica: None })
                .is_none()
        );
    }

    #[test]
    fn snapshot_is_stable_across_updates() {
        let table = RouteTable::new();
        table
            .apply([RouteUpdate::Upsert(entry("a", BackendClass::ApiServer, "10.0.0.1:443"))])
            .unwrap();
        let before = table.snapshot();
        table
            .apply([
                RouteUpdate::Delete {
                    tenant: "a".to_string(),
                    class: BackendClass::ApiServer,
                },
                RouteUpdate::Upsert(entry("b", BackendClass::ApiServer, "10.0.0.2:443")),
            ])
            .unwrap();
        assert!(before.resolve("a", BackendClass::ApiServer).is_some());
        assert!(before.resolve("b", BackendClass::ApiServer).is_none());
        let after = table.snapshot();
        assert!(after.resolve("a", BackendClass::ApiServer).is_none());
        assert!(after.resolve("b", BackendClass::ApiServer).is_some());
        assert_eq!(after.version(), before.version() + 1);
    }

    #[test]
    fn failed_batch_changes_nothing() {
        let table = RouteTable::new();
        let mut a = entry("a", BackendClass::ApiServer, "10.0.0.1:443");
        a.hostnames = vec!["api.a.example.com".to_string()];
        table.apply([RouteUpdate::Upsert(a)]).unwrap();
        let version = table.snapshot().version();

        let mut b = entry("b", BackendClass::ApiServer, "10.0.0.2:443");
        b.hostnames = vec!["API.a.example.com.".to_string()];
        let res = table.apply([
            RouteUpdate::Upsert(entry("c", BackendClass::ApiServer, "10.0.0.3:443")),
            RouteUpdate::Upsert(b),
        ]);
        assert_matches!(res, Err(Error::Conflict(_)));
        assert_eq!(table.snapshot().version(), version);
        assert!(table.resolve("c", BackendClass::ApiServer).is_none());
    }

    #[test]
    fn address_conflict_across_tenants() {
        let res = RouteTable::check(&[
            entry("a", BackendClass::ApiServer, "10.0.0.1:443"),
            entry("b", BackendClass::ApiServer, "10.0.0.1:443"),
        ]);
        assert_matches!(res, Err(Error::Conflict(_)));
    }

    #[test]
    fn indexes() {
        let table = RouteTable::new();
        let mut a = entry("a", BackendClass::ApiServer, "10.0.0.1:443");
        a.hostnames = vec!["Api.A.Example.com".to_string()];
        table
            .replace([a, entry("b", BackendClass::ApiServer, "backend-b.local:443")])
            .unwrap();
        let snap = table.snapshot();
        assert_eq!(snap.resolve_hostname("api.a.example.com.").unwrap().tenant, "a");
        assert_eq!(
            snap.resolve_address("10.0.0.1:443".parse().unwrap())
                .unwrap()
                .tenant,
            "a"
        );
        assert_eq!(
            snap.resolve_address("[::ffff:10.0.0.1]:443".parse().unwrap())
                .unwrap()
                .tenant,
            "a"
        );
        assert!(snap.resolve_address("10.0.0.1:444".parse().unwrap()).is_none());
        assert!(snap.resolve_hostname("backend-b.local").is_none());
    }

    #[test]
    fn delete_tenant() {
        let table = RouteTable::new();
        table
            .replace([
                entry("a", BackendClass::ApiServer, "10.0.0.1:443"),
                entry("a", BackendClass::TunnelServer { replica: Some(0) }, "10.0.0.1:1194"),
                entry("b", BackendClass::ApiServer, "10.0.0.2:443"),
            ])
            .unwrap();
        table
            .apply([RouteUpdate::DeleteTenant("a".to_string())])
            .unwrap();
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn backend_address_parsing() {
        assert_eq!(
            "[::1]:443".parse::<BackendAddress>().unwrap().to_string(),
            "[::1]:443"
        );
        assert!("no-port".parse::<BackendAddress>().is_err());
        assert!(":443".parse::<BackendAddress>().is_err());
        let named: BackendAddress = "api.a.svc:6443".parse().unwrap();
        assert_eq!(named.host, "api.a.svc");
        assert!(named.socket_addr().is_none());
    }
}
