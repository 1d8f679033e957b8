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

use http::{HeaderMap, HeaderName};

use crate::identifier::{BackendClass, Validator, ValidatorConfig};
use crate::proxy::Error;
use crate::proxy::session::SessionTarget;
use crate::state::GatewayState;
use crate::state::migration::{MigrationState, ProtocolVersion};
use crate::state::routes::{BackendAddress, RouteEntry, RouteKey};

// Untrusted input is logged, but only this much of it.
const MAX_LOGGED_IDENTIFIER: usize = 256;

/// Match is the outcome of classifying a connection: who it belongs to and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub tenant: String,
    pub class: BackendClass,
    pub backend: BackendAddress,
    /// Written into the routing hint for backends that expect one.
    pub authority: String,
    /// The identifier the client asked for, when it asked with one.
    pub identifier: Option<String>,
}

impl Match {
    fn new(route: &RouteEntry, authority: String, identifier: Option<String>) -> Match {
        Match {
            tenant: route.tenant.clone(),
            class: route.class,
            backend: route.address.clone(),
            authority,
            identifier,
        }
    }

    pub fn target(&self) -> SessionTarget {
        SessionTarget {
            tenant: self.tenant.clone(),
            class: self.class,
            backend: self.backend.to_string(),
            identifier: self.identifier.clone(),
        }
    }
}

/// Matcher decides which tenant backend a connection is for, from whatever the entrypoint has:
/// a destination header, a TLS server name, or a PROXY header's original destination.
pub struct Matcher {
    validator: Arc<Validator>,
    identifiers: ValidatorConfig,
    state: GatewayState,
}

impl Matcher {
    pub fn new(validator: Arc<Validator>, identifiers: ValidatorConfig, state: GatewayState) -> Self {
        Matcher {
            validator,
            identifiers,
            state,
        }
    }

    /// Match a CONNECT request by the single destination header it must carry.
    pub fn match_connect(&self, headers: &HeaderMap, name: &HeaderName) -> Result<Match, Error> {
        let mut values = headers.get_all(name).iter();
        let value = match (values.next(), values.next()) {
            (Some(v), None) => v,
            (None, _) => return Err(Error::Malformed(format!("missing {name} header"))),
            (Some(_), Some(_)) => return Err(Error::Malformed(format!("more than one {name} header"))),
        };
        let raw = String::from_utf8_lossy(value.as_bytes());
        let dest = self
            .validator
            .validate(&raw)
            .map_err(|e| Error::Untrusted(loggable(&raw), e))?;
        let route = self
            .state
            .resolve(&dest.tenant, dest.class)
            .ok_or_else(|| {
                Error::Unavailable(RouteKey {
                    tenant: dest.tenant.clone(),
                    class: dest.class,
                })
            })?;
        Ok(Match::new(&route, dest.identifier.clone(), Some(dest.identifier)))
    }

    pub fn match_sni(&self, server_name: &str) -> Result<Match, Error> {
        let route = self
            .state
            .routes
            .snapshot()
            .resolve_hostname(server_name)
            .ok_or_else(|| Error::UnknownHostname(loggable(server_name)))?;
        Ok(Match::new(&route, server_name.to_string(), None))
    }

    /// Match a legacy connection by the original destination in its PROXY header. Tenants that
    /// have moved to the current protocol may not come in this way.
    pub fn match_legacy(
        &self,
        destination: SocketAddr,
        migration: &MigrationState,
    ) -> Result<Match, Error> {
        if !migration.legacy_port_enabled() {
            return Err(Error::LegacyPortDisabled);
        }
        let route = self
            .state
            .routes
            .snapshot()
            .resolve_address(destination)
            .ok_or(Error::UnknownAddress(destination))?;
        if migration.protocol(&route.tenant) == ProtocolVersion::Current {
            return Err(Error::TenantMigrated(route.tenant.clone()));
        }
        let authority = self.identifiers.destination(route.class, &route.tenant).identifier;
        Ok(Match::new(&route, authority, None))
    }
}

fn loggable(s: &str) -> String {
    let mut escaped: String = s.escape_debug().collect();
    if escaped.len() > MAX_LOGGED_IDENTIFIER {
        let mut end = MAX_LOGGED_IDENTIFIER;
        while !escaped.is_char_boundary(end) {
            end -= 1;
        }
        escaped.truncate(end);
        escaped.push_str("...");
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier;
    use crate::state::migration::LegacyPort;
    use crate::state::routes::RouteUpdate;
    use http::HeaderValue;
    use matches::assert_matches;
    use std::collections::BTreeMap;

    const HEADER: &str = "x-tunnel-destination";

    fn route(tenant: &str, class: BackendClass, addr: &str, hostnames: &[&str]) -> RouteUpdate {
        RouteUpdate::Upsert(RouteEntry {
            tenant: tenant.to_string(),
            class,
            address: addr.parse().unwrap(),
            hostnames: hostnames.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn matcher() -> Matcher {
        let cfg = ValidatorConfig::default();
        let state = GatewayState::new();
        state
            .apply_routes(vec![
                route("tenant-a", BackendClass::ApiServer, "10.0.0.1:443", &["api.tenant-a.example"]),
                route(
                    "tenant-a",
                    BackendClass::TunnelServer { replica: Some(0) },
                    "10.0.0.2:1194",
                    &[],
                ),
                route("tenant-b", BackendClass::ApiServer, "10.0.1.1:443", &[]),
            ])
            .unwrap();
        Matcher::new(Arc::new(Validator::new(&cfg).unwrap()), cfg, state)
    }

    fn headers(values: &[&str]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for v in values {
            h.append(HEADER, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn connect_matches_own_backend() {
        let m = matcher();
        let id = "outbound|443||kube-apiserver.tenant-a.svc.cluster.local";
        let got = m
            .match_connect(&headers(&[id]), &HeaderName::from_static(HEADER))
            .unwrap();
        assert_eq!(got.tenant, "tenant-a");
        assert_eq!(got.class, BackendClass::ApiServer);
        assert_eq!(got.backend.to_string(), "10.0.0.1:443");
        assert_eq!(got.authority, id);
        assert_eq!(got.identifier.as_deref(), Some(id));
    }

    #[test]
    fn connect_header_problems() {
        let m = matcher();
        let name = HeaderName::from_static(HEADER);
        assert_matches!(m.match_connect(&headers(&[]), &name), Err(Error::Malformed(_)));
        let id = "outbound|443||kube-apiserver.tenant-a.svc.cluster.local";
        assert_matches!(
            m.match_connect(&headers(&[id, id]), &name),
            Err(Error::Malformed(_))
        );
        assert_matches!(
            m.match_connect(&headers(&["outbound|443||evil.example.com"]), &name),
            Err(Error::Untrusted(_, identifier::Error::Unmatched))
        );
    }

    #[test]
    fn connect_unrouted_tenant_is_unavailable() {
        let m = matcher();
        let name = HeaderName::from_static(HEADER);
        let id = "outbound|443||kube-apiserver.tenant-c.svc.cluster.local";
        assert_matches!(
            m.match_connect(&headers(&[id]), &name),
            Err(Error::Unavailable(k)) if k.tenant == "tenant-c"
        );
    }

    #[test]
    fn sni_by_hostname() {
        let m = matcher();
        let got = m.match_sni("API.tenant-a.example").unwrap();
        assert_eq!(got.backend.to_string(), "10.0.0.1:443");
        assert_eq!(got.identifier, None);
        assert_matches!(m.match_sni("other.example"), Err(Error::UnknownHostname(_)));
    }

    #[test]
    fn legacy_respects_migration() {
        let m = matcher();
        let dst: SocketAddr = "10.0.0.2:1194".parse().unwrap();
        let mut migration = MigrationState::default();

        let got = m.match_legacy(dst, &migration).unwrap();
        assert_eq!(got.class, BackendClass::TunnelServer { replica: Some(0) });
        assert_eq!(
            got.authority,
            "outbound|1194||vpn-seed-server-0.tenant-a.svc.cluster.local"
        );
        assert_matches!(
            m.match_legacy("10.9.9.9:1194".parse().unwrap(), &migration),
            Err(Error::UnknownAddress(_))
        );

        migration.tenants = BTreeMap::from([("tenant-a".to_string(), ProtocolVersion::Current)]);
        assert_matches!(m.match_legacy(dst, &migration), Err(Error::TenantMigrated(t)) if t == "tenant-a");

        migration.legacy_port = LegacyPort::Disabled;
        assert_matches!(
            m.match_legacy("10.0.1.1:443".parse().unwrap(), &migration),
            Err(Error::LegacyPortDisabled)
        );
    }

    #[test]
    fn loggable_escapes_and_truncates() {
        assert_eq!(loggable("a\nb"), "a\\nb");
        let long = "x".repeat(1000);
        assert_eq!(loggable(&long).len(), MAX_LOGGED_IDENTIFIER + 3);
    }
}
