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

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ConfigSource;
use crate::drain::DrainWatcher;
use crate::identifier::BackendClass;
use crate::state::migration::{LegacyPort, MigrationController, MigrationState, ProtocolVersion};
use crate::state::routes::{RouteEntry, RouteSnapshot, RouteTable, RouteUpdate};

pub mod migration;
pub mod routes;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("tenant {0} cannot move back to the legacy protocol")]
    Downgrade(String),
    #[error("legacy port cannot be disabled, tenants still on legacy protocol: {0:?}")]
    TenantsPending(Vec<String>),
    #[error("legacy port cannot be re-enabled once disabled")]
    LegacyPortReenabled,
    #[error("legacy port is disabled, tenants cannot use legacy protocol: {0}")]
    LegacyPortDisabled(String),
    #[error("route conflict: {0}")]
    Conflict(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("io: {0}")]
    Io(String),
    #[error("state lock poisoned")]
    Poisoned,
}

/// LocalState is the on-disk description of the gateway's routes and migration flags.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalState {
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    #[serde(default)]
    pub tenants: BTreeMap<String, ProtocolVersion>,
    /// Absent means the switch keeps its current position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_port: Option<LegacyPort>,
}

impl LocalState {
    pub fn parse(s: &str) -> Result<Self, Error> {
        serde_yaml::from_str(s).map_err(|e| Error::Parse(e.to_string()))
    }
}

/// GatewayState is everything the matcher consults, each part independently swappable.
#[derive(Clone, Debug, Default)]
pub struct GatewayState {
    pub routes: RouteTable,
    pub migration: MigrationController,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StateDump {
    pub routes: Arc<RouteSnapshot>,
    pub migration: Arc<MigrationState>,
}

impl GatewayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dump(&self) -> StateDump {
        StateDump {
            routes: self.routes.snapshot(),
            migration: self.migration.snapshot(),
        }
    }

    fn routed_tenants(routes: &[RouteEntry]) -> BTreeSet<String> {
        routes.iter().map(|r| r.tenant.clone()).collect()
    }

    /// Disable the legacy port, counting every routed tenant as one that must have migrated.
    pub fn disable_legacy_port(&self) -> Result<u64, Error> {
        let routed = self
            .routes
            .snapshot()
            .entries()
            .map(|r| r.tenant.clone())
            .collect();
        self.migration.disable_legacy_port(&routed)
    }

    /// Apply incremental route updates. With the legacy port disabled, every tenant gaining a
    /// route must already be flagged current.
    pub fn apply_routes(&self, updates: Vec<RouteUpdate>) -> Result<u64, Error> {
        let routed: BTreeSet<String> = updates
            .iter()
            .filter_map(|u| match u {
                RouteUpdate::Upsert(e) => Some(e.tenant.clone()),
                _ => None,
            })
            .collect();
        let (_, route_version) =
            self.migration
                .apply_with(&BTreeMap::new(), None, &routed, || self.routes.apply(updates))?;
        Ok(route_version)
    }

    /// Replace the routes and merge the migration flags from a local state document. Nothing is
    /// published unless both halves are valid.
    pub fn apply_local(&self, local: LocalState) -> Result<(), Error> {
        RouteTable::check(&local.routes)?;
        let routed = Self::routed_tenants(&local.routes);
        let num_routes = local.routes.len();
        let (version, route_version) = self.migration.apply_with(
            &local.tenants,
            local.legacy_port,
            &routed,
            || self.routes.replace(local.routes),
        )?;
        info!(
            migration_version = version,
            route_version, num_routes, "applied local state"
        );
        Ok(())
    }

    pub fn resolve(&self, tenant: &str, class: BackendClass) -> Option<Arc<RouteEntry>> {
        self.routes.resolve(tenant, class)
    }
}

/// LocalStateClient loads the local state file and, for files, reloads it whenever it changes.
pub struct LocalStateClient {
    pub source: ConfigSource,
    pub state: GatewayState,
    pub poll_interval: Duration,
}

impl LocalStateClient {
    /// Load the initial state. Failure here is fatal, unlike failures on reload.
    pub async fn load(&self) -> anyhow::Result<Option<SystemTime>> {
        let modified = self.modified().await;
        let local = LocalState::parse(&self.source.read_to_string().await?)?;
        self.state.apply_local(local)?;
        Ok(modified)
    }

    async fn modified(&self) -> Option<SystemTime> {
        match &self.source {
            ConfigSource::File(path) => tokio::fs::metadata(path)
                .await
                .and_then(|m| m.modified())
                .ok(),
            ConfigSource::Static(_) => None,
        }
    }

    #[instrument(skip_all, name = "local_state")]
    pub async fn run(self, mut last_modified: Option<SystemTime>, drain: DrainWatcher) {
        if !matches!(self.source, ConfigSource::File(_)) {
            return;
        }
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let drained = drain.wait_for_drain();
        tokio::pin!(drained);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut drained => {
                    debug!("stopping local state watch");
                    return;
                }
            }
            let modified = self.modified().await;
            if modified.is_none() || modified == last_modified {
                continue;
            }
            // Remember the attempt even if it fails, so a bad file is reported once.
            last_modified = modified;
            let contents = match self.source.read_to_string().await {
                Ok(c) => c,
                Err(e) => {
                    warn!("failed to read local state: {e}");
                    continue;
                }
            };
            match LocalState::parse(&contents).and_then(|l| self.state.apply_local(l)) {
                Ok(()) => info!("reloaded local state"),
                Err(e) => error!("rejected local state update, keeping previous state: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    const STATE: &str = r#"
routes:
- tenant: tenant-a
  class: api-server
  address: 127.0.0.1:6443
  hostnames: [api.tenant-a.example.com]
- tenant: tenant-b
  class: tunnel-server-0
  address: vpn.tenant-b.svc:1194
tenants:
  tenant-a: current
legacyPort: enabled
"#;

    #[test]
    fn parse_local_state() {
        let local = LocalState::parse(STATE).unwrap();
        assert_eq!(local.routes.len(), 2);
        assert_eq!(
            local.routes[1].class,
            BackendClass::TunnelServer { replica: Some(0) }
        );
        assert_eq!(local.tenants["tenant-a"], ProtocolVersion::Current);
        assert_matches!(
            LocalState::parse("routes: []\nunknown: 1"),
            Err(Error::Parse(_))
        );
    }

    #[test]
    fn apply_local_is_all_or_nothing() {
        let state = GatewayState::new();
        state.apply_local(LocalState::parse(STATE).unwrap()).unwrap();
        assert!(state.resolve("tenant-a", BackendClass::ApiServer).is_some());

        // tenant-b is routed and still legacy, so the port cannot be disabled.
        let mut bad = LocalState::parse(STATE).unwrap();
        bad.routes.remove(0);
        bad.legacy_port = Some(LegacyPort::Disabled);
        assert_matches!(state.apply_local(bad), Err(Error::TenantsPending(_)));
        assert!(state.resolve("tenant-a", BackendClass::ApiServer).is_some());
        assert!(state.migration.snapshot().legacy_port_enabled());
    }

    #[test]
    fn disable_counts_routed_tenants() {
        let state = GatewayState::new();
        state.apply_local(LocalState::parse(STATE).unwrap()).unwrap();
        assert_matches!(state.disable_legacy_port(), Err(Error::TenantsPending(p)) if p == vec!["tenant-b".to_string()]);
        state
            .migration
            .set_protocol("tenant-b", ProtocolVersion::Current)
            .unwrap();
        state.disable_legacy_port().unwrap();
    }

    #[test]
    fn reload_without_port_switch_keeps_it_disabled() {
        let state = GatewayState::new();
        let mut local = LocalState::parse(STATE).unwrap();
        local.tenants.insert("tenant-b".to_string(), ProtocolVersion::Current);
        local.legacy_port = Some(LegacyPort::Disabled);
        state.apply_local(local).unwrap();
        assert!(!state.migration.snapshot().legacy_port_enabled());

        let reload = LocalState::parse(
            r#"
routes:
- tenant: tenant-c
  class: api-server
  address: 127.0.0.1:7443
tenants:
  tenant-c: current
"#,
        )
        .unwrap();
        assert_eq!(reload.legacy_port, None);
        state.apply_local(reload).unwrap();
        assert!(state.resolve("tenant-c", BackendClass::ApiServer).is_some());
        assert!(!state.migration.snapshot().legacy_port_enabled());

        // Stating it explicitly is still refused.
        let mut reenable = LocalState::parse("routes: []\n").unwrap();
        reenable.legacy_port = Some(LegacyPort::Enabled);
        assert_matches!(state.apply_local(reenable), Err(Error::LegacyPortReenabled));
    }

    #[test]
    fn route_updates_respect_disabled_port() {
        let state = GatewayState::new();
        state.disable_legacy_port().unwrap();
        let entry = |tenant: &str, port: u16| {
            RouteUpdate::Upsert(RouteEntry {
                tenant: tenant.to_string(),
                class: BackendClass::ApiServer,
                address: format!("127.0.0.1:{port}").parse().unwrap(),
                hostnames: Vec::new(),
            })
        };
        assert_matches!(
            state.apply_routes(vec![entry("tenant-a", 6443)]),
            Err(Error::LegacyPortDisabled(_))
        );
        assert!(state.routes.snapshot().is_empty());

        state
            .migration
            .set_protocol("tenant-a", ProtocolVersion::Current)
            .unwrap();
        state.apply_routes(vec![entry("tenant-a", 6443)]).unwrap();
        assert!(state.resolve("tenant-a", BackendClass::ApiServer).is_some());
    }

    #[tokio::test]
    async fn reload_from_file() {
        let dir = std::env::temp_dir().join(format!("tunnelgate-state-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("state.yaml");
        tokio::fs::write(&path, STATE).await.unwrap();

        let state = GatewayState::new();
        let client = LocalStateClient {
            source: ConfigSource::File(path.clone()),
            state: state.clone(),
            poll_interval: Duration::from_millis(10),
        };
        let modified = client.load().await.unwrap();
        let (trigger, watcher) = crate::drain::new();
        let task = tokio::spawn(client.run(modified, watcher));

        // Ensure the mtime moves forward even on coarse filesystems.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        tokio::fs::write(&path, "routes: []\n").await.unwrap();
        for _ in 0..200 {
            if state.routes.snapshot().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.routes.snapshot().is_empty());

        // An invalid update keeps the previous state.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        tokio::fs::write(&path, "routes: [").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(state.routes.snapshot().is_empty());
        assert_eq!(state.migration.protocol("tenant-a"), ProtocolVersion::Current);

        trigger
            .start_drain_and_wait(crate::drain::DrainMode::Immediate)
            .await;
        task.await.unwrap();
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
