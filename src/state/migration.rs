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
use std::fmt;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state::Error;

/// The wire protocol a tenant speaks to the gateway. Tenants only ever move forward.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// PROXY protocol headers on the dedicated legacy port.
    #[default]
    Legacy,
    /// HTTP CONNECT carrying a destination identifier.
    Current,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Legacy => write!(f, "legacy"),
            ProtocolVersion::Current => write!(f, "current"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyPort {
    #[default]
    Enabled,
    Disabled,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    pub version: u64,
    pub tenants: BTreeMap<String, ProtocolVersion>,
    pub legacy_port: LegacyPort,
}

impl MigrationState {
    /// Tenants without an explicit entry have not migrated.
    pub fn protocol(&self, tenant: &str) -> ProtocolVersion {
        self.tenants.get(tenant).copied().unwrap_or_default()
    }

    pub fn legacy_port_enabled(&self) -> bool {
        self.legacy_port == LegacyPort::Enabled
    }

    /// Tenants that would still need the legacy port, counting every routed tenant as known.
    pub fn pending(&self, routed: &BTreeSet<String>) -> Vec<String> {
        let mut known: BTreeSet<&str> = self.tenants.keys().map(String::as_str).collect();
        known.extend(routed.iter().map(String::as_str));
        known
            .into_iter()
            .filter(|t| self.protocol(t) == ProtocolVersion::Legacy)
            .map(str::to_string)
            .collect()
    }

    /// Check that `next` is a legal successor of this state and stamp its version.
    pub fn transition(
        &self,
        mut next: MigrationState,
        routed: &BTreeSet<String>,
    ) -> Result<MigrationState, Error> {
        for (tenant, protocol) in &self.tenants {
            if *protocol == ProtocolVersion::Current
                && next.protocol(tenant) != ProtocolVersion::Current
            {
                return Err(Error::Downgrade(tenant.clone()));
            }
        }
        if self.legacy_port == LegacyPort::Disabled && next.legacy_port == LegacyPort::Enabled {
            return Err(Error::LegacyPortReenabled);
        }
        if next.legacy_port == LegacyPort::Disabled {
            let pending = next.pending(routed);
            if !pending.is_empty() {
                return Err(if self.legacy_port == LegacyPort::Disabled {
                    Error::LegacyPortDisabled(pending.join(","))
                } else {
                    Error::TenantsPending(pending)
                });
            }
        }
        next.version = self.version + 1;
        Ok(next)
    }
}

/// MigrationController owns the protocol flags and the legacy port switch.
#[derive(Debug, Clone, Default)]
pub struct MigrationController {
    current: Arc<ArcSwap<MigrationState>>,
    writer: Arc<Mutex<()>>,
}

impl MigrationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<MigrationState> {
        self.current.load_full()
    }

    pub fn protocol(&self, tenant: &str) -> ProtocolVersion {
        self.current.load().protocol(tenant)
    }

    pub fn set_protocol(&self, tenant: &str, protocol: ProtocolVersion) -> Result<u64, Error> {
        self.update(&BTreeSet::new(), |s| {
            let mut next = s.clone();
            next.tenants.insert(tenant.to_string(), protocol);
            next
        })
    }

    /// Disable the legacy port. Refused while any tenant, including any in `routed`, is still legacy.
    pub fn disable_legacy_port(&self, routed: &BTreeSet<String>) -> Result<u64, Error> {
        self.update(routed, |s| MigrationState {
            legacy_port: LegacyPort::Disabled,
            ..s.clone()
        })
    }

    pub fn enable_legacy_port(&self) -> Result<u64, Error> {
        self.update(&BTreeSet::new(), |s| MigrationState {
            legacy_port: LegacyPort::Enabled,
            ..s.clone()
        })
    }

    /// Merge a batch of flags and the port switch. Tenants not listed keep their flag, and an
    /// absent `legacy_port` keeps the current switch.
    pub fn apply(
        &self,
        tenants: &BTreeMap<String, ProtocolVersion>,
        legacy_port: Option<LegacyPort>,
        routed: &BTreeSet<String>,
    ) -> Result<u64, Error> {
        self.apply_with(tenants, legacy_port, routed, || Ok(()))
            .map(|(v, _)| v)
    }

    /// Like [Self::apply], but runs `commit` between validation and publication. If `commit`
    /// fails, the migration state is left untouched.
    pub fn apply_with<T>(
        &self,
        tenants: &BTreeMap<String, ProtocolVersion>,
        legacy_port: Option<LegacyPort>,
        routed: &BTreeSet<String>,
        commit: impl FnOnce() -> Result<T, Error>,
    ) -> Result<(u64, T), Error> {
        let _guard = self.writer.lock().map_err(|_| Error::Poisoned)?;
        let cur = self.current.load_full();
        let mut next = (*cur).clone();
        next.tenants
            .extend(tenants.iter().map(|(k, v)| (k.clone(), *v)));
        if let Some(legacy_port) = legacy_port {
            next.legacy_port = legacy_port;
        }
        let next = cur.transition(next, routed)?;
        let res = commit()?;
        Ok((self.publish(next), res))
    }

    fn update(
        &self,
        routed: &BTreeSet<String>,
        f: impl FnOnce(&MigrationState) -> MigrationState,
    ) -> Result<u64, Error> {
        let _guard = self.writer.lock().map_err(|_| Error::Poisoned)?;
        let cur = self.current.load_full();
        let next = cur.transition(f(&cur), routed)?;
        Ok(self.publish(next))
    }

    fn publish(&self, next: MigrationState) -> u64 {
        let version = next.version;
        let current = next
            .tenants
            .values()
            .filter(|p| **p == ProtocolVersion::Current)
            .count();
        info!(
            version,
            tenants = next.tenants.len(),
            current,
            legacy_port = ?next.legacy_port,
            "migration state updated"
        );
        self.current.store(Arc::new(next));
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    fn routed(tenants: &[&str]) -> BTreeSet<String> {
        tenants.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn unknown_tenants_are_legacy() {
        let c = MigrationController::new();
        assert_eq!(c.protocol("a"), ProtocolVersion::Legacy);
        assert!(c.snapshot().legacy_port_enabled());
    }

    #[test]
    fn protocol_is_one_way() {
        let c = MigrationController::new();
        c.set_protocol("a", ProtocolVersion::Legacy).unwrap();
        c.set_protocol("a", ProtocolVersion::Current).unwrap();
        assert_matches!(
            c.set_protocol("a", ProtocolVersion::Legacy),
            Err(Error::Downgrade(t)) if t == "a"
        );
        assert_eq!(c.protocol("a"), ProtocolVersion::Current);
        // Idempotent
        c.set_protocol("a", ProtocolVersion::Current).unwrap();
    }

    #[test]
    fn disable_requires_every_tenant_current() {
        let c = MigrationController::new();
        c.set_protocol("a", ProtocolVersion::Current).unwrap();
        c.set_protocol("b", ProtocolVersion::Legacy).unwrap();
        assert_matches!(
            c.disable_legacy_port(&routed(&[])),
            Err(Error::TenantsPending(p)) if p == vec!["b".to_string()]
        );
        c.set_protocol("b", ProtocolVersion::Current).unwrap();
        // A routed tenant with no flag still blocks.
        assert_matches!(
            c.disable_legacy_port(&routed(&["a", "c"])),
            Err(Error::TenantsPending(p)) if p == vec!["c".to_string()]
        );
        c.disable_legacy_port(&routed(&["a", "b"])).unwrap();
        assert!(!c.snapshot().legacy_port_enabled());
    }

    #[test]
    fn disabled_port_stays_disabled() {
        let c = MigrationController::new();
        c.disable_legacy_port(&routed(&[])).unwrap();
        assert_matches!(c.enable_legacy_port(), Err(Error::LegacyPortReenabled));
        assert_matches!(
            c.set_protocol("new", ProtocolVersion::Legacy),
            Err(Error::LegacyPortDisabled(_))
        );
        c.set_protocol("new", ProtocolVersion::Current).unwrap();
    }

    #[test]
    fn apply_is_atomic() {
        let c = MigrationController::new();
        c.set_protocol("a", ProtocolVersion::Current).unwrap();
        let version = c.snapshot().version;
        let batch = BTreeMap::from([
            ("b".to_string(), ProtocolVersion::Current),
            ("a".to_string(), ProtocolVersion::Legacy),
        ]);
        assert_matches!(
            c.apply(&batch, Some(LegacyPort::Enabled), &routed(&[])),
            Err(Error::Downgrade(_))
        );
        assert_eq!(c.snapshot().version, version);
        assert_eq!(c.protocol("b"), ProtocolVersion::Legacy);
    }

    #[test]
    fn apply_merges_and_commit_failure_rolls_back() {
        let c = MigrationController::new();
        c.set_protocol("a", ProtocolVersion::Current).unwrap();
        let batch = BTreeMap::from([("b".to_string(), ProtocolVersion::Current)]);
        let res = c.apply_with(&batch, Some(LegacyPort::Disabled), &routed(&["a", "b"]), || {
            Err::<(), _>(Error::Conflict("boom".to_string()))
        });
        assert_matches!(res, Err(Error::Conflict(_)));
        assert!(c.snapshot().legacy_port_enabled());

        c.apply(&batch, Some(LegacyPort::Disabled), &routed(&["a", "b"]))
            .unwrap();
        let s = c.snapshot();
        assert_eq!(s.protocol("a"), ProtocolVersion::Current);
        assert_eq!(s.protocol("b"), ProtocolVersion::Current);
        assert!(!s.legacy_port_enabled());
    }

    #[test]
    fn absent_port_switch_keeps_current() {
        let c = MigrationController::new();
        c.set_protocol("a", ProtocolVersion::Current).unwrap();
        c.disable_legacy_port(&routed(&["a"])).unwrap();
        let batch = BTreeMap::from([("b".to_string(), ProtocolVersion::Current)]);
        c.apply(&batch, None, &routed(&["a", "b"])).unwrap();
        assert!(!c.snapshot().legacy_port_enabled());
        assert_matches!(
            c.apply(&BTreeMap::new(), Some(LegacyPort::Enabled), &routed(&[])),
            Err(Error::LegacyPortReenabled)
        );
    }
}
