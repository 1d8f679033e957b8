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

//! Destination identifiers name a single backend endpoint behind the gateway, in the form
//! `{direction}|{port}||{service}.{namespace}.{suffix}`. They arrive on an untrusted header, so
//! the only way to turn one into something dialable is [Validator::validate], which fails closed.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifiers longer than a DNS name are never valid, no matter what the patterns say.
pub const MAX_IDENTIFIER_LEN: usize = 253;

// A Kubernetes namespace is a DNS-1123 label.
const NAMESPACE_PATTERN: &str = r"(?P<namespace>[a-z0-9](?:[-a-z0-9]{0,61}[a-z0-9])?)";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("destination does not match any allowed pattern")]
    Unmatched,
    #[error("destination matches more than one allowed pattern")]
    Ambiguous,
    #[error("destination exceeds {MAX_IDENTIFIER_LEN} bytes")]
    TooLong,
    #[error("destination contains non-printable characters")]
    InvalidCharacters,
    #[error("invalid allow pattern {0:?}: {1}")]
    InvalidPattern(String, String),
    #[error("invalid backend class {0:?}")]
    InvalidClass(String),
}

/// BackendClass is the closed set of things a tenant may reach through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendClass {
    /// The tenant's control-plane API server.
    ApiServer,
    /// A reverse tunnel server. HA setups run several replicas, addressed by index.
    TunnelServer { replica: Option<u8> },
}

impl BackendClass {
    pub fn kind(&self) -> PatternKind {
        match self {
            BackendClass::ApiServer => PatternKind::ApiServer,
            BackendClass::TunnelServer { .. } => PatternKind::TunnelServer,
        }
    }
}

impl fmt::Display for BackendClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendClass::ApiServer => write!(f, "api-server"),
            BackendClass::TunnelServer { replica: None } => write!(f, "tunnel-server"),
            BackendClass::TunnelServer { replica: Some(i) } => write!(f, "tunnel-server-{i}"),
        }
    }
}

impl FromStr for BackendClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api-server" => Ok(BackendClass::ApiServer),
            "tunnel-server" => Ok(BackendClass::TunnelServer { replica: None }),
            other => other
                .strip_prefix("tunnel-server-")
                .and_then(|i| i.parse::<u8>().ok())
                .map(|i| BackendClass::TunnelServer { replica: Some(i) })
                .ok_or_else(|| Error::InvalidClass(s.to_string())),
        }
    }
}

impl Serialize for BackendClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BackendClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKind {
    ApiServer,
    TunnelServer,
}

/// A validated destination. Only [Validator::validate] and [ValidatorConfig::destination] produce these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub identifier: String,
    pub class: BackendClass,
    pub tenant: String,
    pub port: u16,
    /// Canonical `host:port` of the backend named by the identifier.
    pub address: String,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllowPatternConfig {
    pub kind: PatternKind,
    /// Regular expression over the whole identifier. Must capture `namespace`; tunnel server
    /// patterns may capture `replica`.
    pub pattern: String,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidatorConfig {
    pub domain_suffix: String,
    pub api_service: String,
    pub api_port: u16,
    pub tunnel_service: String,
    pub tunnel_port: u16,
    /// Number of tunnel server replicas. Zero means a single, unsuffixed tunnel server.
    pub tunnel_replicas: u8,
    /// Extra patterns, evaluated alongside the generated ones.
    pub extra_patterns: Vec<AllowPatternConfig>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            domain_suffix: "svc.cluster.local".to_string(),
            api_service: "kube-apiserver".to_string(),
            api_port: 443,
            tunnel_service: "vpn-seed-server".to_string(),
            tunnel_port: 1194,
            tunnel_replicas: 2,
            extra_patterns: Vec::new(),
        }
    }
}

impl ValidatorConfig {
    /// The identifier a tenant uses to reach one of its own backends.
    pub fn destination(&self, class: BackendClass, tenant: &str) -> Destination {
        let (service, port) = match class {
            BackendClass::ApiServer => (self.api_service.clone(), self.api_port),
            BackendClass::TunnelServer { replica: None } => {
                (self.tunnel_service.clone(), self.tunnel_port)
            }
            BackendClass::TunnelServer { replica: Some(i) } => {
                (format!("{}-{i}", self.tunnel_service), self.tunnel_port)
            }
        };
        let host = format!("{service}.{tenant}.{}", self.domain_suffix);
        Destination {
            identifier: format!("outbound|{port}||{host}"),
            class,
            tenant: tenant.to_string(),
            port,
            address: format!("{host}:{port}"),
        }
    }

    fn generated_patterns(&self) -> Vec<AllowPatternConfig> {
        let suffix = regex::escape(&self.domain_suffix);
        let replica = match self.tunnel_replicas {
            0 => String::new(),
            // Replica indexes are a single digit.
            n => format!(r"(?:-(?P<replica>[0-{}]))?", n.min(10) - 1),
        };
        vec![
            AllowPatternConfig {
                kind: PatternKind::ApiServer,
                pattern: format!(
                    r"outbound\|{}\|\|{}\.{NAMESPACE_PATTERN}\.{suffix}",
                    self.api_port,
                    regex::escape(&self.api_service)
                ),
            },
            AllowPatternConfig {
                kind: PatternKind::TunnelServer,
                pattern: format!(
                    r"outbound\|{}\|\|{}{replica}\.{NAMESPACE_PATTERN}\.{suffix}",
                    self.tunnel_port,
                    regex::escape(&self.tunnel_service)
                ),
            },
        ]
    }
}

#[derive(Debug, Clone)]
pub struct AllowPattern {
    kind: PatternKind,
    source: String,
    regex: Regex,
}

impl AllowPattern {
    pub fn compile(cfg: &AllowPatternConfig) -> Result<AllowPattern, Error> {
        // Anchor both ends: a match on part of the identifier is not a match.
        let anchored = format!("^(?:{})$", cfg.pattern);
        let regex = Regex::new(&anchored)
            .map_err(|e| Error::InvalidPattern(cfg.pattern.clone(), e.to_string()))?;
        let names: Vec<&str> = regex.capture_names().flatten().collect();
        if !names.contains(&"namespace") {
            return Err(Error::InvalidPattern(
                cfg.pattern.clone(),
                "missing capture group 'namespace'".to_string(),
            ));
        }
        if cfg.kind == PatternKind::ApiServer && names.contains(&"replica") {
            return Err(Error::InvalidPattern(
                cfg.pattern.clone(),
                "api server patterns cannot capture 'replica'".to_string(),
            ));
        }
        Ok(AllowPattern {
            kind: cfg.kind,
            source: cfg.pattern.clone(),
            regex,
        })
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Validator holds the compiled allow patterns. It is immutable; a new pattern set means a new Validator.
#[derive(Debug, Clone)]
pub struct Validator {
    patterns: Vec<AllowPattern>,
}

impl Validator {
    pub fn new(cfg: &ValidatorConfig) -> Result<Validator, Error> {
        let patterns = cfg
            .generated_patterns()
            .iter()
            .chain(cfg.extra_patterns.iter())
            .map(AllowPattern::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Validator { patterns })
    }

    pub fn patterns(&self) -> &[AllowPattern] {
        &self.patterns
    }

    /// validate maps an untrusted identifier to the destination it names, or rejects it.
    pub fn validate(&self, identifier: &str) -> Result<Destination, Error> {
        if identifier.len() > MAX_IDENTIFIER_LEN {
            return Err(Error::TooLong);
        }
        if !identifier.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(Error::InvalidCharacters);
        }

        let mut matched = None;
        for pattern in &self.patterns {
            let Some(caps) = pattern.regex.captures(identifier) else {
                continue;
            };
            if matched.is_some() {
                return Err(Error::Ambiguous);
            }
            let tenant = caps
                .name("namespace")
                .map(|m| m.as_str().to_string())
                .ok_or(Error::Unmatched)?;
            let class = match pattern.kind {
                PatternKind::ApiServer => BackendClass::ApiServer,
                PatternKind::TunnelServer => {
                    let replica = match caps.name("replica") {
                        Some(m) => Some(m.as_str().parse::<u8>().map_err(|_| Error::Unmatched)?),
                        None => None,
                    };
                    BackendClass::TunnelServer { replica }
                }
            };
            matched = Some((class, tenant));
        }
        let (class, tenant) = matched.ok_or(Error::Unmatched)?;

        // Custom patterns may not enforce the wire shape, so the structure is checked independently.
        let (head, host) = identifier.split_once("||").ok_or(Error::Unmatched)?;
        let (_direction, port) = head.split_once('|').ok_or(Error::Unmatched)?;
        let port: u16 = port.parse().map_err(|_| Error::Unmatched)?;
        if host.is_empty() || host.contains('|') {
            return Err(Error::Unmatched);
        }
        Ok(Destination {
            identifier: identifier.to_string(),
            class,
            tenant,
            port,
            address: format!("{host}:{port}"),
        })
    }
}
