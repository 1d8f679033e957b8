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

use std::fmt::Write;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::proxy::session::Entrypoint;

pub struct Metrics {
    pub connections_opened: Family<ListenerLabels, Counter>,
    pub connections_closed: Family<ListenerLabels, Counter>,
    pub active_sessions: Family<ListenerLabels, Gauge>,
    pub rejections: Family<RejectionLabels, Counter>,
    pub received_bytes: Family<TrafficLabels, Counter>,
    pub sent_bytes: Family<TrafficLabels, Counter>,
    pub stripped_hints: Family<ListenerLabels, Counter>,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let connections_opened = Family::default();
        registry.register(
            "tcp_connections_opened",
            "The total number of client connections accepted",
            connections_opened.clone(),
        );
        let connections_closed = Family::default();
        registry.register(
            "tcp_connections_closed",
            "The total number of client connections closed",
            connections_closed.clone(),
        );
        let active_sessions = Family::default();
        registry.register(
            "active_sessions",
            "The number of sessions currently open",
            active_sessions.clone(),
        );
        let rejections = Family::default();
        registry.register(
            "rejections",
            "The total number of connections rejected before proxying, by reason",
            rejections.clone(),
        );
        let received_bytes = Family::default();
        registry.register(
            "tcp_received_bytes",
            "The size of total bytes received from clients, recorded when the session closes",
            received_bytes.clone(),
        );
        let sent_bytes = Family::default();
        registry.register(
            "tcp_sent_bytes",
            "The size of total bytes sent to clients, recorded when the session closes",
            sent_bytes.clone(),
        );
        let stripped_hints = Family::default();
        registry.register(
            "stripped_routing_hints",
            "The total number of client supplied PROXY headers removed before forwarding",
            stripped_hints.clone(),
        );
        Metrics {
            connections_opened,
            connections_closed,
            active_sessions,
            rejections,
            received_bytes,
            sent_bytes,
            stripped_hints,
        }
    }
}

impl EncodeLabelValue for Entrypoint {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        writer.write_str(&self.to_string())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ListenerLabels {
    pub entrypoint: Entrypoint,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TrafficLabels {
    pub entrypoint: Entrypoint,
    pub tenant: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectionLabels {
    pub entrypoint: Entrypoint,
    pub reason: RejectReason,
}

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RejectReason {
    malformed,
    untrusted,
    unknown_hostname,
    unknown_address,
    unavailable,
    migrated,
    legacy_disabled,
    backend_unreachable,
    timeout,
    not_tls,
    io,
}
