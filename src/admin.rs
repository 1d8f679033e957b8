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
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;

use crate::client::ProtocolSwitch;
use crate::config::Config;
use crate::drain::DrainWatcher;
use crate::hyper_util::{Server, empty_response, json_response, plaintext_response};
use crate::proxy::session::SessionManager;
use crate::reverse::link::{LinkInfo, LinkTable};
use crate::signal::ShutdownTrigger;
use crate::state::{GatewayState, StateDump};
use crate::state::migration::ProtocolVersion;
use crate::telemetry;
use crate::version::BuildInfo;

/// The parts of a running process the admin server can show. Which are present depends on the
/// role.
#[derive(Clone, Default)]
pub struct Components {
    pub gateway: Option<GatewayState>,
    pub sessions: Option<SessionManager>,
    pub links: Option<LinkTable>,
    pub client_protocol: Option<ProtocolSwitch>,
}

struct State {
    config: Arc<Config>,
    shutdown_trigger: ShutdownTrigger,
    components: Components,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDump<'a> {
    version: BuildInfo,
    config: &'a Config,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<StateDump>,
    #[serde(skip_serializing_if = "Option::is_none")]
    links: Option<Vec<LinkInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_protocol: Option<ProtocolVersion>,
}

pub struct Service {
    s: Server<State>,
}

impl Service {
    pub async fn new(
        config: Arc<Config>,
        components: Components,
        shutdown_trigger: ShutdownTrigger,
        drain_rx: DrainWatcher,
    ) -> anyhow::Result<Self> {
        let addr = config.admin_addr;
        let state = State {
            config,
            shutdown_trigger: shutdown_trigger.clone(),
            components,
        };
        Server::bind("admin", addr, shutdown_trigger, drain_rx, state)
            .await
            .map(|s| Service { s })
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s.spawn(|state, req| async move {
            match req.uri().path() {
                "/quitquitquit" => handle_server_shutdown(&state.shutdown_trigger, req).await,
                "/config_dump" => handle_config_dump(&state),
                "/sessions" => handle_sessions(&state),
                "/migrate" => handle_migrate(&state, req),
                "/logging" => handle_logging(req),
                _ => empty_response(StatusCode::NOT_FOUND),
            }
        })
    }
}

async fn handle_server_shutdown(
    shutdown_trigger: &ShutdownTrigger,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    match *req.method() {
        Method::POST => {
            shutdown_trigger.shutdown_now().await;
            plaintext_response(StatusCode::OK, "shutdown now\n".into())
        }
        _ => empty_response(StatusCode::METHOD_NOT_ALLOWED),
    }
}

fn handle_config_dump(state: &State) -> Response<Full<Bytes>> {
    let c = &state.components;
    json_response(&ConfigDump {
        version: BuildInfo::new(),
        config: &state.config,
        state: c.gateway.as_ref().map(GatewayState::dump),
        links: c.links.as_ref().map(LinkTable::list),
        client_protocol: c.client_protocol.as_ref().map(ProtocolSwitch::get),
    })
}

fn handle_sessions(state: &State) -> Response<Full<Bytes>> {
    match &state.components.sessions {
        Some(sessions) => json_response(&sessions.list()),
        None => empty_response(StatusCode::NOT_FOUND),
    }
}

/// Moves a tenant client to the current protocol. There is no endpoint to move it back.
fn handle_migrate(state: &State, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let Some(switch) = &state.components.client_protocol else {
        return empty_response(StatusCode::NOT_FOUND);
    };
    if req.method() != Method::POST {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    let changed = switch.migrate();
    plaintext_response(
        StatusCode::OK,
        format!("protocol is {} (changed: {changed})\n", switch.get()),
    )
}

// Follows envoy's /logging: only one query parameter is supported.
static HELP_STRING: &str = "
usage: POST /logging\t\t\t\t\t\t(To list current level)
usage: POST /logging?level=<level>\t\t\t\t(To change global levels)
usage: POST /logging?level={mod1}:{level1},{mod2}:{level2}\t(To change specific mods' logging level)

hint: loglevel:\terror|warn|info|debug|trace|off
hint: mod_name:\tthe module name, i.e. tunnelgate::proxy
";

fn handle_logging(req: Request<Incoming>) -> Response<Full<Bytes>> {
    match *req.method() {
        Method::POST => {
            let qp: HashMap<String, String> = req
                .uri()
                .query()
                .map(|v| url::form_urlencoded::parse(v.as_bytes()).into_owned().collect())
                .unwrap_or_default();
            let level = qp.get("level").cloned();
            let reset = qp.get("reset").cloned();
            if level.is_some() || reset.is_some() {
                change_log_level(reset.is_some(), &level.unwrap_or_default())
            } else {
                list_loggers()
            }
        }
        _ => plaintext_response(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Invalid HTTP method\n {HELP_STRING}"),
        ),
    }
}

fn list_loggers() -> Response<Full<Bytes>> {
    match telemetry::get_current_loglevel() {
        Ok(loglevel) => plaintext_response(
            StatusCode::OK,
            format!("current log level is {loglevel}\n"),
        ),
        Err(err) => plaintext_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to get the log level: {err}\n {HELP_STRING}"),
        ),
    }
}

fn change_log_level(reset: bool, level: &str) -> Response<Full<Bytes>> {
    match telemetry::set_level(reset, level) {
        Ok(_) => list_loggers(),
        Err(e) => plaintext_response(
            StatusCode::BAD_REQUEST,
            format!("failed to set new level: {e}\n{HELP_STRING}"),
        ),
    }
}
