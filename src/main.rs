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

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tunnelgate::app::Role;
use tunnelgate::*;

fn main() -> anyhow::Result<()> {
    telemetry::setup_logging();

    // For now we don't need a complex CLI, so rather than pull in dependencies just use basic argv[1]
    let role = match std::env::args().nth(1).as_deref() {
        None => Role::Gateway,
        Some("version") => return version(),
        Some("help") => return help(),
        Some(other) => match other.parse::<Role>() {
            Ok(role) => role,
            Err(_) => {
                eprintln!("unknown command: {other}");
                help()?;
                std::process::exit(1)
            }
        },
    };
    let config = Arc::new(config::parse_config()?);

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?
        .block_on(async move { run(config, role).await })
}

fn help() -> anyhow::Result<()> {
    let version = version::BuildInfo::new();
    println!(
        "
Tunnelgate ({version})

Commands:
gateway (default) - Run the shared ingress gateway
client            - Run the tenant-side tunnel client
reverse-client    - Run the tenant-side end of the reverse tunnel
reverse-server    - Run the control plane end of the reverse tunnel
version           - Print the version of tunnelgate
help              - Print commands and version of tunnelgate"
    );
    Ok(())
}

fn version() -> anyhow::Result<()> {
    println!("{}", version::BuildInfo::new());
    Ok(())
}

async fn run(cfg: Arc<config::Config>, role: Role) -> anyhow::Result<()> {
    info!("version: {}", version::BuildInfo::new());
    info!(%role, "running with config: {}", serde_yaml::to_string(&cfg)?);
    app::build(cfg, role).await?.wait_termination().await
}
