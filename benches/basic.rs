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
use std::time::Duration;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};

use tunnelgate::identifier::{BackendClass, Validator, ValidatorConfig};
use tunnelgate::proxy::hints;
use tunnelgate::state::routes::{BackendAddress, RouteEntry, RouteTable};

const TENANT_COUNT: usize = 1000;

fn tenant(i: usize) -> String {
    format!("shoot--project-{i}--cluster")
}

pub fn validate(c: &mut Criterion) {
    let cfg = ValidatorConfig::default();
    let validator = Validator::new(&cfg).unwrap();
    let valid = cfg.destination(BackendClass::ApiServer, &tenant(7)).identifier;
    let replica = cfg
        .destination(BackendClass::TunnelServer { replica: Some(1) }, &tenant(7))
        .identifier;
    let injected = format!("{valid}; rm -rf /");
    let oversized = "a".repeat(4096);

    let mut c = c.benchmark_group("validate");
    c.measurement_time(Duration::from_secs(5));
    c.bench_function("api-server", |b| b.iter(|| validator.validate(&valid).unwrap()));
    c.bench_function("tunnel-server-replica", |b| {
        b.iter(|| validator.validate(&replica).unwrap())
    });
    c.bench_function("injected", |b| {
        b.iter(|| validator.validate(&injected).unwrap_err())
    });
    c.bench_function("oversized", |b| {
        b.iter(|| validator.validate(&oversized).unwrap_err())
    });
}

pub fn routes(c: &mut Criterion) {
    let table = RouteTable::new();
    table
        .replace((0..TENANT_COUNT).map(|i| RouteEntry {
            tenant: tenant(i),
            class: BackendClass::ApiServer,
            address: BackendAddress {
                host: format!("10.{}.{}.1", i / 250, i % 250),
                port: 443,
            },
            hostnames: vec![format!("api.{}.example.com", tenant(i))],
        }))
        .unwrap();
    let snapshot = table.snapshot();
    let name = format!("api.{}.example.com", tenant(500));
    let addr: SocketAddr = "10.2.0.1:443".parse().unwrap();

    let mut c = c.benchmark_group("routes");
    c.throughput(Throughput::Elements(1));
    c.bench_function("resolve", |b| {
        b.iter(|| table.resolve(&tenant(500), BackendClass::ApiServer).unwrap())
    });
    c.bench_function("resolve-hostname", |b| {
        b.iter(|| snapshot.resolve_hostname(&name).unwrap())
    });
    c.bench_function("resolve-address", |b| {
        b.iter(|| snapshot.resolve_address(addr).unwrap())
    });
    c.bench_function("replace", |b| {
        b.iter(|| {
            let scratch = RouteTable::new();
            scratch
                .replace(snapshot.entries().map(|e| e.as_ref().clone()))
                .unwrap()
        })
    });
}

pub fn proxy_header(c: &mut Criterion) {
    let header = hints::encode(
        "10.250.0.7:40000".parse().unwrap(),
        "10.2.0.1:443".parse().unwrap(),
        "outbound|443||kube-apiserver.shoot--project-7--cluster.svc.cluster.local",
    )
    .unwrap();
    let mut c = c.benchmark_group("proxy-header");
    c.bench_function("decode", |b| b.iter(|| hints::decode(&header).unwrap()));
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = validate, routes, proxy_header
}

criterion_main!(benches);
