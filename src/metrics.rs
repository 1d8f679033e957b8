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

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::version;

/// Every metric this process exports lives under this prefix.
pub const PREFIX: &str = "tunnelgate";

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
struct BuildLabels {
    component: String,
    role: String,
    tag: String,
}

/// The registry the components of this process register into.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
    registry.sub_registry_with_prefix(PREFIX)
}

/// Export a constant gauge identifying the build and the role this process runs as.
pub fn register_build_info(registry: &mut Registry, role: &str) {
    let build: Family<BuildLabels, Gauge> = Default::default();
    registry.register("build", "Build info", build.clone());
    build
        .get_or_create(&BuildLabels {
            component: PREFIX.to_string(),
            role: role.to_string(),
            tag: version::BuildInfo::new().git_tag,
        })
        .set(1);
}
