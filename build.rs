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

// Build metadata is passed in from the release tooling through BUILD_* environment variables.
// Local builds fall back to "unknown".
fn main() -> Result<(), anyhow::Error> {
    for (key, env) in [
        ("buildVersion", "BUILD_VERSION"),
        ("buildGitRevision", "BUILD_GIT_REVISION"),
        ("buildStatus", "BUILD_STATUS"),
        ("buildTag", "BUILD_TAG"),
    ] {
        let value = std::env::var(env).unwrap_or_else(|_| "unknown".to_string());
        println!("cargo:rustc-env=TUNNELGATE_BUILD_{key}={value}");
        println!("cargo:rerun-if-env-changed={env}");
    }
    let rustc = rustc_version::version()?;
    println!("cargo:rustc-env=TUNNELGATE_BUILD_RUSTC_VERSION={rustc}");
    Ok(())
}
