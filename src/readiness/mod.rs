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

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

use crate::telemetry;

mod server;
pub use server::*;

/// Ready tracks the startup tasks that must finish before the process reports ready.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
    pub fn new() -> Ready {
        Ready::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a task; readiness is blocked until the returned guard is dropped.
    pub fn register_task(&self, name: &str) -> BlockReady {
        self.tasks().insert(name.to_string());
        BlockReady {
            parent: self.clone(),
            name: name.to_string(),
        }
    }

    pub fn pending(&self) -> HashSet<String> {
        self.tasks().clone()
    }
}

pub struct BlockReady {
    parent: Ready,
    name: String,
}

impl Drop for BlockReady {
    fn drop(&mut self) {
        let left = {
            let mut pending = self.parent.tasks();
            pending.remove(&self.name);
            pending.len()
        };
        let dur = telemetry::APPLICATION_START_TIME.elapsed();
        if left == 0 {
            info!("task '{}' complete ({dur:?}), marking server ready", self.name);
        } else {
            info!("task '{}' complete ({dur:?}), still awaiting {left} tasks", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_after_all_tasks() {
        let ready = Ready::new();
        let a = ready.register_task("a");
        let b = ready.register_task("b");
        drop(a);
        assert_eq!(ready.pending(), HashSet::from(["b".to_string()]));
        drop(b);
        assert!(ready.pending().is_empty());
    }
}
