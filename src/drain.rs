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

//! Draining lets listeners stop accepting while connections already in flight get a bounded
//! amount of time to finish on their own.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    Immediate,
    Graceful,
}

// Nothing is ever sent on the drained channel; it closes once every sender is gone.
enum Never {}

/// DrainTrigger starts a drain and waits for every [DrainWatcher] to be released.
pub struct DrainTrigger {
    mode_tx: watch::Sender<Option<DrainMode>>,
    released_rx: mpsc::Receiver<Never>,
}

/// DrainWatcher is held by anything that must finish before a drain completes.
#[derive(Clone)]
pub struct DrainWatcher {
    mode_rx: watch::Receiver<Option<DrainMode>>,
    released_tx: mpsc::Sender<Never>,
}

/// DrainBlocker keeps a drain from completing until it is dropped.
#[must_use = "dropping the blocker releases the drain"]
#[derive(Clone)]
pub struct DrainBlocker {
    _released_tx: mpsc::Sender<Never>,
    mode: DrainMode,
}

pub fn new() -> (DrainTrigger, DrainWatcher) {
    let (mode_tx, mode_rx) = watch::channel(None);
    let (released_tx, released_rx) = mpsc::channel(1);
    (
        DrainTrigger {
            mode_tx,
            released_rx,
        },
        DrainWatcher {
            mode_rx,
            released_tx,
        },
    )
}

impl DrainTrigger {
    pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
        let _ = self.mode_tx.send(Some(mode));
        match self.released_rx.recv().await {
            None => {}
            Some(never) => match never {},
        }
    }
}

impl DrainWatcher {
    /// Resolves once a drain starts. Holding the returned blocker delays its completion.
    pub async fn wait_for_drain(mut self) -> DrainBlocker {
        let mode = match self.mode_rx.wait_for(Option::is_some).await {
            Ok(mode) => (*mode).unwrap_or(DrainMode::Immediate),
            // The trigger is gone, nobody is waiting for us.
            Err(_) => DrainMode::Immediate,
        };
        DrainBlocker {
            _released_tx: self.released_tx,
            mode,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.mode_rx.borrow().is_some()
    }
}

impl DrainBlocker {
    pub fn mode(&self) -> DrainMode {
        self.mode
    }
}

impl fmt::Debug for DrainTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainTrigger").finish_non_exhaustive()
    }
}

impl fmt::Debug for DrainWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainWatcher")
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}

/// run_with_drain runs a listener until a drain starts, then gives its connections `deadline`
/// to finish.
///
/// `make_future` receives a watcher to clone into every connection it spawns, and a force
/// shutdown receiver that fires when the deadline passes. Spawned connections must select on it;
/// the listener future itself is simply dropped when the drain starts.
pub async fn run_with_drain<F, Fut, O>(
    component: String,
    drain: DrainWatcher,
    deadline: Duration,
    make_future: F,
) where
    F: FnOnce(DrainWatcher, watch::Receiver<()>) -> Fut,
    Fut: Future<Output = O>,
    O: Send + 'static,
{
    let (connections_trigger, connections) = new();
    let (force_tx, force_rx) = watch::channel(());
    let listener = make_future(connections, force_rx);
    tokio::select! {
        _ = listener => {}
        blocker = drain.wait_for_drain() => {
            if blocker.mode() == DrainMode::Graceful {
                debug!(component, "draining, waiting up to {deadline:?} for open connections");
                let drained = connections_trigger.start_drain_and_wait(DrainMode::Graceful);
                if tokio::time::timeout(deadline, drained).await.is_err() {
                    warn!(component, "drain deadline passed with open connections, terminating them");
                }
            } else {
                debug!(component, "terminating");
            }
            let _ = force_tx.send(());
            info!(component, "shutdown complete");
            drop(blocker);
        }
    }
}
