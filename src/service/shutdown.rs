// Copyright 2025 jonefeewang@gmail.com
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

use tokio::sync::watch;

/// Owning side of an engine's stop flag. Cheap to clone; any clone may trigger.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    notify: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> ShutdownSignal {
        let (notify, _) = watch::channel(false);
        ShutdownSignal {
            notify: Arc::new(notify),
        }
    }

    pub fn trigger(&self) {
        self.notify.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.notify.borrow()
    }

    /// Subscribers created after `trigger` observe the shutdown immediately.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.notify.subscribe())
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new(notify: watch::Receiver<bool>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown || *self.notify.borrow()
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // a dropped sender counts as shutdown too
        let _ = self.notify.wait_for(|triggered| *triggered).await;
        self.is_shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_late_subscriber_sees_trigger() {
        let signal = ShutdownSignal::new();
        let mut early = signal.subscribe();
        assert!(!early.is_shutdown());

        signal.trigger();
        let mut late = signal.subscribe();
        tokio::time::timeout(Duration::from_secs(1), early.recv())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), late.recv())
            .await
            .unwrap();
        assert!(late.is_shutdown());
        assert!(signal.is_triggered());
    }
}
