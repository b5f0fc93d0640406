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

//! Client side liveness probing.
//!
//! The driver pings once immediately, then once per period. A ping carries the last
//! sequence the peer acknowledged; the peer echoes it incremented, and the receive path
//! records that echo through [`HeartbeatState::acknowledge`]. When a period passes
//! without the acknowledged sequence moving, the failure count grows, and once it
//! exceeds `max_failures` the driver gives up. With period `P` and `F` allowed failures
//! a silent peer is detected after `P * (F + 1)`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::network::{ControlKind, HeartBeat, Node};

use super::{AppError, Shutdown};

#[derive(Debug)]
pub struct HeartbeatState {
    last_sent: AtomicU32,
    last_acked: AtomicU32,
    failures: AtomicU32,
    started: AtomicBool,
    period: Duration,
    max_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    Ping(HeartBeat),
    TimedOut { failures: u32 },
}

impl HeartbeatState {
    pub fn new(period: Duration, max_failures: u32) -> HeartbeatState {
        HeartbeatState {
            last_sent: AtomicU32::new(0),
            last_acked: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            started: AtomicBool::new(false),
            period,
            max_failures,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn last_acked(&self) -> u32 {
        self.last_acked.load(Ordering::Acquire)
    }

    pub fn last_sent(&self) -> u32 {
        self.last_sent.load(Ordering::Acquire)
    }

    /// Records our own ping coming back from the peer.
    pub fn acknowledge(&self, sequence: u32) {
        trace!("heartbeat acknowledged, sequence {}", sequence);
        self.last_acked.store(sequence, Ordering::Release);
    }

    /// Decides what to do when a period has elapsed.
    pub fn tick(&self, sender: u32) -> HeartbeatTick {
        let acked = self.last_acked.load(Ordering::Acquire);
        if self.started.swap(true, Ordering::AcqRel) {
            if acked == self.last_sent.load(Ordering::Acquire) {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures > self.max_failures {
                    return HeartbeatTick::TimedOut { failures };
                }
            } else {
                self.failures.store(0, Ordering::Release);
            }
        }
        self.last_sent.store(acked, Ordering::Release);
        HeartbeatTick::Ping(HeartBeat {
            sender,
            sequence: acked,
            fail_count: self.failures.load(Ordering::Acquire),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    TimedOut,
    Shutdown,
    NodeClosed,
}

/// Runs until the peer times out, the node closes or `shutdown` fires. `on_ping` sees
/// every ping after it was handed to the node. Send errors on an open node count as
/// missed beats.
pub(crate) async fn drive<F>(
    state: &HeartbeatState,
    node: &Node,
    slice: Duration,
    mut shutdown: Shutdown,
    mut on_ping: F,
) -> HeartbeatExit
where
    F: FnMut(&HeartBeat),
{
    debug!(
        "heartbeat driver for {} started, period {:?}, max failures {}",
        node,
        state.period(),
        state.max_failures()
    );
    loop {
        match state.tick(node.handle()) {
            HeartbeatTick::TimedOut { failures } => {
                warn!("{} missed {} heartbeats, giving up", node, failures);
                return HeartbeatExit::TimedOut;
            }
            HeartbeatTick::Ping(beat) => {
                match node.send_control(ControlKind::Heart, &beat.encode()) {
                    Ok(_) => on_ping(&beat),
                    Err(e) if matches!(e, AppError::NodeClosed(_)) || !node.is_open() => {
                        debug!("heartbeat on {} stopped, node closed", node);
                        return HeartbeatExit::NodeClosed;
                    }
                    // a lost ping is just a missed acknowledgement for the next tick
                    Err(e) => warn!("heartbeat send on {} failed: {}", node, e),
                }
            }
        }

        let deadline = Instant::now() + state.period();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::select! {
                _ = shutdown.recv() => return HeartbeatExit::Shutdown,
                _ = sleep(slice.min(deadline - now)) => {}
            }
        }
    }
}
