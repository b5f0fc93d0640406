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

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Engine lifecycle. `Stopped` may be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    Starting = 1,
    Ready = 2,
    Running = 3,
    Stopping = 4,
    Stopped = 5,
}

impl EngineState {
    fn from_u8(value: u8) -> EngineState {
        match value {
            0 => EngineState::Idle,
            1 => EngineState::Starting,
            2 => EngineState::Ready,
            3 => EngineState::Running,
            4 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }

    /// Whether the engine currently owns an open socket or a thread.
    pub fn is_active(self) -> bool {
        !matches!(self, EngineState::Idle | EngineState::Stopped)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> StateCell {
        StateCell(AtomicU8::new(EngineState::Idle as u8))
    }

    pub fn get(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims the engine for a start attempt; fails unless it is idle or stopped.
    pub fn begin_start(&self) -> bool {
        self.transition(EngineState::Idle, EngineState::Starting)
            || self.transition(EngineState::Stopped, EngineState::Starting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_claims_once() {
        let cell = StateCell::new();
        assert!(cell.begin_start());
        assert!(!cell.begin_start());
        cell.set(EngineState::Running);
        assert!(cell.get().is_active());
        assert!(!cell.transition(EngineState::Ready, EngineState::Stopping));
        assert!(cell.transition(EngineState::Running, EngineState::Stopping));
        cell.set(EngineState::Stopped);
        assert!(cell.begin_start());
        assert_eq!(cell.get(), EngineState::Starting);
    }
}
