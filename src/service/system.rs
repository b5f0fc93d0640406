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

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info};

use crate::network::NodeId;

thread_local! {
    static CURRENT_ENGINE: Cell<u64> = const { Cell::new(0) };
}

/// Marks the calling thread as belonging to engine `engine_id`.
pub(crate) fn enter_engine(engine_id: u64) {
    CURRENT_ENGINE.with(|current| current.set(engine_id));
}

/// True when called from one of engine `engine_id`'s own threads, e.g. from inside a sink.
pub(crate) fn on_engine_thread(engine_id: u64) -> bool {
    CURRENT_ENGINE.with(|current| current.get() == engine_id)
}

struct SystemInner {
    cpu_count: usize,
    next_node_id: AtomicU64,
    next_engine_id: AtomicU64,
}

impl Drop for SystemInner {
    fn drop(&mut self) {
        debug!("network system released");
    }
}

/// Process-wide network context, created once at the composition root and handed to
/// every engine.
#[derive(Clone)]
pub struct NetSystem {
    inner: Arc<SystemInner>,
}

impl NetSystem {
    pub fn init() -> NetSystem {
        let cpu_count = num_cpus::get();
        info!("network system initialized, {} logical cpus", cpu_count);
        NetSystem {
            inner: Arc::new(SystemInner {
                cpu_count,
                next_node_id: AtomicU64::new(1),
                next_engine_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.inner.cpu_count
    }

    /// Size of the completion reactor's worker pool.
    pub fn completion_workers(&self) -> usize {
        (self.inner.cpu_count * 2).max(2)
    }

    pub(crate) fn next_node_id(&self) -> NodeId {
        self.inner.next_node_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_engine_id(&self) -> u64 {
        self.inner.next_engine_id.fetch_add(1, Ordering::Relaxed)
    }

    /// A random non-zero node handle.
    pub(crate) fn next_handle(&self) -> u32 {
        rand::thread_rng().gen_range(1..=u32::MAX)
    }
}

impl std::fmt::Debug for NetSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetSystem")
            .field("cpu_count", &self.inner.cpu_count)
            .finish()
    }
}
