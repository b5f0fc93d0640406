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

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::network::{Node, NodeId};
use crate::AppError::NodeClosed;
use crate::AppResult;

use super::sink::{EventSink, NetEvent};

pub type UserData = Arc<dyn Any + Send + Sync>;

/// The live connections of one server engine.
///
/// Every mutation happens under a single mutex. A node is torn down by whichever caller
/// removes it from the map first; later removals of the same id are no-ops, so racing
/// workers produce exactly one Quit event per node. Quit is emitted after the lock is
/// released so sinks may call back into the registry.
pub struct Registry {
    nodes: Mutex<BTreeMap<NodeId, Node>>,
    user_data: DashMap<NodeId, UserData>,
    events: Arc<dyn EventSink>,
}

impl Registry {
    pub fn new(events: Arc<dyn EventSink>) -> Registry {
        Registry {
            nodes: Mutex::new(BTreeMap::new()),
            user_data: DashMap::new(),
            events,
        }
    }

    pub fn add(&self, node: Node) {
        trace!("registry add {}", node);
        self.nodes.lock().insert(node.id(), node);
    }

    /// Removes and tears down `id`. Returns true only for the call that did the teardown.
    pub fn remove(&self, id: NodeId) -> bool {
        let removed = self.nodes.lock().remove(&id);
        match removed {
            Some(node) => {
                self.teardown(&node);
                true
            }
            None => false,
        }
    }

    /// Drains the whole set, one Quit per node.
    pub fn remove_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.nodes.lock());
        let count = drained.len();
        for node in drained.into_values() {
            self.teardown(&node);
        }
        if count > 0 {
            debug!("registry drained {} nodes", count);
        }
        count
    }

    fn teardown(&self, node: &Node) {
        node.close();
        self.user_data.remove(&node.id());
        self.events.on_event(node, NetEvent::Quit(node.to_string()));
    }

    pub fn get(&self, id: NodeId) -> Option<Node> {
        self.nodes.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.lock().contains_key(&id)
    }

    /// A stable copy of the live set, ordered by node id.
    pub fn snapshot(&self) -> Vec<Node> {
        self.nodes.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Attaches opaque application data to a live node. It is dropped with the node.
    pub fn set_user_data(&self, id: NodeId, data: UserData) -> AppResult<()> {
        let nodes = self.nodes.lock();
        if !nodes.contains_key(&id) {
            return Err(NodeClosed(format!("node {} is not registered", id)));
        }
        self.user_data.insert(id, data);
        Ok(())
    }

    pub fn user_data(&self, id: NodeId) -> Option<UserData> {
        self.user_data.get(&id).map(|entry| entry.value().clone())
    }
}
